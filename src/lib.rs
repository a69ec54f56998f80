//! # tickws
//!
//! A low-allocation WebSocket ([RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455))
//! client with permessage-deflate ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692))
//! decompression, built for latency-sensitive consumers of streaming market
//! data.
//!
//! The receive path is allocation-free at steady state: payloads stream
//! into pooled, reusable buffers and [`WsClient::receive`] hands back a
//! borrowed view that stays valid until the next receive. Outbound frames
//! are masked into a rented scratch buffer so caller payloads are never
//! copied twice or mutated.
//!
//! ```no_run
//! use tickws::{CancellationToken, Options, Received, WsClient};
//!
//! #[tokio::main]
//! async fn main() -> tickws::Result<()> {
//!     let cancel = CancellationToken::new();
//!     let mut ws = WsClient::connect(
//!         "wss://stream.example.com/trades".parse().unwrap(),
//!         Options::default().with_compression(),
//!         &cancel,
//!     )
//!     .await?;
//!
//!     while let Received::Message { payload, .. } = ws.receive(&cancel).await? {
//!         println!("{} bytes", payload.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod close;
pub mod frame;
pub mod options;

mod buffer;
mod client;
mod codec;
mod compression;
mod handshake;
mod mask;
mod stream;

use thiserror::Error;

pub use client::{Received, State, WsClient, WsSender};
pub use close::CloseCode;
pub use compression::NegotiatedDeflate;
pub use frame::OpCode;
pub use options::{DeflateConfig, KeepAlive, Options, ProxyConfig};
pub use stream::{MaybeTlsStream, Transport};
pub use tokio_util::sync::CancellationToken;

/// A result type for WebSocket operations, using [`WsError`] as the error
/// type.
pub type Result<T> = std::result::Result<T, WsError>;

/// Broad category of a [`WsError`], for callers that dispatch on failure
/// class rather than on the precise variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An option value that can never work (window bits out of range, ping
    /// payload too large, zero-sized buffer). Reported synchronously,
    /// before any I/O.
    Configuration,
    /// The operation is not valid in the connection's current state, e.g.
    /// sending after a Close went out.
    Usage,
    /// The peer (or a proxy) violated RFC 6455, RFC 7692, or the HTTP
    /// upgrade contract. The connection is aborted.
    Protocol,
    /// The underlying stream failed: DNS, TCP, TLS, or plain I/O.
    Transport,
    /// A cancellation token fired between suspension points.
    Cancelled,
    /// Compression was requested but the deflate decoder is unusable in
    /// this process.
    CompressionUnavailable,
}

/// Errors that can occur during WebSocket operations.
///
/// Variants are deliberately granular, since protocol tooling wants to
/// know exactly which rule broke. [`WsError::kind`] collapses them into the
/// six [`ErrorKind`] classes for coarse handling.
#[derive(Error, Debug)]
pub enum WsError {
    /// Only `ws://` and `wss://` URIs can be connected.
    #[error("invalid websocket scheme")]
    InvalidScheme,

    /// The URI has no host component.
    #[error("url has no host")]
    MissingHost,

    /// A permessage-deflate window size outside 8..=15 was configured.
    #[error("max_window_bits out of range: {0}")]
    InvalidWindowBits(u8),

    /// Ping payloads (keep-alive or explicit) are limited to 125 bytes by
    /// RFC 6455 §5.5.
    #[error("ping payload exceeds 125 bytes")]
    PingPayloadTooLarge,

    /// The keep-alive interval must be non-zero.
    #[error("keep-alive interval must be positive")]
    ZeroPingInterval,

    /// A buffer size option was zero.
    #[error("buffer size option {0} must be non-zero")]
    InvalidBufferSize(&'static str),

    /// The close code is reserved or outside the sendable ranges
    /// (see RFC 6455 §7.4).
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// A close reason must fit in 123 bytes so code + reason stay within
    /// the 125-byte control payload limit.
    #[error("close reason exceeds 123 bytes")]
    CloseReasonTooLarge,

    /// The connection is closed (or aborted); no further operations are
    /// possible.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A Close frame was already emitted; it is the last frame this client
    /// sends.
    #[error("close already sent")]
    Closing,

    /// Reserved header bits RSV2/RSV3 were set.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// The frame opcode is one of the reserved values.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A control frame arrived with FIN clear; RFC 6455 forbids
    /// fragmenting them.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame announced more than 125 payload bytes.
    #[error("control frame too large")]
    ControlFrameTooLarge,

    /// A frame or assembled message exceeds `max_message_bytes`.
    #[error("message exceeds the configured size limit")]
    MessageTooLarge,

    /// The server sent a masked frame; servers must not mask
    /// (RFC 6455 §5.1).
    #[error("unexpected masked frame from server")]
    UnexpectedMaskedFrame,

    /// RSV1 appeared on a control or continuation frame, where per-message
    /// compression can never apply.
    #[error("unexpected compressed frame")]
    UnexpectedCompressedFrame,

    /// A new data message started while a fragmented one was still open.
    #[error("invalid fragment")]
    InvalidFragment,

    /// A continuation frame arrived with no fragmented message in
    /// progress.
    #[error("invalid continuation frame")]
    InvalidContinuationFrame,

    /// The peer compressed a message but permessage-deflate was not
    /// negotiated on this connection.
    #[error("received compressed frame but compression was not negotiated")]
    CompressionNotNegotiated,

    /// A Close frame carried a 1-byte payload, which can hold neither a
    /// code nor nothing.
    #[error("invalid close frame")]
    InvalidCloseFrame,

    /// A text payload or close reason is not valid UTF-8.
    #[error("invalid UTF-8")]
    InvalidUTF8,

    /// The compressed stream could not be inflated.
    #[error("corrupt deflate stream")]
    CorruptDeflateStream,

    /// The upgrade response status was not `101 Switching Protocols`.
    #[error("invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The `Upgrade` header is missing or not `websocket`.
    #[error("invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The `Connection` header is missing or does not contain `Upgrade`.
    #[error("invalid connection header")]
    InvalidConnectionHeader,

    /// The server's `Sec-WebSocket-Accept` does not match our key.
    #[error("websocket accept key mismatch")]
    AcceptKeyMismatch,

    /// The proxy refused the CONNECT tunnel.
    #[error("proxy refused tunnel: status {0}")]
    ProxyHandshakeFailed(u16),

    /// The HTTP response head outgrew `handshake_buffer_size`.
    #[error("handshake response too large")]
    HandshakeTooLarge,

    /// The HTTP response could not be parsed at all.
    #[error("malformed http response")]
    MalformedHttpResponse,

    /// The server selected an extension this client never offered.
    #[error("server selected an extension that was not offered")]
    UnexpectedExtension,

    /// The peer closed the stream mid-frame or mid-handshake.
    #[error("connection closed unexpectedly")]
    UnexpectedEof,

    /// A cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Compression was enabled but the deflate decoder failed its
    /// self-check.
    #[error("compression support unavailable")]
    CompressionUnavailable,

    /// DNS resolution returned no usable address.
    #[error("dns resolution failed for {0}")]
    DnsResolve(String),

    /// Wraps I/O errors from the transport, including TLS.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// The broad failure class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WsError::InvalidScheme
            | WsError::MissingHost
            | WsError::InvalidWindowBits(_)
            | WsError::PingPayloadTooLarge
            | WsError::ZeroPingInterval
            | WsError::InvalidBufferSize(_)
            | WsError::InvalidCloseCode(_)
            | WsError::CloseReasonTooLarge => ErrorKind::Configuration,

            WsError::ConnectionClosed | WsError::Closing => ErrorKind::Usage,

            WsError::ReservedBitsNotZero
            | WsError::InvalidOpCode(_)
            | WsError::ControlFrameFragmented
            | WsError::ControlFrameTooLarge
            | WsError::MessageTooLarge
            | WsError::UnexpectedMaskedFrame
            | WsError::UnexpectedCompressedFrame
            | WsError::InvalidFragment
            | WsError::InvalidContinuationFrame
            | WsError::CompressionNotNegotiated
            | WsError::InvalidCloseFrame
            | WsError::InvalidUTF8
            | WsError::CorruptDeflateStream
            | WsError::InvalidStatusCode(_)
            | WsError::InvalidUpgradeHeader
            | WsError::InvalidConnectionHeader
            | WsError::AcceptKeyMismatch
            | WsError::ProxyHandshakeFailed(_)
            | WsError::HandshakeTooLarge
            | WsError::MalformedHttpResponse
            | WsError::UnexpectedExtension
            | WsError::UnexpectedEof => ErrorKind::Protocol,

            WsError::Cancelled => ErrorKind::Cancelled,

            WsError::CompressionUnavailable => ErrorKind::CompressionUnavailable,

            WsError::DnsResolve(_) | WsError::Io(_) => ErrorKind::Transport,
        }
    }
}
