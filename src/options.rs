//! Connection configuration.
//!
//! [`Options`] is handed to [`crate::WsClient::connect`] and immutable for
//! the life of the connection. Every field has a workable default; the
//! `with_*` builders cover the knobs that get tuned in practice. The whole
//! set is validated once at connect time, so a bad configuration fails
//! before any socket is opened.

use std::time::Duration;

use tokio_rustls::TlsConnector;

use crate::{frame::MAX_CONTROL_PAYLOAD, Result, WsError};

/// Configuration for a WebSocket client connection.
#[derive(Clone)]
pub struct Options {
    /// Scratch sizing for the frame reader's staging buffer. Reads from the
    /// transport pull in at most roughly this many bytes at a time.
    pub receive_buffer_size: usize,
    /// Scratch sizing for the frame writer's mask buffer; outbound payloads
    /// are masked and written in chunks of this size.
    pub send_buffer_size: usize,
    /// Initial capacity of the data message assembler.
    pub message_buffer_size: usize,
    /// Initial capacity of the control-frame assembler. Control payloads
    /// never exceed 125 bytes, but the assembler tolerates growth anyway.
    pub control_buffer_size: usize,
    /// Initial capacity of the inflater's output buffer.
    pub inflate_buffer_size: usize,
    /// Ceiling for the buffered HTTP handshake (and proxy) response.
    pub handshake_buffer_size: usize,
    /// Hard limit for a single frame and for an assembled message. Larger
    /// inbound traffic fails the connection before the payload is read.
    pub max_message_bytes: usize,
    /// Fail on masked server frames. RFC 6455 §5.1 forbids servers from
    /// masking; disable only to debug a misbehaving peer.
    pub reject_masked_server_frames: bool,
    /// Offer permessage-deflate with these parameters. `None` disables
    /// compression entirely.
    pub compression: Option<DeflateConfig>,
    /// Tunnel the connection through an HTTP CONNECT proxy.
    pub proxy: Option<ProxyConfig>,
    /// Reply to inbound Pings with a matching Pong automatically.
    pub auto_pong_on_ping: bool,
    /// Send periodic Pings from a background task.
    pub keep_alive: Option<KeepAlive>,
    /// Validate that Text messages hold well-formed UTF-8 after assembly
    /// and inflation.
    pub check_utf8: bool,
    /// Replaces the built-in webpki-roots TLS connector, e.g. to enable
    /// revocation checking or pin certificates.
    pub tls_connector: Option<TlsConnector>,
}

/// permessage-deflate offer parameters.
///
/// The `no_context_takeover` flags ask the respective side to reset its
/// deflate window between messages; absent window bits leave the server's
/// default of 15 in place.
#[derive(Debug, Clone, Default)]
pub struct DeflateConfig {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
    /// 8..=15 when set.
    pub client_max_window_bits: Option<u8>,
    /// 8..=15 when set.
    pub server_max_window_bits: Option<u8>,
}

/// HTTP CONNECT proxy endpoint, with optional basic-auth credentials.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Keep-alive ping schedule.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    /// Time between Pings. Must be non-zero.
    pub interval: Duration,
    /// Ping payload, at most 125 bytes.
    pub payload: Vec<u8>,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    /// Enables compression with default parameters.
    pub fn with_compression(self) -> Self {
        Self {
            compression: Some(self.compression.unwrap_or_default()),
            ..self
        }
    }

    /// Asks the server to reset its deflate context between messages,
    /// bounding the memory the connection pins on both ends.
    pub fn server_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Declares that this client resets its deflate context between
    /// messages.
    pub fn client_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Caps the server's LZ77 window at `bits` (8..=15).
    pub fn with_server_max_window_bits(self, bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_max_window_bits = Some(bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Advertises the client's LZ77 window as `bits` (8..=15).
    pub fn with_client_max_window_bits(self, bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_max_window_bits = Some(bits);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Routes the connection through an HTTP CONNECT proxy.
    pub fn with_proxy(self, host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy: Some(ProxyConfig {
                host: host.into(),
                port,
                username: None,
                password: None,
            }),
            ..self
        }
    }

    /// Adds basic-auth credentials to the proxy tunnel request.
    ///
    /// No-op unless a proxy was configured first.
    pub fn with_proxy_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        if let Some(proxy) = self.proxy.as_mut() {
            proxy.username = Some(username.into());
            proxy.password = Some(password.into());
        }
        self
    }

    /// Sends a Ping with `payload` every `interval` from a background task.
    pub fn with_keep_alive(self, interval: Duration, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            keep_alive: Some(KeepAlive {
                interval,
                payload: payload.into(),
            }),
            ..self
        }
    }

    /// Sets the per-message (and per-frame) inbound size limit.
    pub fn with_max_message_bytes(self, size: usize) -> Self {
        Self {
            max_message_bytes: size,
            ..self
        }
    }

    /// Tolerates masked frames from the server instead of failing the
    /// connection. Debugging aid only.
    pub fn accept_masked_frames(self) -> Self {
        Self {
            reject_masked_server_frames: false,
            ..self
        }
    }

    /// Disables the automatic Pong reply; inbound Pings are then consumed
    /// silently and liveness is the caller's business.
    pub fn without_auto_pong(self) -> Self {
        Self {
            auto_pong_on_ping: false,
            ..self
        }
    }

    /// Enables UTF-8 validation of Text message payloads.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Uses a caller-supplied TLS connector for `wss://` connections.
    pub fn with_tls_connector(self, connector: TlsConnector) -> Self {
        Self {
            tls_connector: Some(connector),
            ..self
        }
    }

    /// Checks the whole option set once, before any I/O happens.
    pub(crate) fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("receive_buffer_size", self.receive_buffer_size),
            ("send_buffer_size", self.send_buffer_size),
            ("message_buffer_size", self.message_buffer_size),
            ("control_buffer_size", self.control_buffer_size),
            ("inflate_buffer_size", self.inflate_buffer_size),
            ("handshake_buffer_size", self.handshake_buffer_size),
            ("max_message_bytes", self.max_message_bytes),
        ] {
            if size == 0 {
                return Err(WsError::InvalidBufferSize(name));
            }
        }

        if let Some(compression) = self.compression.as_ref() {
            for bits in [
                compression.client_max_window_bits,
                compression.server_max_window_bits,
            ]
            .into_iter()
            .flatten()
            {
                if !(8..=15).contains(&bits) {
                    return Err(WsError::InvalidWindowBits(bits));
                }
            }
        }

        if let Some(keep_alive) = self.keep_alive.as_ref() {
            if keep_alive.interval.is_zero() {
                return Err(WsError::ZeroPingInterval);
            }
            if keep_alive.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WsError::PingPayloadTooLarge);
            }
        }

        Ok(())
    }

    /// The defaults behind `Options::default()`, spelled out.
    pub fn new() -> Self {
        Self {
            receive_buffer_size: 16 * 1024,
            send_buffer_size: 16 * 1024,
            message_buffer_size: 64 * 1024,
            control_buffer_size: 256,
            inflate_buffer_size: 64 * 1024,
            handshake_buffer_size: 16 * 1024,
            max_message_bytes: 1024 * 1024,
            reject_masked_server_frames: true,
            compression: None,
            proxy: None,
            auto_pong_on_ping: true,
            keep_alive: None,
            check_utf8: false,
            tls_connector: None,
        }
    }
}
