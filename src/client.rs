//! The public client: connection lifecycle, the receive pipeline, control
//! dispatch, and the keep-alive pinger.
//!
//! # Operation paths
//!
//! There are exactly two: one receive, driven through [`WsClient::receive`]
//! (`&mut self`, so a second concurrent receive cannot be written), and any
//! number of senders serialized by the internal send lock. [`WsSender`] is a
//! cheap clone sharing that lock, so pings and sends can come from other
//! tasks while one task owns the receive path. The auto-pong, the close
//! echo, and the keep-alive pinger all go through the same lock, which is
//! what guarantees frame-boundary atomicity on the wire.
//!
//! # Views
//!
//! [`Received`] borrows the client's internal buffers. The borrow checker
//! pins its lifetime to the next `receive` call, which is exactly the
//! validity window of the contract, with no copy per message.
//!
//! # Cancellation
//!
//! Every operation takes a [`CancellationToken`]. A receive cancelled
//! mid-frame is harmless: decode state is kept, and the next receive picks
//! up where it stopped. A send cancelled after its first header byte leaves
//! a torn frame on the wire, so the client transitions to `Aborted` and the
//! transport is disposed.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::buffer::MessageAssembler;
use crate::close::CloseCode;
use crate::codec::{FrameReader, FrameWriter};
use crate::compression::{self, Inflater, NegotiatedDeflate};
use crate::frame::{OpCode, MAX_CONTROL_PAYLOAD};
use crate::handshake::{self, Established};
use crate::options::{KeepAlive, Options};
use crate::stream::Transport;
use crate::{ErrorKind, Result, WsError};

/// Connection life-cycle state.
///
/// `Connecting` is only ever observable from inside `connect`; a `WsClient`
/// in hand starts at `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Connecting = 0,
    Open = 1,
    /// We emitted a Close; awaiting the peer's.
    CloseSent = 2,
    /// The peer's Close arrived before ours went out.
    CloseReceived = 3,
    Closed = 4,
    /// A fatal protocol or transport failure tore the connection down.
    Aborted = 5,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Open,
            2 => State::CloseSent,
            3 => State::CloseReceived,
            4 => State::Closed,
            _ => State::Aborted,
        }
    }
}

/// One result of [`WsClient::receive`].
///
/// Both variants borrow the client's internal buffers and are valid until
/// the next call that enters the receive path.
#[derive(Debug)]
pub enum Received<'c> {
    /// A complete application message, assembled and (if the peer
    /// compressed it) inflated.
    Message {
        /// `Text` or `Binary`, the opcode that opened the message.
        opcode: OpCode,
        payload: &'c [u8],
    },
    /// The peer closed the connection. The echo has already been sent and
    /// the transport disposed by the time this is returned.
    Close {
        code: Option<CloseCode>,
        reason: Option<&'c str>,
    },
}

/// Outcome of the receive loop before views are materialized.
enum RawMessage {
    Data { opcode: OpCode, inflated: bool },
    Close { code: Option<CloseCode> },
}

/// State shared between the client, its senders, and the pinger task.
struct Shared {
    /// The send lock. Whoever holds it owns the wire until the frame is
    /// fully flushed.
    writer: tokio::sync::Mutex<FrameWriter>,
    state: AtomicU8,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    /// Teardown latch: the first setter disposes the transport.
    closing: AtomicBool,
    pinger_cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, next: State) {
        log::trace!("state -> {:?}", next);
        self.state.store(next as u8, Ordering::Release);
    }

    /// Sends one data or control frame under the send lock.
    async fn send_frame(
        &self,
        fin: bool,
        opcode: OpCode,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(WsError::ConnectionClosed);
        }

        let mut writer = tokio::select! {
            _ = cancel.cancelled() => return Err(WsError::Cancelled),
            guard = self.writer.lock() => guard,
        };

        // Checked under the lock: a Close that won the race is final.
        if self.close_sent.load(Ordering::Acquire) {
            return Err(WsError::Closing);
        }

        self.send_frame_locked(&mut writer, fin, opcode, payload, cancel)
            .await
    }

    /// The lock is held; emit the frame, aborting the connection if the
    /// emission is torn by cancellation or a transport failure.
    async fn send_frame_locked(
        &self,
        writer: &mut FrameWriter,
        fin: bool,
        opcode: OpCode,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let outcome = {
            let fut = writer.send_frame(fin, opcode, payload);
            tokio::pin!(fut);
            tokio::select! {
                _ = cancel.cancelled() => None,
                res = &mut fut => Some(res),
            }
        };

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(err)) => {
                self.abort_locked(writer).await;
                Err(err)
            }
            None => {
                if writer.is_mid_frame() {
                    // Partial header or payload on the wire: framing is
                    // gone, the connection cannot be salvaged.
                    self.abort_locked(writer).await;
                }
                Err(WsError::Cancelled)
            }
        }
    }

    /// Emits the Close frame and flips the connection into its half-closed
    /// (or fully closed) state.
    async fn send_close(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(WsError::ConnectionClosed);
        }

        let mut writer = tokio::select! {
            _ = cancel.cancelled() => return Err(WsError::Cancelled),
            guard = self.writer.lock() => guard,
        };

        if self.close_sent.load(Ordering::Acquire) {
            return Err(WsError::Closing);
        }

        self.send_frame_locked(&mut writer, true, OpCode::Close, payload, cancel)
            .await?;
        self.close_sent.store(true, Ordering::Release);
        log::debug!("close sent");

        if self.close_received.load(Ordering::Acquire) {
            self.set_state(State::Closed);
            self.dispose(&mut writer).await;
        } else {
            self.set_state(State::CloseSent);
        }

        Ok(())
    }

    async fn abort_locked(&self, writer: &mut FrameWriter) {
        self.set_state(State::Aborted);
        self.dispose(writer).await;
    }

    /// Idempotent teardown: stop the pinger and shut the transport down.
    async fn dispose(&self, writer: &mut FrameWriter) {
        self.pinger_cancel.cancel();
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = writer.shutdown().await;
        }
    }
}

/// Cloneable sending handle for a [`WsClient`].
///
/// All senders share the client's send lock, so frames from different tasks
/// never interleave mid-frame.
#[derive(Clone)]
pub struct WsSender {
    shared: Arc<Shared>,
}

impl WsSender {
    /// Sends one unfragmented Binary message.
    pub async fn send_binary(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.shared
            .send_frame(true, OpCode::Binary, payload, cancel)
            .await
    }

    /// Sends one unfragmented Text message.
    pub async fn send_text(&self, payload: &str, cancel: &CancellationToken) -> Result<()> {
        self.shared
            .send_frame(true, OpCode::Text, payload.as_bytes(), cancel)
            .await
    }

    /// Sends a Ping. Payload is capped at 125 bytes.
    pub async fn send_ping(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::PingPayloadTooLarge);
        }
        self.shared
            .send_frame(true, OpCode::Ping, payload, cancel)
            .await
    }

    /// Sends a Pong, for manual liveness replies when auto-pong is off.
    pub async fn send_pong(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::PingPayloadTooLarge);
        }
        self.shared
            .send_frame(true, OpCode::Pong, payload, cancel)
            .await
    }

    /// Emits a Close frame without waiting for the peer's reply.
    ///
    /// Every later send fails; the receive path stays usable until the
    /// remote Close arrives.
    pub async fn close_output(
        &self,
        code: CloseCode,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = close_payload(code, reason)?;
        self.shared.send_close(&payload, cancel).await
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }
}

/// Validates and renders an outbound Close payload: 2-byte code plus a
/// reason of at most 123 UTF-8 bytes.
fn close_payload(code: CloseCode, reason: &str) -> Result<Vec<u8>> {
    if !code.is_allowed() {
        return Err(WsError::InvalidCloseCode(code.into()));
    }
    if reason.len() > MAX_CONTROL_PAYLOAD - 2 {
        return Err(WsError::CloseReasonTooLarge);
    }

    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    Ok(payload)
}

/// A WebSocket client connection.
///
/// Created by [`WsClient::connect`]; already `Open` when in hand. Receive
/// with [`WsClient::receive`], send through the inherent helpers or a
/// [`WsSender`] clone, and shut down with [`WsClient::close`] (full closing
/// handshake) or [`WsSender::close_output`] (fire-and-forget Close).
///
/// ```no_run
/// use tickws::{CancellationToken, Options, Received, WsClient};
///
/// # async fn demo() -> tickws::Result<()> {
/// let cancel = CancellationToken::new();
/// let mut ws = WsClient::connect(
///     "wss://stream.example.com/trades".parse().unwrap(),
///     Options::default().with_compression(),
///     &cancel,
/// )
/// .await?;
///
/// loop {
///     match ws.receive(&cancel).await? {
///         Received::Message { payload, .. } => println!("{}", payload.len()),
///         Received::Close { code, .. } => {
///             println!("closed: {:?}", code);
///             break;
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct WsClient {
    reader: FrameReader,
    data: MessageAssembler,
    control: MessageAssembler,
    inflater: Option<Inflater>,
    negotiated: Option<NegotiatedDeflate>,
    shared: Arc<Shared>,
    pinger: Option<JoinHandle<()>>,
    auto_pong: bool,
    check_utf8: bool,
    max_message_bytes: usize,
    tls: bool,
}

impl WsClient {
    /// Resolves, connects, tunnels, upgrades, and returns an `Open` client.
    ///
    /// Validates the options and, when compression is requested, the
    /// availability of the deflate decoder before any I/O. A failed or
    /// cancelled handshake disposes the transport on the way out.
    pub async fn connect(url: Url, options: Options, cancel: &CancellationToken) -> Result<WsClient> {
        options.validate()?;
        if options.compression.is_some() && !compression::deflate_supported() {
            return Err(WsError::CompressionUnavailable);
        }

        log::debug!("connecting to {url}");
        let established = tokio::select! {
            _ = cancel.cancelled() => return Err(WsError::Cancelled),
            res = handshake::establish(&url, &options) => res?,
        };

        Ok(Self::from_established(established, &options))
    }

    fn from_established(established: Established, options: &Options) -> WsClient {
        let Established {
            transport,
            negotiated,
            leftover,
            tls,
        } = established;
        Self::from_parts(transport, leftover, negotiated, options, tls)
    }

    /// Assembles a client around an already-upgraded transport.
    pub(crate) fn from_parts(
        transport: Box<dyn Transport>,
        leftover: BytesMut,
        negotiated: Option<NegotiatedDeflate>,
        options: &Options,
        tls: bool,
    ) -> WsClient {
        let (read, write) = tokio::io::split(transport);
        let reader = FrameReader::new(read, leftover, options);
        let writer = FrameWriter::new(write, options);

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            state: AtomicU8::new(State::Open as u8),
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            pinger_cancel: CancellationToken::new(),
        });

        let pinger = options
            .keep_alive
            .clone()
            .map(|config| spawn_pinger(Arc::clone(&shared), config));

        log::debug!(
            "connection open (tls={tls}, compression={})",
            negotiated.is_some()
        );

        WsClient {
            reader,
            data: MessageAssembler::with_capacity(options.message_buffer_size),
            control: MessageAssembler::with_capacity(options.control_buffer_size),
            inflater: negotiated
                .as_ref()
                .map(|negotiated| Inflater::new(negotiated, options.inflate_buffer_size)),
            negotiated,
            shared,
            pinger,
            auto_pong: options.auto_pong_on_ping,
            check_utf8: options.check_utf8,
            max_message_bytes: options.max_message_bytes,
            tls,
        }
    }

    /// Delivers the next complete application message or the peer's Close.
    ///
    /// Control frames encountered along the way are dispatched inline:
    /// Pings get their Pong (when enabled), Pongs are consumed as liveness,
    /// a Close finishes the connection and becomes the return value.
    ///
    /// The returned views alias internal buffers and are valid until the
    /// next `receive`. A protocol or transport failure aborts the
    /// connection; cancellation does not.
    pub async fn receive(&mut self, cancel: &CancellationToken) -> Result<Received<'_>> {
        match self.state() {
            State::Closed | State::Aborted => return Err(WsError::ConnectionClosed),
            _ => {}
        }

        match self.receive_message(cancel).await {
            Ok(RawMessage::Data { opcode, inflated }) => {
                let payload = if inflated {
                    self.inflater.as_ref().map(Inflater::output).unwrap_or(&[])
                } else {
                    self.data.written()
                };
                Ok(Received::Message { opcode, payload })
            }
            Ok(RawMessage::Close { code }) => {
                let payload = self.control.written();
                let reason = if payload.len() > 2 {
                    std::str::from_utf8(&payload[2..]).ok()
                } else {
                    None
                };
                Ok(Received::Close { code, reason })
            }
            Err(err) => {
                if matches!(err.kind(), ErrorKind::Protocol | ErrorKind::Transport) {
                    self.abort().await;
                }
                Err(err)
            }
        }
    }

    /// One pass of the receive state machine: frames in, one message out.
    async fn receive_message(&mut self, cancel: &CancellationToken) -> Result<RawMessage> {
        self.data.reset();
        let mut in_fragment = false;
        let mut compressed = false;
        let mut message_opcode = OpCode::Binary;

        loop {
            let header = self.reader.read_header(cancel).await?;

            if header.opcode.is_control() {
                self.control.reset();
                self.reader.read_payload(&mut self.control, cancel).await?;

                match header.opcode {
                    OpCode::Ping => {
                        log::trace!("ping ({} bytes)", self.control.len());
                        // No pong once our Close is out: the Close frame is
                        // the last frame this client emits.
                        if self.auto_pong && !self.shared.close_sent.load(Ordering::Acquire) {
                            match self
                                .shared
                                .send_frame(true, OpCode::Pong, self.control.written(), cancel)
                                .await
                            {
                                Ok(()) => {}
                                // A Close emitted from another task between
                                // the check and the send wins; drop the pong.
                                Err(WsError::Closing) => {}
                                Err(err) => return Err(err),
                            }
                        }
                    }
                    OpCode::Pong => {
                        log::trace!("pong ({} bytes)", self.control.len());
                    }
                    _ => return self.on_close(cancel).await,
                }
                continue;
            }

            match header.opcode {
                OpCode::Continuation => {
                    if !in_fragment {
                        return Err(WsError::InvalidContinuationFrame);
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if in_fragment {
                        return Err(WsError::InvalidFragment);
                    }
                    if header.rsv1 && self.inflater.is_none() {
                        return Err(WsError::CompressionNotNegotiated);
                    }
                    in_fragment = true;
                    compressed = header.rsv1;
                    message_opcode = header.opcode;
                }
                _ => unreachable!("control opcodes handled above"),
            }

            self.reader.read_payload(&mut self.data, cancel).await?;
            if self.data.len() > self.max_message_bytes {
                return Err(WsError::MessageTooLarge);
            }

            if header.fin {
                if compressed {
                    let inflater = self
                        .inflater
                        .as_mut()
                        .ok_or(WsError::CompressionNotNegotiated)?;
                    inflater.inflate_message(self.data.written())?;
                }

                if message_opcode == OpCode::Text && self.check_utf8 {
                    let view = if compressed {
                        self.inflater.as_ref().map(Inflater::output).unwrap_or(&[])
                    } else {
                        self.data.written()
                    };
                    if std::str::from_utf8(view).is_err() {
                        return Err(WsError::InvalidUTF8);
                    }
                }

                return Ok(RawMessage::Data {
                    opcode: message_opcode,
                    inflated: compressed,
                });
            }
        }
    }

    /// Remote Close handling: parse, echo (unless ours went first), tear
    /// down, report.
    async fn on_close(&mut self, cancel: &CancellationToken) -> Result<RawMessage> {
        let code = match self.control.len() {
            0 => None,
            1 => return Err(WsError::InvalidCloseFrame),
            _ => {
                let payload = self.control.written();
                if payload.len() > 2 && std::str::from_utf8(&payload[2..]).is_err() {
                    return Err(WsError::InvalidUTF8);
                }
                Some(CloseCode::from(u16::from_be_bytes([payload[0], payload[1]])))
            }
        };

        self.shared.close_received.store(true, Ordering::Release);
        log::debug!("close received (code={:?})", code);

        let mut writer = tokio::select! {
            _ = cancel.cancelled() => return Err(WsError::Cancelled),
            guard = self.shared.writer.lock() => guard,
        };

        if !self.shared.close_sent.swap(true, Ordering::AcqRel) {
            self.shared.set_state(State::CloseReceived);
            // Echo the peer's payload back verbatim.
            self.shared
                .send_frame_locked(&mut writer, true, OpCode::Close, self.control.written(), cancel)
                .await?;
        }

        self.shared.set_state(State::Closed);
        self.shared.dispose(&mut writer).await;

        Ok(RawMessage::Close { code })
    }

    /// Marks the connection `Aborted` and disposes the transport.
    async fn abort(&mut self) {
        self.shared.set_state(State::Aborted);
        self.shared.pinger_cancel.cancel();
        if !self.shared.closing.swap(true, Ordering::AcqRel) {
            let mut writer = self.shared.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }

    /// Runs the full closing handshake: emits a Close, then drains inbound
    /// frames until the peer's Close arrives.
    ///
    /// Data messages that race the shutdown are discarded.
    pub async fn close(
        &mut self,
        code: CloseCode,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.shared.close_sent.load(Ordering::Acquire) {
            match self.sender().close_output(code, reason, cancel).await {
                Ok(()) => {}
                // Lost the race against the receive path's echo or an
                // abort; nothing left to do but drain.
                Err(WsError::ConnectionClosed | WsError::Closing) => {}
                Err(err) => return Err(err),
            }
        }

        while !self.shared.close_received.load(Ordering::Acquire) {
            match self.receive(cancel).await {
                Ok(Received::Close { .. }) => break,
                Ok(_) => continue,
                Err(WsError::ConnectionClosed) => break,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// A cloneable sending handle sharing this client's send lock.
    pub fn sender(&self) -> WsSender {
        WsSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Sends one unfragmented Binary message.
    pub async fn send_binary(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.sender().send_binary(payload, cancel).await
    }

    /// Sends one unfragmented Text message.
    pub async fn send_text(&self, payload: &str, cancel: &CancellationToken) -> Result<()> {
        self.sender().send_text(payload, cancel).await
    }

    /// Sends a Ping with at most 125 payload bytes.
    pub async fn send_ping(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        self.sender().send_ping(payload, cancel).await
    }

    /// Emits a Close without waiting for the peer's reply.
    pub async fn close_output(
        &self,
        code: CloseCode,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.sender().close_output(code, reason, cancel).await
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// The compression parameters negotiated during the handshake, if any.
    pub fn compression(&self) -> Option<&NegotiatedDeflate> {
        self.negotiated.as_ref()
    }

    /// Whether the transport was established over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.shared.pinger_cancel.cancel();
        if let Some(pinger) = self.pinger.take() {
            pinger.abort();
        }
    }
}

/// Background keep-alive: one Ping per interval until cancelled.
///
/// Send failures are logged and swallowed; whatever broke the transport
/// surfaces to the receive caller through the next frame read.
fn spawn_pinger(shared: Arc<Shared>, config: KeepAlive) -> JoinHandle<()> {
    let token = shared.pinger_cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // swallow the interval's immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(err) = shared
                .send_frame(true, OpCode::Ping, &config.payload, &token)
                .await
            {
                log::warn!("keep-alive ping failed: {err}");
                if matches!(
                    err,
                    WsError::ConnectionClosed | WsError::Closing | WsError::Cancelled
                ) {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask;
    use flate2::{Compress, Compression, FlushCompress};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pair(options: &Options, negotiated: Option<NegotiatedDeflate>) -> (WsClient, DuplexStream) {
        let (client_end, server_end) = tokio::io::duplex(512 * 1024);
        let transport: Box<dyn Transport> = Box::new(client_end);
        let client = WsClient::from_parts(transport, BytesMut::new(), negotiated, options, false);
        (client, server_end)
    }

    fn plain_deflate() -> NegotiatedDeflate {
        NegotiatedDeflate {
            client_no_context_takeover: false,
            server_no_context_takeover: false,
            client_max_window_bits: 15,
            server_max_window_bits: 15,
        }
    }

    /// An unmasked frame as a compliant server would send it.
    fn server_frame(fin: bool, rsv1: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 10);
        out.push((fin as u8) << 7 | (rsv1 as u8) << 6 | opcode);
        if payload.len() < 126 {
            out.push(payload.len() as u8);
        } else if payload.len() < 65536 {
            out.push(126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            out.push(127);
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        out.extend_from_slice(payload);
        out
    }

    /// Reads one whole client frame off the server end, unmasking it.
    async fn recv_client_frame(server: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1] & 0x80, 0x80, "client frames must be masked");

        let len = match head[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                server.read_exact(&mut ext).await.unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                server.read_exact(&mut ext).await.unwrap();
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };

        let mut key = [0u8; 4];
        server.read_exact(&mut key).await.unwrap();
        let mut payload = vec![0u8; len];
        server.read_exact(&mut payload).await.unwrap();
        mask::apply_mask(&mut payload, key, 0);

        (head[0], payload)
    }

    /// Deflates the way a permessage-deflate server would: sync flush with
    /// the trailing `00 00 FF FF` stripped.
    fn deflate_message(compressor: &mut Compress, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 64);
        compressor
            .compress_vec(data, &mut out, FlushCompress::None)
            .unwrap();
        compressor
            .compress_vec(&[], &mut out, FlushCompress::Sync)
            .unwrap();
        out.truncate(out.len() - 4);
        out
    }

    #[tokio::test]
    async fn test_receive_unfragmented_text() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server
            .write_all(&server_frame(true, false, 0x1, b"hello"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Message { opcode, payload } => {
                assert_eq!(opcode, OpCode::Text);
                assert_eq!(payload, b"hello");
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn test_receive_fragmented_binary() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server
            .write_all(&server_frame(false, false, 0x2, &[0x01, 0x02]))
            .await
            .unwrap();
        server
            .write_all(&server_frame(true, false, 0x0, &[0x03, 0x04]))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Message { opcode, payload } => {
                assert_eq!(opcode, OpCode::Binary);
                assert_eq!(payload, &[0x01, 0x02, 0x03, 0x04]);
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_between_fragments_gets_ponged() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server
            .write_all(&server_frame(false, false, 0x2, &[0x01, 0x02]))
            .await
            .unwrap();
        server
            .write_all(&server_frame(true, false, 0x9, &[0x70, 0x69]))
            .await
            .unwrap();
        server
            .write_all(&server_frame(true, false, 0x0, &[0x03, 0x04]))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Message { opcode, payload } => {
                assert_eq!(opcode, OpCode::Binary);
                assert_eq!(payload, &[0x01, 0x02, 0x03, 0x04]);
            }
            other => panic!("expected message, got {:?}", other),
        }

        // The pong was emitted mid-message, masked, echoing the payload.
        let (b0, payload) = recv_client_frame(&mut server).await;
        assert_eq!(b0, 0x8A);
        assert_eq!(payload, &[0x70, 0x69]);
    }

    #[tokio::test]
    async fn test_ping_without_auto_pong_is_silent() {
        let options = Options::new().without_auto_pong();
        let (mut client, mut server) = pair(&options, None);
        server
            .write_all(&server_frame(true, false, 0x9, b"hb"))
            .await
            .unwrap();
        server
            .write_all(&server_frame(true, false, 0x1, b"data"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Message { payload, .. } => assert_eq!(payload, b"data"),
            other => panic!("expected message, got {:?}", other),
        }

        // Nothing may have been written by the client.
        drop(client);
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "unexpected client bytes: {:?}", rest);
    }

    #[tokio::test]
    async fn test_receive_compressed_text() {
        let (mut client, mut server) = pair(&Options::new(), Some(plain_deflate()));

        let mut compressor = Compress::new(Compression::default(), false);
        let deflated = deflate_message(&mut compressor, br#"{"a":1}"#);
        server
            .write_all(&server_frame(true, true, 0x1, &deflated))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Message { opcode, payload } => {
                assert_eq!(opcode, OpCode::Text);
                assert_eq!(payload, br#"{"a":1}"#);
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_compressed_fragmented_message() {
        let (mut client, mut server) = pair(&Options::new(), Some(plain_deflate()));

        let mut compressor = Compress::new(Compression::default(), false);
        let deflated = deflate_message(&mut compressor, b"split across frames");
        let (a, b) = deflated.split_at(deflated.len() / 2);

        // RSV1 on the first frame only.
        server.write_all(&server_frame(false, true, 0x1, a)).await.unwrap();
        server.write_all(&server_frame(true, false, 0x0, b)).await.unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Message { payload, .. } => assert_eq!(payload, b"split across frames"),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rsv1_without_negotiation_aborts() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server
            .write_all(&server_frame(true, true, 0x1, b"x"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::CompressionNotNegotiated)));
        assert_eq!(client.state(), State::Aborted);

        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_with_code_is_echoed() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server
            .write_all(&server_frame(true, false, 0x8, &[0x03, 0xE8]))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Close { code, reason } => {
                assert_eq!(code, Some(CloseCode::Normal));
                assert_eq!(reason, None);
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(client.state(), State::Closed);

        let (b0, payload) = recv_client_frame(&mut server).await;
        assert_eq!(b0, 0x88);
        assert_eq!(payload, &[0x03, 0xE8]);

        // Dead afterwards, both directions.
        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::ConnectionClosed)));
        let res = client.send_binary(b"late", &cancel).await;
        assert!(matches!(res, Err(WsError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_close_with_reason() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server
            .write_all(&server_frame(true, false, 0x8, b"\x03\xE9bye"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Close { code, reason } => {
                assert_eq!(code, Some(CloseCode::Away));
                assert_eq!(reason, Some("bye"));
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_empty_payload() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server.write_all(&server_frame(true, false, 0x8, &[])).await.unwrap();

        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Close { code, reason } => {
                assert_eq!(code, None);
                assert_eq!(reason, None);
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_one_byte_payload_is_protocol_error() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server.write_all(&server_frame(true, false, 0x8, &[0x03])).await.unwrap();

        let cancel = CancellationToken::new();
        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::InvalidCloseFrame)));
        assert_eq!(client.state(), State::Aborted);
    }

    #[tokio::test]
    async fn test_send_large_binary_uses_64bit_length() {
        let (client, mut server) = pair(&Options::new(), None);
        let payload = vec![0x11u8; 200_000];

        let cancel = CancellationToken::new();
        let send = client.send_binary(&payload, &cancel);
        let recv = recv_client_frame(&mut server);
        let (sent, (b0, received)) = tokio::join!(send, recv);
        sent.unwrap();

        assert_eq!(b0, 0x82);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_send_after_close_output_fails() {
        let (client, mut server) = pair(&Options::new(), None);
        let cancel = CancellationToken::new();

        client
            .close_output(CloseCode::Normal, "done", &cancel)
            .await
            .unwrap();
        assert_eq!(client.state(), State::CloseSent);

        let res = client.send_binary(b"after", &cancel).await;
        assert!(matches!(res, Err(WsError::Closing)));

        let (b0, payload) = recv_client_frame(&mut server).await;
        assert_eq!(b0, 0x88);
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"done");
    }

    #[tokio::test]
    async fn test_close_output_validates_codes() {
        let (client, _server) = pair(&Options::new(), None);
        let cancel = CancellationToken::new();

        for code in [1005u16, 1006, 1015, 999, 1016, 2999, 5000] {
            let res = client
                .close_output(CloseCode::from(code), "", &cancel)
                .await;
            assert!(
                matches!(res, Err(WsError::InvalidCloseCode(c)) if c == code),
                "code {} must be rejected",
                code
            );
        }

        let long_reason = "x".repeat(124);
        let res = client
            .close_output(CloseCode::Normal, &long_reason, &cancel)
            .await;
        assert!(matches!(res, Err(WsError::CloseReasonTooLarge)));
    }

    #[tokio::test]
    async fn test_ping_payload_cap() {
        let (client, _server) = pair(&Options::new(), None);
        let cancel = CancellationToken::new();

        let res = client.send_ping(&[0u8; 126], &cancel).await;
        assert!(matches!(res, Err(WsError::PingPayloadTooLarge)));
    }

    #[tokio::test]
    async fn test_continuation_without_start_aborts() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server.write_all(&server_frame(true, false, 0x0, b"??")).await.unwrap();

        let cancel = CancellationToken::new();
        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::InvalidContinuationFrame)));
        assert_eq!(client.state(), State::Aborted);
    }

    #[tokio::test]
    async fn test_new_data_frame_inside_fragment_aborts() {
        let (mut client, mut server) = pair(&Options::new(), None);
        server.write_all(&server_frame(false, false, 0x2, b"ab")).await.unwrap();
        server.write_all(&server_frame(true, false, 0x1, b"cd")).await.unwrap();

        let cancel = CancellationToken::new();
        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::InvalidFragment)));
    }

    #[tokio::test]
    async fn test_fragment_total_above_limit_aborts() {
        let mut options = Options::new();
        options.max_message_bytes = 16;
        let (mut client, mut server) = pair(&options, None);

        server.write_all(&server_frame(false, false, 0x2, &[0u8; 10])).await.unwrap();
        server.write_all(&server_frame(true, false, 0x0, &[0u8; 10])).await.unwrap();

        let cancel = CancellationToken::new();
        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::MessageTooLarge)));
    }

    #[tokio::test]
    async fn test_cancelled_receive_leaves_connection_usable() {
        let (mut client, mut server) = pair(&Options::new(), None);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let res = client.receive(&cancelled).await;
        assert!(matches!(res, Err(WsError::Cancelled)));
        assert!(client.is_open());

        server.write_all(&server_frame(true, false, 0x1, b"still here")).await.unwrap();
        let cancel = CancellationToken::new();
        match client.receive(&cancel).await.unwrap() {
            Received::Message { payload, .. } => assert_eq!(payload, b"still here"),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_utf8_validation_on_text() {
        let options = Options::new().with_utf8();
        let (mut client, mut server) = pair(&options, None);
        server
            .write_all(&server_frame(true, false, 0x1, &[0xFF, 0xFE, 0xFD]))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::InvalidUTF8)));
    }

    #[tokio::test]
    async fn test_full_close_handshake() {
        let (mut client, mut server) = pair(&Options::new(), None);
        let cancel = CancellationToken::new();

        let server_task = tokio::spawn(async move {
            // Late data the closing client must discard.
            server
                .write_all(&server_frame(true, false, 0x1, b"straggler"))
                .await
                .unwrap();
            let (b0, payload) = recv_client_frame(&mut server).await;
            assert_eq!(b0, 0x88);
            // Reply with the mirrored close.
            let frame = server_frame(true, false, 0x8, &payload);
            server.write_all(&frame).await.unwrap();
            server
        });

        client.close(CloseCode::Normal, "done", &cancel).await.unwrap();
        assert_eq!(client.state(), State::Closed);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_pinger_sends_pings() {
        let options = Options::new().with_keep_alive(Duration::from_millis(20), b"hb".to_vec());
        let (client, mut server) = pair(&options, None);

        for _ in 0..2 {
            let (b0, payload) = recv_client_frame(&mut server).await;
            assert_eq!(b0, 0x89);
            assert_eq!(payload, b"hb");
        }
        drop(client);
    }

    #[tokio::test]
    async fn test_sender_usable_from_other_task() {
        let (mut client, mut server) = pair(&Options::new(), None);
        let sender = client.sender();
        let cancel = CancellationToken::new();

        let send_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { sender.send_text("from elsewhere", &cancel).await })
        };

        let (b0, payload) = recv_client_frame(&mut server).await;
        assert_eq!(b0, 0x81);
        assert_eq!(payload, b"from elsewhere");
        send_task.await.unwrap().unwrap();

        // Receive path still intact afterwards.
        server.write_all(&server_frame(true, false, 0x1, b"ok")).await.unwrap();
        match client.receive(&cancel).await.unwrap() {
            Received::Message { payload, .. } => assert_eq!(payload, b"ok"),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_eof_aborts() {
        let (mut client, server) = pair(&Options::new(), None);
        drop(server);

        let cancel = CancellationToken::new();
        let res = client.receive(&cancel).await;
        assert!(matches!(res, Err(WsError::UnexpectedEof)));
        assert_eq!(client.state(), State::Aborted);
    }
}
