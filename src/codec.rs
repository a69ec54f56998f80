//! Per-frame serializer and parser over the established transport.
//!
//! [`FrameReader`] decodes headers out of a staging buffer and streams
//! payload chunks, unmasked with a running key offset, straight into the
//! caller's [`MessageAssembler`], so a frame larger than the staging buffer
//! never has to fit in it. Decode progress lives in an explicit state, which
//! makes a cancelled read resumable: nothing is lost between suspension
//! points.
//!
//! [`FrameWriter`] emits one frame per call: header first, then the payload
//! copied chunk-by-chunk into a rented scratch buffer, masked in place and
//! written out. The caller's payload is never mutated.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{MessageAssembler, PooledBuf},
    frame::{self, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE},
    mask,
    options::Options,
    stream::Transport,
    Result, WsError,
};

pub(crate) type TransportRead = ReadHalf<Box<dyn Transport>>;
pub(crate) type TransportWrite = WriteHalf<Box<dyn Transport>>;

/// Where the reader stands inside the current frame.
enum ReadState {
    /// Waiting for (more of) a header.
    Header,
    /// Streaming the payload out of the staging buffer.
    Payload {
        /// Payload bytes not yet handed to the assembler.
        remaining: usize,
        /// Peer's masking key, if the frame was masked.
        mask: Option<[u8; 4]>,
        /// Position within the whole payload, for the rotating XOR key.
        offset: usize,
    },
}

/// Reads frames from the transport's read half.
pub(crate) struct FrameReader {
    io: TransportRead,
    /// Staging buffer; seeded with any bytes the server sent right after
    /// the handshake response.
    staging: BytesMut,
    state: ReadState,
    /// Upper bound for a single transport read.
    read_chunk: usize,
    max_message_bytes: usize,
    reject_masked: bool,
}

impl FrameReader {
    pub(crate) fn new(io: TransportRead, leftover: BytesMut, options: &Options) -> Self {
        let mut staging = leftover;
        staging.reserve(options.receive_buffer_size.saturating_sub(staging.len()));
        Self {
            io,
            staging,
            state: ReadState::Header,
            read_chunk: options.receive_buffer_size,
            max_message_bytes: options.max_message_bytes,
            reject_masked: options.reject_masked_server_frames,
        }
    }

    /// Reads and validates the next frame header.
    ///
    /// After this returns, the frame's payload must be drained with
    /// [`FrameReader::read_payload`] before the next header is requested.
    pub(crate) async fn read_header(&mut self, cancel: &CancellationToken) -> Result<FrameHeader> {
        debug_assert!(matches!(self.state, ReadState::Header));
        loop {
            if let Some(header) = self.try_parse_header()? {
                self.state = ReadState::Payload {
                    remaining: header.payload_len,
                    mask: header.mask,
                    offset: 0,
                };
                return Ok(header);
            }
            self.fill(cancel).await?;
        }
    }

    /// Attempts a header decode from the staging buffer; `None` means more
    /// bytes are needed.
    fn try_parse_header(&mut self) -> Result<Option<FrameHeader>> {
        let src = &mut self.staging;
        if src.len() < 2 {
            return Ok(None);
        }

        let b0 = src[0];
        let b1 = src[1];

        if b0 & 0b0011_0000 != 0 {
            return Err(WsError::ReservedBitsNotZero);
        }

        let fin = b0 & 0b1000_0000 != 0;
        let rsv1 = b0 & 0b0100_0000 != 0;
        let opcode = OpCode::try_from(b0 & 0b0000_1111)?;
        let masked = b1 & 0b1000_0000 != 0;
        let length_code = b1 & 0x7F;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + masked as usize * 4;
        if src.len() < header_size {
            return Ok(None);
        }

        src.advance(2);
        let payload_len = match extra {
            0 => usize::from(length_code),
            2 => src.get_u16() as usize,
            8 => usize::try_from(src.get_u64()).map_err(|_| WsError::MessageTooLarge)?,
            _ => unreachable!(),
        };

        if payload_len > self.max_message_bytes {
            return Err(WsError::MessageTooLarge);
        }
        if opcode.is_control() {
            if !fin {
                return Err(WsError::ControlFrameFragmented);
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(WsError::ControlFrameTooLarge);
            }
        }
        // RSV1 marks per-message compression; only the opening data frame
        // of a message may carry it.
        if rsv1 && (opcode.is_control() || opcode == OpCode::Continuation) {
            return Err(WsError::UnexpectedCompressedFrame);
        }

        let mask = if masked {
            if self.reject_masked {
                return Err(WsError::UnexpectedMaskedFrame);
            }
            Some(src.get_u32().to_be_bytes())
        } else {
            None
        };

        Ok(Some(FrameHeader {
            fin,
            rsv1,
            opcode,
            payload_len,
            mask,
        }))
    }

    /// Streams the current frame's payload into `sink`, unmasking on the
    /// fly. No-op if the payload was already drained.
    pub(crate) async fn read_payload(
        &mut self,
        sink: &mut MessageAssembler,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let (remaining, mask, offset) = match self.state {
                ReadState::Header => return Ok(()),
                ReadState::Payload {
                    remaining,
                    mask,
                    offset,
                } => (remaining, mask, offset),
            };

            if remaining == 0 {
                self.state = ReadState::Header;
                return Ok(());
            }

            if self.staging.is_empty() {
                self.fill(cancel).await?;
                continue;
            }

            let take = remaining.min(self.staging.len());
            let mut chunk = self.staging.split_to(take);
            if let Some(key) = mask {
                mask::apply_mask(&mut chunk, key, offset);
            }
            sink.append(&chunk);

            self.state = ReadState::Payload {
                remaining: remaining - take,
                mask,
                offset: offset + take,
            };
        }
    }

    /// Pulls more bytes from the transport into the staging buffer.
    ///
    /// A zero-byte read means the peer closed the stream underneath us; at
    /// this layer that is always a protocol failure, whether it lands
    /// between frames or mid-payload.
    async fn fill(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.staging.reserve(self.read_chunk);
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(WsError::Cancelled),
            res = self.io.read_buf(&mut self.staging) => res?,
        };
        if n == 0 {
            return Err(WsError::UnexpectedEof);
        }
        Ok(())
    }
}

/// Writes frames to the transport's write half.
///
/// Always masks: the mask key comes fresh from the thread-local CSPRNG for
/// every frame.
pub(crate) struct FrameWriter {
    io: TransportWrite,
    /// Rented mask scratch; payload chunks are copied here so the caller's
    /// buffer stays untouched.
    scratch: PooledBuf,
    /// True from the first header byte until the flush completes. A send
    /// abandoned in this window leaves a torn frame on the wire.
    in_flight: bool,
}

impl FrameWriter {
    pub(crate) fn new(io: TransportWrite, options: &Options) -> Self {
        let mut scratch = PooledBuf::acquire(options.send_buffer_size);
        scratch.resize(options.send_buffer_size, 0);
        Self {
            io,
            scratch,
            in_flight: false,
        }
    }

    /// Emits one complete frame: header, then masked payload chunks.
    pub(crate) async fn send_frame(
        &mut self,
        fin: bool,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<()> {
        let key: [u8; 4] = rand::random();
        let mut head = [0u8; MAX_HEADER_SIZE];
        let head_len = frame::encode_header(&mut head, fin, opcode, key, payload.len());

        self.in_flight = true;
        self.io.write_all(&head[..head_len]).await?;

        let mut offset = 0;
        while offset < payload.len() {
            let take = (payload.len() - offset).min(self.scratch.len());
            let chunk = &mut self.scratch[..take];
            chunk.copy_from_slice(&payload[offset..offset + take]);
            mask::apply_mask(chunk, key, offset);
            self.io.write_all(chunk).await?;
            offset += take;
        }

        self.io.flush().await?;
        self.in_flight = false;
        Ok(())
    }

    /// Whether a frame emission was started but not finished. Once true
    /// with the send abandoned, wire framing can no longer be trusted.
    pub(crate) fn is_mid_frame(&self) -> bool {
        self.in_flight
    }

    /// Shuts down the write side of the transport.
    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
