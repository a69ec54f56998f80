//! permessage-deflate negotiation and inbound message inflation
//! ([RFC 7692](https://datatracker.ietf.org/doc/html/rfc7692)).
//!
//! The client offers the extension during the handshake; the server's
//! selected parameters become a [`NegotiatedDeflate`] fixed for the life of
//! the connection. Inbound messages flagged with RSV1 run through the
//! [`Inflater`], which appends the `00 00 FF FF` trailer the peer stripped
//! (RFC 7692 §7.2.2) and exposes a contiguous view of the decompressed
//! bytes.
//!
//! Outgoing compression is deliberately absent: this client only consumes
//! feeds.

use std::sync::OnceLock;

use bytes::{BufMut, BytesMut};
use flate2::{Decompress, FlushDecompress, Status};
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
    IResult,
};

use crate::{options::DeflateConfig, Result, WsError};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// RFC 7692 §7.2.2: the tail every peer strips from a compressed message
/// and the receiver re-appends before the final inflate.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Parameter set of the permessage-deflate extension, used both for the
/// client offer and for the server's selection.
///
/// Absent window-bits values mean the default 32 KiB window (15 bits).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Extensions {
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_no_context_takeover: bool,
    pub(crate) server_max_window_bits: Option<u8>,
    pub(crate) client_max_window_bits: Option<u8>,
}

impl From<&DeflateConfig> for Extensions {
    /// Builds the client offer from the configured compression knobs.
    fn from(config: &DeflateConfig) -> Self {
        Self {
            server_no_context_takeover: config.server_no_context_takeover,
            client_no_context_takeover: config.client_no_context_takeover,
            server_max_window_bits: config.server_max_window_bits,
            client_max_window_bits: config.client_max_window_bits,
        }
    }
}

impl std::fmt::Display for Extensions {
    /// Renders the `Sec-WebSocket-Extensions` offer token.
    ///
    /// Window-bits values are validated against 8..=15 before the handshake
    /// starts, so rendering never has to second-guess them.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", PERMESSAGE_DEFLATE)?;

        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if let Some(bits) = self.client_max_window_bits {
            write!(f, "; client_max_window_bits={}", bits)?;
        }
        if let Some(bits) = self.server_max_window_bits {
            write!(f, "; server_max_window_bits={}", bits)?;
        }

        Ok(())
    }
}

/// Parses one `key` or `key=value` extension parameter, eating optional
/// whitespace.
fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        space0,
        pair(
            take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
            opt(preceded(tag("="), preceded(space0, digit1))),
        ),
    )(input)
}

/// Extracts the server's permessage-deflate selection from a
/// `Sec-WebSocket-Extensions` header value.
///
/// Returns `None` when no permessage-deflate token is present. Unknown or
/// malformed parameters inside the token are ignored per RFC 7692: the
/// extension stays enabled with whatever the server did communicate.
pub(crate) fn parse_header(header: &str) -> Option<Extensions> {
    for token in header.split(',') {
        let mut params = token.split(';');
        let name = match params.next() {
            Some(name) => name.trim(),
            None => continue,
        };
        if !name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) {
            continue;
        }

        let mut extensions = Extensions::default();
        for param in params {
            let Ok((_, (key, value))) = parse_param(param) else {
                continue;
            };
            match key {
                "client_no_context_takeover" => extensions.client_no_context_takeover = true,
                "server_no_context_takeover" => extensions.server_no_context_takeover = true,
                "client_max_window_bits" => {
                    extensions.client_max_window_bits = value.and_then(|v| v.parse().ok());
                }
                "server_max_window_bits" => {
                    extensions.server_max_window_bits = value.and_then(|v| v.parse().ok());
                }
                _ => {}
            }
        }

        return Some(extensions);
    }

    None
}

/// Compression parameters in force for a connection, computed once during
/// the handshake and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedDeflate {
    /// The client's deflate context resets between messages. Irrelevant for
    /// this receive-only client but preserved for introspection.
    pub client_no_context_takeover: bool,
    /// The server's deflate context resets between messages, so the inflate
    /// window is reset before each inbound message.
    pub server_no_context_takeover: bool,
    /// LZ77 window of the client's compressor, 8..=15 bits.
    pub client_max_window_bits: u8,
    /// LZ77 window of the server's compressor, 8..=15 bits.
    pub server_max_window_bits: u8,
}

impl From<&Extensions> for NegotiatedDeflate {
    fn from(ext: &Extensions) -> Self {
        Self {
            client_no_context_takeover: ext.client_no_context_takeover,
            server_no_context_takeover: ext.server_no_context_takeover,
            client_max_window_bits: ext.client_max_window_bits.unwrap_or(15),
            server_max_window_bits: ext.server_max_window_bits.unwrap_or(15),
        }
    }
}

/// Streaming raw-DEFLATE decoder for one compressed message at a time.
///
/// The output buffer grows by doubling and is reused across messages, so a
/// feed whose messages fit the high-water mark inflates without touching
/// the allocator. The view returned by [`Inflater::output`] is valid until
/// the next [`Inflater::inflate_message`] call.
pub(crate) struct Inflater {
    raw: Decompress,
    output: BytesMut,
    reset_between_messages: bool,
}

impl Inflater {
    pub(crate) fn new(negotiated: &NegotiatedDeflate, initial_capacity: usize) -> Self {
        // zlib cannot inflate with fewer than 9 window bits; an 8-bit
        // negotiation still decodes correctly with a 9-bit window.
        let window_bits = negotiated.server_max_window_bits.clamp(9, 15);
        Self {
            raw: Decompress::new_with_window_bits(false, window_bits),
            output: BytesMut::with_capacity(initial_capacity.max(1)),
            reset_between_messages: negotiated.server_no_context_takeover,
        }
    }

    /// Decompresses one complete message, replacing the previous output.
    ///
    /// `input` is the concatenated payload of the message's frames, without
    /// the `00 00 FF FF` trailer; the trailer is appended here before the
    /// final drain.
    pub(crate) fn inflate_message(&mut self, input: &[u8]) -> Result<()> {
        if self.reset_between_messages {
            self.raw.reset(false);
        }
        self.output.clear();

        self.write(input)?;
        self.write(&DEFLATE_TRAILER)?;
        self.drain()?;

        Ok(())
    }

    /// View of the message decompressed by the last
    /// [`Inflater::inflate_message`].
    pub(crate) fn output(&self) -> &[u8] {
        &self.output
    }

    /// Feeds input to the decoder, draining produced bytes into the output
    /// buffer and doubling it whenever it fills up.
    fn write(&mut self, mut input: &[u8]) -> Result<()> {
        let output = &mut self.output;
        let raw = &mut self.raw;

        while !input.is_empty() {
            let dst = chunk(output);

            let before_out = raw.total_out();
            let before_in = raw.total_in();

            let status = raw.decompress(input, dst, FlushDecompress::None);

            let produced = (raw.total_out() - before_out) as usize;
            let consumed = (raw.total_in() - before_in) as usize;

            unsafe { output.advance_mut(produced) };
            input = &input[consumed..];

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(..) => return Err(WsError::CorruptDeflateStream),
            }

            // A stuck decoder (ended stream, undersized window) would spin
            // here forever; no forward progress means the input is bad.
            if consumed == 0 && produced == 0 {
                return Err(WsError::CorruptDeflateStream);
            }
        }

        Ok(())
    }

    /// Pulls out whatever the decoder still holds after the trailer.
    fn drain(&mut self) -> Result<()> {
        let output = &mut self.output;
        let raw = &mut self.raw;

        loop {
            let dst = chunk(output);

            let before_out = raw.total_out();
            raw.decompress(&[], dst, FlushDecompress::Sync)
                .map_err(|_| WsError::CorruptDeflateStream)?;

            let produced = (raw.total_out() - before_out) as usize;
            if produced == 0 {
                return Ok(());
            }

            unsafe { output.advance_mut(produced) };
        }
    }
}

/// Returns a mutable slice over the buffer's spare capacity, doubling the
/// buffer first when none is left.
///
/// # Safety
/// Treating the uninitialized spare capacity as `&mut [u8]` is sound here
/// because the decoder only writes into the slice and `advance_mut` is
/// called with exactly the number of bytes written.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        output.reserve(output.capacity().max(1024));
    }

    let spare = output.spare_capacity_mut();
    unsafe { &mut *(spare as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

/// One-shot self-check that the deflate decoder actually works in this
/// process, cached for its lifetime.
///
/// Enabling compression while this fails is a connect-time configuration
/// error; the check stands in for the original design's dynamic-library
/// probe.
pub(crate) fn deflate_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();

    *SUPPORTED.get_or_init(|| {
        // A raw-deflate stored block holding "tickws".
        const PROBE: &[u8] = &[0x01, 0x06, 0x00, 0xf9, 0xff, b't', b'i', b'c', b'k', b'w', b's'];

        let mut raw = Decompress::new(false);
        let mut out = Vec::with_capacity(16);
        match raw.decompress_vec(PROBE, &mut out, FlushDecompress::Finish) {
            Ok(_) => out == b"tickws",
            Err(_) => false,
        }
    })
}
