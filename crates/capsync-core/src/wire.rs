//! Sync pipe wire format
//!
//! Every message the capture child sends to its parent is a 4-byte header
//! followed by a payload:
//!
//! ```text
//! +--------+--------+--------+--------+-----------------+
//! | type   | len[2] | len[1] | len[0] |   payload ...   |
//! | 1 byte |        3-byte length      |  `length` bytes |
//! +--------+--------+--------+--------+-----------------+
//! ```
//!
//! `ERROR_MSG` payloads carry two more frames back-to-back: a primary and a
//! secondary message, each with its own header.

use crate::pipe::read_exact;
use serde::Serialize;
use std::borrow::Cow;
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::{debug, trace};

/// Size of the indicator + length header
pub const HEADER_LEN: usize = 4;

/// Largest length a 3-byte length field can express
pub const MAX_BLOCK_LEN: usize = 0x00FF_FFFF;

/// Default upper bound on a payload the parent accepts
pub const SP_MAX_MSG_LEN: usize = 4096;

/// Message type carried in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Indicator {
    /// Path of a newly opened capture file
    File,
    /// Decimal count of packets captured since the last report
    PacketCount,
    /// Primary and secondary error text
    ErrorMsg,
    /// `<index>:<message>` for a capture filter that failed to compile
    BadFilter,
    /// Decimal cumulative dropped-packet count
    Drops,
    /// One-shot command succeeded, output follows on the data pipe
    Success,
}

impl Indicator {
    pub const ALL: [Indicator; 6] = [
        Indicator::File,
        Indicator::PacketCount,
        Indicator::ErrorMsg,
        Indicator::BadFilter,
        Indicator::Drops,
        Indicator::Success,
    ];

    pub const fn as_byte(self) -> u8 {
        match self {
            Indicator::File => b'F',
            Indicator::PacketCount => b'P',
            Indicator::ErrorMsg => b'E',
            Indicator::BadFilter => b'B',
            Indicator::Drops => b'D',
            Indicator::Success => b'S',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.as_byte() == byte)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Indicator::File => "FILE",
            Indicator::PacketCount => "PACKET_COUNT",
            Indicator::ErrorMsg => "ERROR_MSG",
            Indicator::BadFilter => "BAD_FILTER",
            Indicator::Drops => "DROPS",
            Indicator::Success => "SUCCESS",
        }
    }
}

/// Framing errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Error reading from sync pipe: {0}")]
    Io(#[source] io::Error),

    #[error("Premature EOF reading from sync pipe: got only {got} bytes")]
    PrematureEof { got: usize },

    #[error(
        "Unknown message from capture child, try to show it as a string: {}",
        .raw.escape_ascii()
    )]
    UnknownMessage { raw: Vec<u8> },

    #[error("capture child gave an unexpected message type: 0x{0:02x}")]
    UnknownIndicator(u8),

    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("Message of {len} bytes exceeds the {max} byte limit")]
    TooLong { len: usize, max: usize },

    #[error("Error writing to sync pipe: {0}")]
    Write(#[source] io::Error),
}

/// Split a header into indicator byte and payload length
pub fn decode_header(header: [u8; HEADER_LEN]) -> (u8, usize) {
    let len = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
    (header[0], len)
}

/// Build a header, rejecting lengths that do not fit in 24 bits
pub fn encode_header(indicator: u8, len: usize) -> Result<[u8; HEADER_LEN], WireError> {
    if len > MAX_BLOCK_LEN {
        return Err(WireError::TooLong {
            len,
            max: MAX_BLOCK_LEN,
        });
    }
    Ok([indicator, (len >> 16) as u8, (len >> 8) as u8, len as u8])
}

/// One framed message as read off the pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub indicator: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(indicator: Indicator, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            indicator: indicator.as_byte(),
            payload: payload.into(),
        }
    }

    /// Known message type, if the indicator byte is one
    pub fn kind(&self) -> Option<Indicator> {
        Indicator::from_byte(self.indicator)
    }

    /// Payload as text, stopping at the first NUL
    pub fn text(&self) -> Cow<'_, str> {
        payload_text(&self.payload)
    }

    /// Best-effort text of an `ERROR_MSG` payload whose sub-frames don't
    /// line up: the bytes after the first sub-header, clamped to what
    /// actually arrived
    pub fn error_text_lossy(&self) -> String {
        let mut cursor = PayloadCursor::new(&self.payload);
        let text = match cursor.header() {
            Some((_, len)) => cursor.take(len.min(cursor.remaining())).unwrap_or_default(),
            None => &self.payload[..],
        };
        payload_text(text).into_owned()
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let header = encode_header(self.indicator, self.payload.len())?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Result of a single framed read
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Message(Frame),
    /// The child closed the pipe between messages
    Eof,
}

/// Read one framed message.
///
/// A zero-byte read before the header is a clean [`ReadOutcome::Eof`]. A
/// length above `max_len` is never buffered: at most `max_len` bytes
/// (header included) are pulled for the diagnostic and the pipe is left
/// unsynchronized.
pub fn read_message<R: Read>(reader: &mut R, max_len: usize) -> Result<ReadOutcome, WireError> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_exact(reader, &mut header);
    if let Some(err) = got.error {
        debug!(read = got.read, error = %err, "sync pipe: failed to read header");
        return Err(WireError::Io(err));
    }
    match got.read {
        0 => {
            debug!("sync pipe: EOF (capture closed?)");
            return Ok(ReadOutcome::Eof);
        }
        HEADER_LEN => {}
        n => {
            debug!(read = n, "sync pipe: short header");
            return Err(WireError::PrematureEof { got: n });
        }
    }

    let (indicator, len) = decode_header(header);
    if len == 0 {
        trace!(indicator = %char::from(indicator), "sync pipe: empty message");
        return Ok(ReadOutcome::Message(Frame {
            indicator,
            payload: Vec::new(),
        }));
    }

    if len > max_len {
        debug!(
            "sync pipe: length error, required {} > max {}, header: {:02x?}",
            len, max_len, header
        );
        let mut raw = Vec::with_capacity(max_len.max(HEADER_LEN));
        raw.extend_from_slice(&header);
        let room = max_len.saturating_sub(HEADER_LEN);
        if room > 0 {
            let mut more = vec![0u8; room];
            loop {
                match reader.read(&mut more) {
                    Ok(n) => {
                        raw.extend_from_slice(&more[..n]);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(error = %e, "sync pipe: read of oversized message failed");
                        break;
                    }
                }
            }
        }
        return Err(WireError::UnknownMessage { raw });
    }

    let mut payload = vec![0u8; len];
    let got = read_exact(reader, &mut payload);
    if let Some(err) = got.error {
        return Err(WireError::Io(err));
    }
    if got.read != len {
        payload.truncate(got.read);
        return Err(WireError::UnknownMessage { raw: payload });
    }

    trace!(
        indicator = %char::from(indicator),
        len,
        "sync pipe: message"
    );
    Ok(ReadOutcome::Message(Frame { indicator, payload }))
}

/// Write one framed message and flush
pub fn write_message<W: Write>(
    writer: &mut W,
    indicator: Indicator,
    payload: &[u8],
) -> Result<(), WireError> {
    let header = encode_header(indicator.as_byte(), payload.len())?;
    writer.write_all(&header).map_err(WireError::Write)?;
    writer.write_all(payload).map_err(WireError::Write)?;
    writer.flush().map_err(WireError::Write)
}

/// Write an `ERROR_MSG` frame holding a primary and secondary message
pub fn write_error_msg<W: Write>(
    writer: &mut W,
    primary: &str,
    secondary: &str,
) -> Result<(), WireError> {
    let message = SyncMessage::ErrorMsg {
        primary: primary.to_string(),
        secondary: secondary.to_string(),
    };
    let bytes = message.encode()?;
    writer.write_all(&bytes).map_err(WireError::Write)?;
    writer.flush().map_err(WireError::Write)
}

/// Text of a payload up to the first NUL. Workers written in C send their
/// strings with the terminator included.
pub fn payload_text(payload: &[u8]) -> Cow<'_, str> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end])
}

/// Leading decimal digits of `text`, after optional whitespace. Anything
/// unparsable counts as zero.
pub fn parse_decimal(text: &str) -> u64 {
    text.trim_start()
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |acc, d| {
            acc.saturating_mul(10).saturating_add(u64::from(d - b'0'))
        })
}

/// Bounds-checked reader over a payload
#[derive(Debug)]
pub struct PayloadCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Next `n` bytes, or `None` without advancing if fewer remain
    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub fn header(&mut self) -> Option<(u8, usize)> {
        let bytes = self.take(HEADER_LEN)?;
        Some(decode_header([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// A nested frame: header, then exactly as many bytes as it declares
    pub fn sub_frame(&mut self) -> Option<&'a [u8]> {
        let start = self.pos;
        let (_, len) = self.header()?;
        match self.take(len) {
            Some(body) => Some(body),
            None => {
                self.pos = start;
                None
            }
        }
    }
}

/// Decoded sync pipe message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    File { path: String },
    PacketCount { count: u32 },
    ErrorMsg { primary: String, secondary: String },
    BadFilter { index: usize, message: String },
    Drops { dropped: u32 },
    Success,
}

impl SyncMessage {
    pub fn indicator(&self) -> Indicator {
        match self {
            SyncMessage::File { .. } => Indicator::File,
            SyncMessage::PacketCount { .. } => Indicator::PacketCount,
            SyncMessage::ErrorMsg { .. } => Indicator::ErrorMsg,
            SyncMessage::BadFilter { .. } => Indicator::BadFilter,
            SyncMessage::Drops { .. } => Indicator::Drops,
            SyncMessage::Success => Indicator::Success,
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, WireError> {
        let kind = frame
            .kind()
            .ok_or(WireError::UnknownIndicator(frame.indicator))?;
        let message = match kind {
            Indicator::File => SyncMessage::File {
                path: frame.text().into_owned(),
            },
            Indicator::PacketCount => SyncMessage::PacketCount {
                count: saturate_u32(parse_decimal(&frame.text())),
            },
            Indicator::ErrorMsg => {
                let mut cursor = PayloadCursor::new(&frame.payload);
                let primary = cursor.sub_frame().ok_or_else(|| WireError::Malformed {
                    kind: kind.name(),
                    reason: format!(
                        "primary message truncated ({} payload bytes)",
                        frame.payload.len()
                    ),
                })?;
                // A worker may leave the secondary message out entirely
                let secondary = if cursor.is_empty() {
                    &[][..]
                } else {
                    cursor.sub_frame().ok_or_else(|| WireError::Malformed {
                        kind: kind.name(),
                        reason: format!(
                            "secondary message truncated at offset {}",
                            cursor.position()
                        ),
                    })?
                };
                SyncMessage::ErrorMsg {
                    primary: payload_text(primary).into_owned(),
                    secondary: payload_text(secondary).into_owned(),
                }
            }
            Indicator::BadFilter => {
                let text = frame.text();
                let (index, message) = match text.split_once(':') {
                    Some((index, message)) => (index, message),
                    None => (text.as_ref(), ""),
                };
                SyncMessage::BadFilter {
                    index: usize::try_from(parse_decimal(index)).unwrap_or(usize::MAX),
                    message: message.to_string(),
                }
            }
            Indicator::Drops => SyncMessage::Drops {
                dropped: saturate_u32(parse_decimal(&frame.text())),
            },
            Indicator::Success => SyncMessage::Success,
        };
        Ok(message)
    }

    pub fn to_frame(&self) -> Result<Frame, WireError> {
        let payload = match self {
            SyncMessage::File { path } => path.as_bytes().to_vec(),
            SyncMessage::PacketCount { count } => count.to_string().into_bytes(),
            SyncMessage::ErrorMsg { primary, secondary } => {
                let mut payload = Vec::with_capacity(2 * HEADER_LEN + primary.len() + secondary.len());
                for part in [primary, secondary] {
                    let header = encode_header(Indicator::ErrorMsg.as_byte(), part.len())?;
                    payload.extend_from_slice(&header);
                    payload.extend_from_slice(part.as_bytes());
                }
                payload
            }
            SyncMessage::BadFilter { index, message } => format!("{index}:{message}").into_bytes(),
            SyncMessage::Drops { dropped } => dropped.to_string().into_bytes(),
            SyncMessage::Success => Vec::new(),
        };
        Ok(Frame::new(self.indicator(), payload))
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        self.to_frame()?.encode()
    }
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
