//! Git packet-line scanning and encoding.
//!
//! The reference rewriter needs byte offsets rather than decoded payloads, so
//! the scanner yields [`Record`] spans into the original buffer instead of
//! owned packets.  Every access is bounds-checked; malformed input surfaces
//! as a [`PktLineError`].
//!
//! # Packet-line format
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)

use std::ops::Range;

use thiserror::Error;
use tracing::trace;

/// Size of the hex length prefix.
pub const PREFIX_LEN: usize = 4;

/// Largest total packet length Git accepts (`LARGE_PACKET_MAX`).
pub const MAX_PKT_LEN: usize = 65520;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PktLineError {
    #[error("cannot parse refs line size: {prefix:?} at offset {offset}")]
    InvalidLength { offset: usize, prefix: String },
    #[error("incomplete refs data received from upstream (offset {offset}, declared {declared}, available {available})")]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },
    #[error("packet-line payload too large ({len} bytes)")]
    TooLong { len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Flush packet (`0000`).
    Flush,
    /// Delimiter packet (`0001`).
    Delimiter,
    /// Response-end packet (`0002`).
    ResponseEnd,
    /// Data packet; the payload follows the prefix.
    Data,
}

/// One packet line located inside a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    /// Byte span of the whole record, prefix included.
    pub span: Range<usize>,
}

impl Record {
    /// The payload bytes of a data packet, empty for control packets.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        match self.kind {
            RecordKind::Data => &buf[self.span.start + PREFIX_LEN..self.span.end],
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Walk `buf` record by record.
///
/// Flush packets do not end the walk: scanning continues until the cursor
/// reaches the end of the buffer.  The iterator yields one error and then
/// stops.
pub fn records(buf: &[u8]) -> Records<'_> {
    Records {
        buf,
        pos: 0,
        failed: false,
    }
}

pub struct Records<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<Record, PktLineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let item = self.read_record();
        match &item {
            Ok(record) => self.pos = record.span.end,
            Err(_) => self.failed = true,
        }
        Some(item)
    }
}

impl Records<'_> {
    fn read_record(&self) -> Result<Record, PktLineError> {
        let start = self.pos;
        let available = self.buf.len() - start;
        let Some(prefix) = self.buf.get(start..start + PREFIX_LEN) else {
            return Err(PktLineError::Truncated {
                offset: start,
                declared: PREFIX_LEN,
                available,
            });
        };

        let declared = parse_length(prefix).ok_or_else(|| PktLineError::InvalidLength {
            offset: start,
            prefix: String::from_utf8_lossy(prefix).into_owned(),
        })?;

        let (kind, len) = match declared {
            0 => (RecordKind::Flush, PREFIX_LEN),
            1 => (RecordKind::Delimiter, PREFIX_LEN),
            2 => (RecordKind::ResponseEnd, PREFIX_LEN),
            3 => {
                return Err(PktLineError::InvalidLength {
                    offset: start,
                    prefix: String::from_utf8_lossy(prefix).into_owned(),
                })
            }
            n => (RecordKind::Data, n),
        };

        if len > available {
            return Err(PktLineError::Truncated {
                offset: start,
                declared: len,
                available,
            });
        }

        trace!(offset = start, len, ?kind, "packet-line");
        Ok(Record {
            kind,
            span: start..start + len,
        })
    }
}

/// Parse a 4-digit hex length.  Signs, whitespace and short prefixes are
/// rejected, unlike `from_str_radix`.
fn parse_length(prefix: &[u8]) -> Option<usize> {
    if prefix.len() != PREFIX_LEN {
        return None;
    }
    prefix.iter().try_fold(0usize, |acc, &b| {
        let digit = (b as char).to_digit(16)?;
        Some(acc * 16 + digit as usize)
    })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Append `data` to `out` as a packet line (lowercase 4-hex-digit length
/// prefix + data).
///
/// The length includes the 4 prefix bytes themselves.  Callers are responsible
/// for including any trailing newline in `data`.
pub fn write_pkt_line(out: &mut Vec<u8>, data: &[u8]) -> Result<(), PktLineError> {
    let total_len = data.len() + PREFIX_LEN;
    if total_len > MAX_PKT_LEN {
        return Err(PktLineError::TooLong { len: data.len() });
    }
    out.reserve(total_len);
    out.extend_from_slice(format!("{total_len:04x}").as_bytes());
    out.extend_from_slice(data);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
