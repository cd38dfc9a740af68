//! On-disk frame format.
//!
//! Each frame is laid out as:
//!
//! ```text
//! +----------+----------+---------+------------------+
//! | len: u32 | crc: u32 | seq: u64| payload: [u8]    |
//! +----------+----------+---------+------------------+
//! ```
//!
//! `len` counts the sequence number plus the payload, both little endian.
//! The checksum is CRC32(BE(seq) + payload), matching on every replay; a
//! mismatch marks the frame (and everything after it in the segment) as a
//! torn tail.

use std::io::{self, Read, Write};

use crc32fast::Hasher;

/// Fixed bytes in front of every payload: len + crc + seq.
pub(crate) const FRAME_HEADER_LEN: usize = 4 + 4 + 8;

/// Frames above this size are refused outright rather than written.
pub const MAX_FRAME_PAYLOAD: usize = 8 * 1024 * 1024;

/// Result of decoding one frame from a segment.
#[derive(Debug)]
pub(crate) enum FrameStatus {
    /// A complete frame with a valid checksum.
    Valid { seq: u64, payload: Vec<u8> },
    /// The bytes at the current position do not form a complete, valid
    /// frame. During replay this seals the segment at the current offset.
    Torn,
    /// The underlying reader hit end-of-file exactly on a frame boundary.
    EndOfSegment,
}

fn checksum(seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&seq.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Appends one frame to `writer`, returning the number of bytes written.
pub(crate) fn write_frame<W: Write>(writer: &mut W, seq: u64, payload: &[u8]) -> io::Result<usize> {
    debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);

    let len = (payload.len() + 8) as u32;
    let crc = checksum(seq, payload);

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&seq.to_le_bytes())?;
    writer.write_all(payload)?;

    Ok(FRAME_HEADER_LEN + payload.len())
}

/// Decodes the next frame from `reader`.
///
/// Short reads and checksum mismatches are reported as [`FrameStatus::Torn`]
/// rather than errors: on replay they mean the process died mid-append, and
/// at runtime the reader never reads past the committed offset, so a torn
/// result is only ever seen for the tail of a recovered segment.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> io::Result<FrameStatus> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf)? {
        ReadOutcome::Eof => return Ok(FrameStatus::EndOfSegment),
        ReadOutcome::Partial => return Ok(FrameStatus::Torn),
        ReadOutcome::Full => {}
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len < 8 || len > MAX_FRAME_PAYLOAD + 8 {
        return Ok(FrameStatus::Torn);
    }

    let mut crc_buf = [0u8; 4];
    if !matches!(read_exact_or_eof(reader, &mut crc_buf)?, ReadOutcome::Full) {
        return Ok(FrameStatus::Torn);
    }
    let mut seq_buf = [0u8; 8];
    if !matches!(read_exact_or_eof(reader, &mut seq_buf)?, ReadOutcome::Full) {
        return Ok(FrameStatus::Torn);
    }

    let mut payload = vec![0u8; len - 8];
    if !payload.is_empty()
        && !matches!(read_exact_or_eof(reader, &mut payload)?, ReadOutcome::Full)
    {
        return Ok(FrameStatus::Torn);
    }

    let seq = u64::from_le_bytes(seq_buf);
    if checksum(seq, &payload) != u32::from_le_bytes(crc_buf) {
        return Ok(FrameStatus::Torn);
    }

    Ok(FrameStatus::Valid { seq, payload })
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    if buf.is_empty() {
        return Ok(ReadOutcome::Eof);
    }
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}
