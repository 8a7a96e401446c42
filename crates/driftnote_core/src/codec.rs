//! Binary codec for log and snapshot files.
//!
//! All multi-byte integers are either unsigned LEB128 varints or 8-byte
//! big-endian timestamps. The two magic numbers (`NCLG` for logs, `NCSS` for
//! snapshots) are part of the on-disk contract and must never be reused for
//! other formats.
//!
//! Framing is self-terminating: every record is prefixed with a varint
//! payload length, and a zero-length frame is the termination sentinel of a
//! finalized file. A reader that runs out of bytes mid-record reports
//! [`StoreError::Truncated`], which upper layers treat as "cloud sync has not
//! delivered the rest yet" rather than corruption.

use crate::error::{Result, StoreError};
use crate::types::{ClockEntry, LogEntry, LogRecord, SnapshotStatus, VectorClock};

/// Magic bytes opening every `.crdtlog` file.
pub const LOG_MAGIC: [u8; 4] = *b"NCLG";

/// Magic bytes opening every `.snapshot` file.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"NCSS";

/// Current log format version.
pub const LOG_VERSION: u8 = 1;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Byte length of the log header (magic + version).
pub const LOG_HEADER_LEN: usize = 5;

/// Byte length of the snapshot header (magic + version + status).
pub const SNAPSHOT_HEADER_LEN: usize = 6;

/// Byte offset of the status byte inside a snapshot header.
pub const SNAPSHOT_STATUS_OFFSET: u64 = 5;

/// The termination sentinel: a single zero-length frame.
pub const TERMINATION_SENTINEL: [u8; 1] = [0x00];

// ---------------------------------------------------------------------------
// Varints
// ---------------------------------------------------------------------------

/// Append an unsigned LEB128 varint to `out`.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Append a varint from a signed source value, rejecting negatives.
pub fn encode_varint_i64(value: i64, out: &mut Vec<u8>) -> Result<()> {
    if value < 0 {
        return Err(StoreError::Negative(value));
    }
    encode_varint(value as u64, out);
    Ok(())
}

/// Decode an unsigned LEB128 varint starting at `pos`.
///
/// Returns the value and the number of bytes consumed. Fails with
/// [`StoreError::Incomplete`] if the continuation bit is set at the end of
/// the buffer, and [`StoreError::Overflow`] if the value exceeds 64 bits.
pub fn decode_varint(buf: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    let mut i = pos;
    loop {
        let Some(&byte) = buf.get(i) else {
            return Err(StoreError::Incomplete);
        };
        i += 1;
        if shift >= 64 {
            return Err(StoreError::Overflow);
        }
        let low = (byte & 0x7f) as u64;
        if shift == 63 && low > 1 {
            return Err(StoreError::Overflow);
        }
        value |= low << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i - pos));
        }
        shift += 7;
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Append an 8-byte big-endian millisecond timestamp, rejecting negatives.
pub fn encode_timestamp(timestamp_ms: i64, out: &mut Vec<u8>) -> Result<()> {
    if timestamp_ms < 0 {
        return Err(StoreError::Negative(timestamp_ms));
    }
    out.extend_from_slice(&(timestamp_ms as u64).to_be_bytes());
    Ok(())
}

/// Decode an 8-byte big-endian millisecond timestamp starting at `pos`.
pub fn decode_timestamp(buf: &[u8], pos: usize) -> Result<i64> {
    let bytes: [u8; 8] = buf
        .get(pos..pos + 8)
        .ok_or(StoreError::Truncated("record timestamp"))?
        .try_into()
        .expect("slice of length 8");
    let raw = u64::from_be_bytes(bytes);
    i64::try_from(raw).map_err(|_| StoreError::Overflow)
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Append the 5-byte log header.
pub fn write_log_header(out: &mut Vec<u8>) {
    out.extend_from_slice(&LOG_MAGIC);
    out.push(LOG_VERSION);
}

/// Validate the 5-byte log header at the start of `buf`.
pub fn read_log_header(buf: &[u8]) -> Result<()> {
    if buf.len() < LOG_HEADER_LEN {
        return Err(StoreError::Truncated("header"));
    }
    let found: [u8; 4] = buf[..4].try_into().expect("slice of length 4");
    if found != LOG_MAGIC {
        return Err(StoreError::BadMagic {
            expected: LOG_MAGIC,
            found,
        });
    }
    if buf[4] != LOG_VERSION {
        return Err(StoreError::UnsupportedVersion(buf[4]));
    }
    Ok(())
}

/// Append the 6-byte snapshot header with the given status.
pub fn write_snapshot_header(status: SnapshotStatus, out: &mut Vec<u8>) {
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.push(SNAPSHOT_VERSION);
    out.push(status.as_byte());
}

/// Validate the 6-byte snapshot header at the start of `buf`, returning the
/// parsed status byte.
pub fn read_snapshot_header(buf: &[u8]) -> Result<SnapshotStatus> {
    if buf.len() < SNAPSHOT_HEADER_LEN {
        return Err(StoreError::Truncated("header"));
    }
    let found: [u8; 4] = buf[..4].try_into().expect("slice of length 4");
    if found != SNAPSHOT_MAGIC {
        return Err(StoreError::BadMagic {
            expected: SNAPSHOT_MAGIC,
            found,
        });
    }
    if buf[4] != SNAPSHOT_VERSION {
        return Err(StoreError::UnsupportedVersion(buf[4]));
    }
    SnapshotStatus::from_byte(buf[5])
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A decoded record frame plus the number of bytes it occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    /// The record or terminator.
    pub entry: LogEntry,
    /// Total frame size in bytes, length prefix included.
    pub bytes_read: usize,
}

/// Encode one record frame: `varint(payloadLen)` followed by
/// `timestamp ∥ varint(sequence) ∥ data`.
pub fn encode_record(timestamp_ms: i64, sequence: u64, data: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(8 + 10 + data.len());
    encode_timestamp(timestamp_ms, &mut payload)?;
    encode_varint(sequence, &mut payload);
    payload.extend_from_slice(data);

    let mut frame = Vec::with_capacity(payload.len() + 5);
    encode_varint(payload.len() as u64, &mut frame);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one record frame starting at `pos`.
///
/// A zero payload length decodes to [`LogEntry::Terminator`]. If the buffer
/// lacks `payloadLen` bytes the frame is [`StoreError::Truncated`] — the
/// signal upstream components use to retry under cloud sync.
pub fn decode_entry(buf: &[u8], pos: usize) -> Result<DecodedEntry> {
    let (payload_len, prefix_len) = match decode_varint(buf, pos) {
        Ok(v) => v,
        Err(StoreError::Incomplete) => return Err(StoreError::Truncated("record length")),
        Err(e) => return Err(e),
    };
    if payload_len == 0 {
        return Ok(DecodedEntry {
            entry: LogEntry::Terminator,
            bytes_read: prefix_len,
        });
    }

    let payload_start = pos + prefix_len;
    let payload_len = payload_len as usize;
    let payload_end = payload_start
        .checked_add(payload_len)
        .ok_or(StoreError::Truncated("record"))?;
    let payload = buf
        .get(payload_start..payload_end)
        .ok_or(StoreError::Truncated("record"))?;

    let timestamp_ms = decode_timestamp(payload, 0)?;
    let (sequence, seq_len) = decode_varint(payload, 8)?;
    let data = payload[8 + seq_len..].to_vec();

    Ok(DecodedEntry {
        entry: LogEntry::Record(LogRecord {
            timestamp_ms,
            sequence,
            data,
        }),
        bytes_read: prefix_len + payload_len,
    })
}

// ---------------------------------------------------------------------------
// Vector clocks
// ---------------------------------------------------------------------------

/// Append the binary vector-clock form: `varint count`, then per entry
/// `varint idLen ∥ id ∥ varint sequence ∥ varint offset ∥ varint fnLen ∥ fn`.
pub fn encode_vector_clock(clock: &VectorClock, out: &mut Vec<u8>) {
    encode_varint(clock.len() as u64, out);
    for (instance_id, entry) in clock.iter() {
        encode_varint(instance_id.len() as u64, out);
        out.extend_from_slice(instance_id.as_bytes());
        encode_varint(entry.sequence, out);
        encode_varint(entry.offset, out);
        encode_varint(entry.file.len() as u64, out);
        out.extend_from_slice(entry.file.as_bytes());
    }
}

/// Decode a binary vector clock starting at `pos`, returning the clock and
/// the number of bytes consumed.
pub fn decode_vector_clock(buf: &[u8], pos: usize) -> Result<(VectorClock, usize)> {
    let mut cursor = pos;
    let (count, n) = decode_varint(buf, cursor)?;
    cursor += n;

    let mut clock = VectorClock::new();
    for _ in 0..count {
        let instance_id = {
            let (s, n) = decode_string(buf, cursor)?;
            cursor += n;
            s
        };
        let (sequence, n) = decode_varint(buf, cursor)?;
        cursor += n;
        let (offset, n) = decode_varint(buf, cursor)?;
        cursor += n;
        let file = {
            let (s, n) = decode_string(buf, cursor)?;
            cursor += n;
            s
        };
        clock.set(
            instance_id,
            ClockEntry {
                sequence,
                offset,
                file,
            },
        );
    }
    Ok((clock, cursor - pos))
}

fn decode_string(buf: &[u8], pos: usize) -> Result<(String, usize)> {
    let (len, prefix) = decode_varint(buf, pos)?;
    let len = len as usize;
    let start = pos + prefix;
    let end = start
        .checked_add(len)
        .ok_or(StoreError::Truncated("vector clock"))?;
    let bytes = buf
        .get(start..end)
        .ok_or(StoreError::Truncated("vector clock"))?;
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid UTF-8 in vector clock",
        ))
    })?;
    Ok((s, prefix + len))
}

// ---------------------------------------------------------------------------
// Whole-file builders
// ---------------------------------------------------------------------------

/// Build the bytes of a complete log file: header, records, and optionally a
/// termination sentinel.
pub fn create_log_file(records: &[LogRecord], terminated: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_log_header(&mut out);
    for record in records {
        out.extend_from_slice(&encode_record(
            record.timestamp_ms,
            record.sequence,
            &record.data,
        )?);
    }
    if terminated {
        out.extend_from_slice(&TERMINATION_SENTINEL);
    }
    Ok(out)
}

/// Build the bytes of a snapshot file: header (with matching status byte),
/// vector clock, then the encoded document state.
pub fn create_snapshot_file(clock: &VectorClock, state: &[u8], complete: bool) -> Vec<u8> {
    let status = if complete {
        SnapshotStatus::Complete
    } else {
        SnapshotStatus::Incomplete
    };
    let mut out = Vec::with_capacity(SNAPSHOT_HEADER_LEN + state.len() + 64);
    write_snapshot_header(status, &mut out);
    encode_vector_clock(clock, &mut out);
    out.extend_from_slice(state);
    out
}
