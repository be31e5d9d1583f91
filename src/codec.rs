//! Binary codec for the Tidelog append-only log file.
//!
//! This module handles serialization and deserialization of the file header and
//! individual log records. It is pure data transformation -- no file I/O, no
//! async, no index management.
//!
//! The file header is a fixed 8-byte sequence (magic number + format version).
//! Each record is a length-prefixed, CRC32-checksummed binary frame containing a
//! single [`LogRecord`], prefixed inside the frame by a one-byte kind tag
//! (prepare or commit). Record positions are the byte offsets of their frames,
//! so a frame is self-delimiting and the log can be re-scanned from any record
//! boundary.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::Error;
use crate::record::{CommitLogRecord, LogRecord, PrepareFlags, PrepareLogRecord};

/// Magic bytes identifying a Tidelog file (ASCII "TLOG").
const MAGIC: [u8; 4] = [0x54, 0x4C, 0x4F, 0x47];

/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;

/// Size of the file header in bytes (magic + format version).
pub(crate) const HEADER_SIZE: usize = 8;

/// Kind tag for a prepare record frame.
const KIND_PREPARE: u8 = 1;

/// Kind tag for a commit record frame.
const KIND_COMMIT: u8 = 2;

/// Size of the length prefix field in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Result of attempting to decode a value from a byte buffer.
///
/// Distinguishes between a successfully decoded value and a buffer that does
/// not contain enough bytes to form a complete frame. This distinction is
/// critical for crash recovery: a truncated trailing frame is expected after
/// an unclean shutdown, whereas a checksum mismatch in the middle of the log
/// indicates corruption.
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    /// A full value was successfully decoded from the buffer.
    Complete {
        /// The decoded value.
        value: T,
        /// Total number of bytes consumed from the buffer.
        consumed: usize,
    },
    /// The buffer does not contain enough bytes to form a complete frame.
    Incomplete,
}

/// Encode the file header as a fixed 8-byte array.
///
/// The header consists of a 4-byte magic number (`TLOG` in ASCII) followed by
/// a 4-byte format version in little-endian encoding.
pub fn encode_header() -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf
}

/// Decode and validate the file header.
///
/// # Errors
///
/// Returns [`Error::InvalidHeader`] if the magic number is wrong or the
/// format version is unsupported.
pub fn decode_header(buf: &[u8; 8]) -> Result<u32, Error> {
    if buf[0..4] != MAGIC {
        return Err(Error::InvalidHeader(
            "wrong magic bytes: expected TLOG".to_string(),
        ));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != FORMAT_VERSION {
        return Err(Error::InvalidHeader(format!(
            "unsupported format version: {version}"
        )));
    }
    Ok(version)
}

/// Append a length-prefixed string to `buf` (u16 length + UTF-8 bytes).
fn put_str16(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Append a length-prefixed byte buffer to `buf` (u32 length + bytes).
fn put_bytes32(buf: &mut Vec<u8>, b: &Bytes) {
    buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
    buf.extend_from_slice(b);
}

/// Encode a [`LogRecord`] into the binary on-disk frame format.
///
/// The returned buffer contains the length prefix, the kind tag, all record
/// fields, and a trailing CRC32 checksum covering everything between the
/// length prefix and the checksum. The caller can append it directly to the
/// log file.
pub fn encode_record(record: &LogRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    // Reserve the length prefix; patched once the body size is known.
    buf.extend_from_slice(&[0u8; LENGTH_PREFIX_SIZE]);

    // -- Begin body (CRC32 covers from here through the last field) --
    match record {
        LogRecord::Prepare(p) => {
            buf.push(KIND_PREPARE);
            buf.extend_from_slice(&p.log_position.to_le_bytes());
            buf.extend_from_slice(&p.transaction_position.to_le_bytes());
            buf.extend_from_slice(&p.transaction_offset.to_le_bytes());
            buf.extend_from_slice(&p.expected_version.to_le_bytes());
            buf.extend_from_slice(&p.timestamp.to_le_bytes());
            buf.extend_from_slice(&p.flags.bits().to_le_bytes());
            buf.extend_from_slice(p.event_id.as_bytes());
            put_str16(&mut buf, &p.event_stream_id);
            put_str16(&mut buf, &p.event_type);
            put_bytes32(&mut buf, &p.metadata);
            put_bytes32(&mut buf, &p.data);
        }
        LogRecord::Commit(c) => {
            buf.push(KIND_COMMIT);
            buf.extend_from_slice(&c.log_position.to_le_bytes());
            buf.extend_from_slice(&c.transaction_position.to_le_bytes());
            buf.extend_from_slice(&c.first_event_number.to_le_bytes());
            buf.extend_from_slice(&c.event_count.to_le_bytes());
            buf.extend_from_slice(&c.timestamp.to_le_bytes());
            put_str16(&mut buf, &c.event_stream_id);
        }
    }
    // -- End body --

    let crc = crc32fast::hash(&buf[LENGTH_PREFIX_SIZE..]);
    buf.extend_from_slice(&crc.to_le_bytes());

    // frame_length: byte count from the kind tag through the checksum (inclusive).
    let frame_length = (buf.len() - LENGTH_PREFIX_SIZE) as u32;
    buf[0..LENGTH_PREFIX_SIZE].copy_from_slice(&frame_length.to_le_bytes());

    buf
}

/// Decode a single record frame from the start of a byte buffer.
///
/// Handles three cases:
///
/// 1. **Complete frame** -- returns [`DecodeOutcome::Complete`] with the
///    decoded record and the total number of bytes consumed.
/// 2. **Incomplete data** -- the buffer is too short to contain a full frame.
///    Returns [`DecodeOutcome::Incomplete`].
/// 3. **Corrupt data** -- the checksum does not match, the kind tag is
///    unknown, or a field is malformed. Returns [`Error::CorruptRecord`].
///
/// # Errors
///
/// Returns [`Error::CorruptRecord`] on checksum mismatch, an unknown kind
/// tag, or malformed field data (e.g., invalid UTF-8 in a stream id).
pub fn decode_record(buf: &[u8]) -> Result<DecodeOutcome<LogRecord>, Error> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(DecodeOutcome::Incomplete);
    }

    let frame_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = LENGTH_PREFIX_SIZE + frame_length;

    if buf.len() < total {
        return Ok(DecodeOutcome::Incomplete);
    }

    // Slice the body (kind tag through checksum).
    let body = &buf[LENGTH_PREFIX_SIZE..total];
    if body.len() < 5 {
        return Err(Error::CorruptRecord {
            position: 0,
            detail: "record frame too short for kind tag and checksum".to_string(),
        });
    }

    let crc_offset = body.len() - 4;
    let stored_crc = u32::from_le_bytes([
        body[crc_offset],
        body[crc_offset + 1],
        body[crc_offset + 2],
        body[crc_offset + 3],
    ]);
    let computed_crc = crc32fast::hash(&body[..crc_offset]);

    if stored_crc != computed_crc {
        return Err(Error::CorruptRecord {
            position: 0,
            detail: format!(
                "CRC32 mismatch: stored {stored_crc:#010X}, computed {computed_crc:#010X}"
            ),
        });
    }

    let protected = &body[..crc_offset];
    let kind = protected[0];
    let mut cursor = 1;

    // Helper macro: read N bytes from `protected` at `cursor`, advance cursor,
    // or return CorruptRecord if the remaining data is too short.
    macro_rules! read_bytes {
        ($n:expr) => {{
            if cursor + $n > protected.len() {
                return Err(Error::CorruptRecord {
                    position: 0,
                    detail: "unexpected end of record frame".to_string(),
                });
            }
            let start = cursor;
            cursor += $n;
            &protected[start..cursor]
        }};
    }

    macro_rules! read_u64 {
        () => {
            u64::from_le_bytes(read_bytes!(8).try_into().expect("8 bytes for u64"))
        };
    }
    macro_rules! read_i64 {
        () => {
            i64::from_le_bytes(read_bytes!(8).try_into().expect("8 bytes for i64"))
        };
    }
    macro_rules! read_u32 {
        () => {
            u32::from_le_bytes(read_bytes!(4).try_into().expect("4 bytes for u32"))
        };
    }
    macro_rules! read_u16 {
        () => {
            u16::from_le_bytes(read_bytes!(2).try_into().expect("2 bytes for u16"))
        };
    }
    macro_rules! read_str16 {
        () => {{
            let len = read_u16!() as usize;
            let raw = read_bytes!(len);
            std::str::from_utf8(raw)
                .map_err(|e| Error::CorruptRecord {
                    position: 0,
                    detail: format!("invalid UTF-8 in string field: {e}"),
                })?
                .to_string()
        }};
    }
    macro_rules! read_bytes32 {
        () => {{
            let len = read_u32!() as usize;
            Bytes::copy_from_slice(read_bytes!(len))
        }};
    }

    let record = match kind {
        KIND_PREPARE => {
            let log_position = read_u64!();
            let transaction_position = read_u64!();
            let transaction_offset = read_u32!();
            let expected_version = read_i64!();
            let timestamp = read_u64!();
            let flags = PrepareFlags::from_bits(read_u16!());
            let event_id = Uuid::from_bytes(
                read_bytes!(16).try_into().expect("16 bytes for UUID"),
            );
            let event_stream_id = read_str16!();
            let event_type = read_str16!();
            let metadata = read_bytes32!();
            let data = read_bytes32!();

            LogRecord::Prepare(PrepareLogRecord {
                log_position,
                transaction_position,
                transaction_offset,
                expected_version,
                event_stream_id,
                event_id,
                event_type,
                data,
                metadata,
                timestamp,
                flags,
            })
        }
        KIND_COMMIT => {
            let log_position = read_u64!();
            let transaction_position = read_u64!();
            let first_event_number = read_i64!();
            let event_count = read_u32!();
            let timestamp = read_u64!();
            let event_stream_id = read_str16!();

            LogRecord::Commit(CommitLogRecord {
                log_position,
                transaction_position,
                event_stream_id,
                first_event_number,
                event_count,
                timestamp,
            })
        }
        other => {
            return Err(Error::CorruptRecord {
                position: 0,
                detail: format!("unknown record kind tag: {other}"),
            });
        }
    };
    // Cursor is intentionally not read after the last field; suppress the warning.
    let _ = cursor;

    Ok(DecodeOutcome::Complete {
        value: record,
        consumed: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prepare() -> PrepareLogRecord {
        PrepareLogRecord {
            log_position: 8,
            transaction_position: 8,
            transaction_offset: 0,
            expected_version: -1,
            event_stream_id: "orders-1".to_string(),
            event_id: Uuid::new_v4(),
            event_type: "OrderPlaced".to_string(),
            data: Bytes::from_static(b"{\"qty\":2}"),
            metadata: Bytes::from_static(b"corr-9"),
            timestamp: 1_700_000_000_000,
            flags: PrepareFlags::DATA
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END,
        }
    }

    fn sample_commit() -> CommitLogRecord {
        CommitLogRecord {
            log_position: 160,
            transaction_position: 8,
            event_stream_id: "orders-1".to_string(),
            first_event_number: 0,
            event_count: 1,
            timestamp: 1_700_000_000_050,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = encode_header();
        assert_eq!(decode_header(&header).expect("valid header"), FORMAT_VERSION);
    }

    #[test]
    fn header_wrong_magic_rejected() {
        let mut header = encode_header();
        header[0] = b'X';
        assert!(matches!(
            decode_header(&header),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn header_wrong_version_rejected() {
        let mut header = encode_header();
        header[4..8].copy_from_slice(&99u32.to_le_bytes());
        let err = decode_header(&header).unwrap_err();
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn prepare_round_trip() {
        let prepare = sample_prepare();
        let encoded = encode_record(&LogRecord::Prepare(prepare.clone()));

        match decode_record(&encoded).expect("decode should succeed") {
            DecodeOutcome::Complete { value, consumed } => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(value, LogRecord::Prepare(prepare));
            }
            DecodeOutcome::Incomplete => panic!("expected complete frame"),
        }
    }

    #[test]
    fn commit_round_trip() {
        let commit = sample_commit();
        let encoded = encode_record(&LogRecord::Commit(commit.clone()));

        match decode_record(&encoded).expect("decode should succeed") {
            DecodeOutcome::Complete { value, consumed } => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(value, LogRecord::Commit(commit));
            }
            DecodeOutcome::Incomplete => panic!("expected complete frame"),
        }
    }

    #[test]
    fn empty_payloads_round_trip() {
        let mut prepare = sample_prepare();
        prepare.data = Bytes::new();
        prepare.metadata = Bytes::new();
        let encoded = encode_record(&LogRecord::Prepare(prepare.clone()));

        match decode_record(&encoded).expect("decode should succeed") {
            DecodeOutcome::Complete { value, .. } => {
                assert_eq!(value, LogRecord::Prepare(prepare));
            }
            DecodeOutcome::Incomplete => panic!("expected complete frame"),
        }
    }

    #[test]
    fn truncated_buffer_is_incomplete_not_corrupt() {
        let encoded = encode_record(&LogRecord::Prepare(sample_prepare()));

        // Every strict prefix must decode as Incomplete, never as corrupt:
        // a trailing partial frame is the expected crash artifact.
        for cut in 0..encoded.len() {
            match decode_record(&encoded[..cut]) {
                Ok(DecodeOutcome::Incomplete) => {}
                other => panic!("prefix of {cut} bytes should be Incomplete, got {other:?}"),
            }
        }
    }

    #[test]
    fn flipped_payload_byte_is_corrupt() {
        let mut encoded = encode_record(&LogRecord::Prepare(sample_prepare()));
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xFF;

        let err = decode_record(&encoded).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }), "got: {err:?}");
    }

    #[test]
    fn unknown_kind_tag_is_corrupt() {
        let mut encoded = encode_record(&LogRecord::Commit(sample_commit()));
        // Patch the kind tag and fix up the CRC so only the tag is at fault.
        encoded[LENGTH_PREFIX_SIZE] = 7;
        let body_end = encoded.len() - 4;
        let crc = crc32fast::hash(&encoded[LENGTH_PREFIX_SIZE..body_end]);
        let crc_bytes = crc.to_le_bytes();
        encoded[body_end..].copy_from_slice(&crc_bytes);

        let err = decode_record(&encoded).unwrap_err();
        assert!(
            matches!(err, Error::CorruptRecord { ref detail, .. } if detail.contains("kind")),
            "got: {err:?}"
        );
    }

    #[test]
    fn consecutive_frames_decode_independently() {
        let prepare = sample_prepare();
        let commit = sample_commit();
        let mut buf = encode_record(&LogRecord::Prepare(prepare.clone()));
        let first_len = buf.len();
        buf.extend_from_slice(&encode_record(&LogRecord::Commit(commit.clone())));

        match decode_record(&buf).expect("first frame") {
            DecodeOutcome::Complete { value, consumed } => {
                assert_eq!(consumed, first_len);
                assert_eq!(value, LogRecord::Prepare(prepare));
            }
            DecodeOutcome::Incomplete => panic!("expected complete frame"),
        }
        match decode_record(&buf[first_len..]).expect("second frame") {
            DecodeOutcome::Complete { value, .. } => {
                assert_eq!(value, LogRecord::Commit(commit));
            }
            DecodeOutcome::Incomplete => panic!("expected complete frame"),
        }
    }
}
