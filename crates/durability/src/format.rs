//! Record file format
//!
//! Each durable record lives in its own file. The payload is MessagePack;
//! the frame carries the record kind so a coordination record can never be
//! decoded as a deletion task, and a CRC32 over everything before it.
//!
//! # Format
//!
//! ```text
//! +---------------------+
//! | Magic: "FRRC"       | 4 bytes
//! | Format Version      | 4 bytes (u32 LE)
//! | Kind Length         | 2 bytes (u16 LE)
//! | Kind                | variable (UTF-8)
//! | Payload Length      | 4 bytes (u32 LE)
//! | Payload             | variable (MessagePack)
//! | CRC32               | 4 bytes
//! +---------------------+
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Record magic bytes: "FRRC"
pub const RECORD_MAGIC: [u8; 4] = *b"FRRC";

/// Current record format version
pub const RECORD_FORMAT_VERSION: u32 = 1;

const FIXED_OVERHEAD: usize = 4 + 4 + 2 + 4 + 4;

/// Errors decoding or encoding a record frame
#[derive(Debug, thiserror::Error)]
pub enum RecordFormatError {
    /// Frame shorter than its headers claim
    #[error("record too short")]
    TooShort,

    /// Invalid magic bytes
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// Written by an unknown format version
    #[error("unsupported record format version {0}")]
    UnsupportedVersion(u32),

    /// Frame holds a different record kind
    #[error("record kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// Kind the caller asked for
        expected: String,
        /// Kind stored in the frame
        found: String,
    },

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// CRC32 stored in the frame
        expected: u32,
        /// CRC32 computed over the frame
        computed: u32,
    },

    /// Payload failed to (de)serialize
    #[error("payload codec error: {0}")]
    Codec(String),
}

/// Encode `record` into a framed byte vector
pub fn encode_record<T: Serialize>(kind: &str, record: &T) -> Result<Vec<u8>, RecordFormatError> {
    let payload =
        rmp_serde::to_vec_named(record).map_err(|e| RecordFormatError::Codec(e.to_string()))?;

    let mut bytes = Vec::with_capacity(FIXED_OVERHEAD + kind.len() + payload.len());
    bytes.extend_from_slice(&RECORD_MAGIC);
    bytes.extend_from_slice(&RECORD_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(kind.len() as u16).to_le_bytes());
    bytes.extend_from_slice(kind.as_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&payload);

    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

/// Decode a framed record of the given kind
pub fn decode_record<T: DeserializeOwned>(kind: &str, bytes: &[u8]) -> Result<T, RecordFormatError> {
    if bytes.len() < FIXED_OVERHEAD {
        return Err(RecordFormatError::TooShort);
    }
    if bytes[0..4] != RECORD_MAGIC {
        return Err(RecordFormatError::InvalidMagic);
    }

    let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = read_u32(crc_bytes, 0)?;
    let computed_crc = crc32fast::hash(data);
    if stored_crc != computed_crc {
        return Err(RecordFormatError::ChecksumMismatch {
            expected: stored_crc,
            computed: computed_crc,
        });
    }

    let version = read_u32(data, 4)?;
    if version != RECORD_FORMAT_VERSION {
        return Err(RecordFormatError::UnsupportedVersion(version));
    }

    let mut cursor = 8;
    let kind_len = u16::from_le_bytes(
        data.get(cursor..cursor + 2)
            .ok_or(RecordFormatError::TooShort)?
            .try_into()
            .map_err(|_| RecordFormatError::TooShort)?,
    ) as usize;
    cursor += 2;

    let found = data
        .get(cursor..cursor + kind_len)
        .ok_or(RecordFormatError::TooShort)?;
    let found = String::from_utf8_lossy(found);
    if found != kind {
        return Err(RecordFormatError::KindMismatch {
            expected: kind.to_string(),
            found: found.into_owned(),
        });
    }
    cursor += kind_len;

    let payload_len = read_u32(data, cursor)? as usize;
    cursor += 4;
    let payload = data
        .get(cursor..cursor + payload_len)
        .ok_or(RecordFormatError::TooShort)?;

    rmp_serde::from_slice(payload).map_err(|e| RecordFormatError::Codec(e.to_string()))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, RecordFormatError> {
    let slice = bytes.get(at..at + 4).ok_or(RecordFormatError::TooShort)?;
    let arr: [u8; 4] = slice.try_into().map_err(|_| RecordFormatError::TooShort)?;
    Ok(u32::from_le_bytes(arr))
}
