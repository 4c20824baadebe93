//! Durability layer for Ferry
//!
//! This crate handles everything that touches disk:
//!
//! - Record format: framed MessagePack payloads with kind tag and CRC32
//! - Record store: one file per record, write-fsync-rename on every change
//!
//! Migration coordination records and range deletion tasks are both kept
//! in a `RecordStore`, each kind in its own directory.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod format; // Binary on-disk record frame
pub mod store; // Keyed crash-safe record store

pub use format::{decode_record, encode_record, RecordFormatError, RECORD_MAGIC};
pub use store::{
    CorruptRecord, DurabilityError, DurabilityResult, DurableRecord, RecordStore,
    RECORD_EXTENSION,
};

use ferry_core::FerryError;

impl From<DurabilityError> for FerryError {
    fn from(e: DurabilityError) -> Self {
        match e {
            DurabilityError::Io(io) => FerryError::from(io),
            DurabilityError::Format(RecordFormatError::Codec(reason)) => {
                FerryError::Serialization { reason }
            }
            DurabilityError::Format(other) => FerryError::corruption(other.to_string()),
            DurabilityError::InvalidKey(key) => {
                FerryError::invalid_input(format!("record key {:?} is not filesystem safe", key))
            }
        }
    }
}
