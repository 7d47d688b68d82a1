//! Key encoding for partition logs stored in SlateDB.
//!
//! Each partition log is its own SlateDB instance, so keys only need to be
//! unique within one partition.
//!
//! ## Entry Keys
//!
//! Format: `r<offset:8>` (9 bytes). Big-endian offsets keep lexicographic
//! order equal to numeric order, so a range scan walks entries in offset order.
//!
//! ## Metadata Keys
//!
//! Metadata keys start with `_` and sort before entry keys:
//! - `_hwm` committed high-watermark
//! - `_oldest` oldest retained offset
//! - `_newest` checkpoint of the newest offset (a lower bound used by recovery)
//! - `_readonly` readonly flag (1 byte)

use crate::types::Offset;

/// Prefix byte for entry keys.
pub const RECORD_KEY_PREFIX: u8 = b'r';

pub const HIGH_WATERMARK_KEY: &[u8] = b"_hwm";
pub const OLDEST_OFFSET_KEY: &[u8] = b"_oldest";
pub const NEWEST_OFFSET_KEY: &[u8] = b"_newest";
pub const READONLY_KEY: &[u8] = b"_readonly";

/// Encode the key of the entry at `offset`.
pub fn encode_record_key(offset: Offset) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = RECORD_KEY_PREFIX;
    key[1..9].copy_from_slice(&offset.to_be_bytes());
    key
}

/// Decode the offset from an entry key.
pub fn decode_record_offset(key: &[u8]) -> Option<Offset> {
    if key.len() >= 9 && key[0] == RECORD_KEY_PREFIX {
        let bytes: [u8; 8] = key[1..9].try_into().ok()?;
        Some(Offset::from_be_bytes(bytes))
    } else {
        None
    }
}

/// Encode an offset-valued metadata entry.
pub fn encode_offset(offset: Offset) -> [u8; 8] {
    offset.to_be_bytes()
}

/// Decode an offset-valued metadata entry.
pub fn decode_offset(bytes: &[u8]) -> Option<Offset> {
    let bytes: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(Offset::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_ordering() {
        let keys: Vec<_> = [0i64, 1, 255, 256, 70_000]
            .iter()
            .map(|o| encode_record_key(*o))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_record_key_decode() {
        assert_eq!(decode_record_offset(&encode_record_key(42)), Some(42));
        assert_eq!(decode_record_offset(HIGH_WATERMARK_KEY), None);
        assert_eq!(decode_record_offset(b"r12"), None);
    }

    #[test]
    fn test_metadata_keys_sort_before_records() {
        for key in [HIGH_WATERMARK_KEY, OLDEST_OFFSET_KEY, NEWEST_OFFSET_KEY, READONLY_KEY] {
            assert!(key < encode_record_key(0).as_slice());
        }
    }

    #[test]
    fn test_offset_value_decode() {
        assert_eq!(decode_offset(&encode_offset(-1)), Some(-1));
        assert_eq!(decode_offset(&[1, 2, 3]), None);
    }
}
