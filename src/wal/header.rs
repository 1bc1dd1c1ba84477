// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const MAGIC_BYTES: [u8; 4] = *b"WAL!";

pub const WAL_VERSION: u16 = 1;

/// Size of the fixed log file header; records start after it.
pub const WAL_HEADER_BYTES: u64 = 4_096;

/// Log file header
///
/// Rewritten on every commit and checkpoint so recovery knows how far the
/// record stream is authoritative.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalHeader {
    /// Log creation time, epoch milliseconds
    pub created_ms: i64,

    /// Highest transaction id ever issued
    pub last_tx_id: u64,

    /// Append offset as of the last durable commit; recovery scans up to
    /// here
    pub committed_offset: u64,

    /// Append offset as of the last checkpoint; recovery scans from here
    pub checkpoint_offset: u64,

    /// Records appended since the last truncation
    pub total_count: u64,

    /// Records replayed by the last recovery
    pub processed_count: u64,
}

impl WalHeader {
    /// A fresh header for an empty log.
    #[must_use]
    pub fn fresh(created_ms: i64) -> Self {
        Self {
            created_ms,
            last_tx_id: 0,
            committed_offset: WAL_HEADER_BYTES,
            checkpoint_offset: WAL_HEADER_BYTES,
            total_count: 0,
            processed_count: 0,
        }
    }
}

impl Encode for WalHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&MAGIC_BYTES)?;
        writer.write_u16::<LittleEndian>(WAL_VERSION)?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<LittleEndian>(WAL_HEADER_BYTES as u16)?;
        writer.write_i64::<LittleEndian>(self.created_ms)?;
        writer.write_u64::<LittleEndian>(self.last_tx_id)?;
        writer.write_u64::<LittleEndian>(self.committed_offset)?;
        writer.write_u64::<LittleEndian>(self.checkpoint_offset)?;
        writer.write_u64::<LittleEndian>(self.total_count)?;
        writer.write_u64::<LittleEndian>(self.processed_count)?;

        Ok(())
    }
}

impl Decode for WalHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut magic = [0u8; MAGIC_BYTES.len()];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader("WalHeader"));
        }

        let version = reader.read_u16::<LittleEndian>()?;
        if version != WAL_VERSION {
            return Err(DecodeError::InvalidHeader("WalHeader"));
        }

        let _header_size = reader.read_u16::<LittleEndian>()?;

        Ok(Self {
            created_ms: reader.read_i64::<LittleEndian>()?,
            last_tx_id: reader.read_u64::<LittleEndian>()?,
            committed_offset: reader.read_u64::<LittleEndian>()?,
            checkpoint_offset: reader.read_u64::<LittleEndian>()?,
            total_count: reader.read_u64::<LittleEndian>()?,
            processed_count: reader.read_u64::<LittleEndian>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn wal_header_roundtrip() -> crate::Result<()> {
        let header = WalHeader {
            created_ms: 1_700_000_000_000,
            last_tx_id: 99,
            committed_offset: 8_192,
            checkpoint_offset: 4_096,
            total_count: 10,
            processed_count: 3,
        };

        let bytes = header.encode_into_vec();
        let decoded = WalHeader::decode_from(&mut Cursor::new(bytes))?;
        assert_eq!(header, decoded);

        Ok(())
    }

    #[test]
    fn wal_header_rejects_bad_magic() {
        let mut bytes = WalHeader::fresh(0).encode_into_vec();
        bytes[0] = b'X';

        assert!(WalHeader::decode_from(&mut Cursor::new(bytes)).is_err());
    }
}
