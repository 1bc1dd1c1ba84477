// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    compression::CompressionType,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Record payload is deflate-compressed
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Record carries no payload; the mutation is already (or only) in origin
pub const FLAG_META_ONLY: u8 = 0b0000_0010;

/// Log record operation
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalOp {
    /// Reserved; transactions begin implicitly
    Begin,

    /// A payload was appended to origin (metadata only)
    Write,

    /// A page was tombstoned
    Delete,

    /// A page image was buffered
    Update,

    /// Transaction committed
    Commit,

    /// Transaction rolled back
    Rollback,

    /// Records before this point are no longer needed for recovery
    Checkpoint,
}

impl From<WalOp> for u8 {
    fn from(value: WalOp) -> Self {
        match value {
            WalOp::Begin => 0x00,
            WalOp::Write => 0x01,
            WalOp::Delete => 0x02,
            WalOp::Update => 0x03,
            WalOp::Commit => 0x10,
            WalOp::Rollback => 0x11,
            WalOp::Checkpoint => 0x20,
        }
    }
}

impl TryFrom<u8> for WalOp {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Begin),
            0x01 => Ok(Self::Write),
            0x02 => Ok(Self::Delete),
            0x03 => Ok(Self::Update),
            0x10 => Ok(Self::Commit),
            0x11 => Ok(Self::Rollback),
            0x20 => Ok(Self::Checkpoint),
            _ => Err(()),
        }
    }
}

/// One log record: fixed header plus optional payload
///
/// Layout: op(1), transaction id(8), checksum(2, reserved), file id(4),
/// page offset(8), flags(1), original size(4), compressed size(4, only if
/// the compressed flag is set), payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalRecord {
    /// Operation tag
    pub op: WalOp,

    /// Issuing transaction
    pub tx_id: u64,

    /// Wrapped storage this record belongs to
    pub file_id: u32,

    /// Page (block) offset within the storage
    pub page: u64,

    /// `FLAG_COMPRESSED` | `FLAG_META_ONLY`
    pub flags: u8,

    /// Uncompressed payload size
    pub orig_len: u32,

    /// Payload bytes, compressed iff `FLAG_COMPRESSED`
    pub payload: Option<Vec<u8>>,
}

impl WalRecord {
    /// Metadata-only record for an append already materialized in origin.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(tx_id: u64, file_id: u32, page: u64, len: usize) -> Self {
        Self {
            op: WalOp::Write,
            tx_id,
            file_id,
            page,
            flags: FLAG_META_ONLY,
            orig_len: len as u32,
            payload: None,
        }
    }

    /// Page image record; compresses the payload above the threshold.
    ///
    /// Passing no payload produces a metadata-only record (page-data
    /// disabled).
    pub fn update(
        tx_id: u64,
        file_id: u32,
        page: u64,
        payload: Option<&[u8]>,
        compression_threshold: u32,
    ) -> crate::Result<Self> {
        let Some(payload) = payload else {
            return Ok(Self {
                op: WalOp::Update,
                tx_id,
                file_id,
                page,
                flags: FLAG_META_ONLY,
                orig_len: 0,
                payload: None,
            });
        };

        #[allow(clippy::cast_possible_truncation)]
        let orig_len = payload.len() as u32;

        let (flags, bytes) =
            if compression_threshold > 0 && payload.len() >= compression_threshold as usize {
                (
                    FLAG_COMPRESSED,
                    CompressionType::Deflate.compress(payload)?,
                )
            } else {
                (0, payload.to_vec())
            };

        Ok(Self {
            op: WalOp::Update,
            tx_id,
            file_id,
            page,
            flags,
            orig_len,
            payload: Some(bytes),
        })
    }

    /// Tombstone record.
    #[must_use]
    pub fn delete(tx_id: u64, file_id: u32, page: u64) -> Self {
        Self {
            op: WalOp::Delete,
            tx_id,
            file_id,
            page,
            flags: FLAG_META_ONLY,
            orig_len: 0,
            payload: None,
        }
    }

    /// Commit marker.
    #[must_use]
    pub fn commit(tx_id: u64) -> Self {
        Self::marker(WalOp::Commit, tx_id)
    }

    /// Rollback marker.
    #[must_use]
    pub fn rollback(tx_id: u64) -> Self {
        Self::marker(WalOp::Rollback, tx_id)
    }

    /// Checkpoint marker.
    #[must_use]
    pub fn checkpoint() -> Self {
        Self::marker(WalOp::Checkpoint, 0)
    }

    fn marker(op: WalOp, tx_id: u64) -> Self {
        Self {
            op,
            tx_id,
            file_id: 0,
            page: 0,
            flags: FLAG_META_ONLY,
            orig_len: 0,
            payload: None,
        }
    }

    /// The payload with compression undone, if the record carries one.
    pub fn payload_decompressed(&self) -> crate::Result<Option<Vec<u8>>> {
        let Some(bytes) = &self.payload else {
            return Ok(None);
        };

        if self.flags & FLAG_COMPRESSED == 0 {
            return Ok(Some(bytes.clone()));
        }

        let out = CompressionType::Deflate.decompress(bytes)?;

        if out.len() != self.orig_len as usize {
            return Err(crate::Error::StorageRead(format!(
                "log record payload decompressed to {} bytes, expected {}",
                out.len(),
                self.orig_len
            )));
        }

        Ok(Some(out))
    }
}

impl Encode for WalRecord {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.op.into())?;
        writer.write_u64::<LittleEndian>(self.tx_id)?;
        writer.write_u16::<LittleEndian>(0)?; // checksum, reserved
        writer.write_u32::<LittleEndian>(self.file_id)?;
        writer.write_u64::<LittleEndian>(self.page)?;
        writer.write_u8(self.flags)?;
        writer.write_u32::<LittleEndian>(self.orig_len)?;

        if let Some(payload) = &self.payload {
            if self.flags & FLAG_COMPRESSED != 0 {
                #[allow(clippy::cast_possible_truncation)]
                writer.write_u32::<LittleEndian>(payload.len() as u32)?;
            }

            writer.write_all(payload)?;
        }

        Ok(())
    }
}

impl Decode for WalRecord {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let op = WalOp::try_from(reader.read_u8()?)
            .map_err(|()| DecodeError::InvalidHeader("WalRecord"))?;

        let tx_id = reader.read_u64::<LittleEndian>()?;
        let _checksum = reader.read_u16::<LittleEndian>()?;
        let file_id = reader.read_u32::<LittleEndian>()?;
        let page = reader.read_u64::<LittleEndian>()?;
        let flags = reader.read_u8()?;
        let orig_len = reader.read_u32::<LittleEndian>()?;

        let payload = if flags & FLAG_META_ONLY != 0 {
            None
        } else {
            let len = if flags & FLAG_COMPRESSED != 0 {
                reader.read_u32::<LittleEndian>()? as usize
            } else {
                orig_len as usize
            };

            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;

            Some(buf)
        };

        Ok(Self {
            op,
            tx_id,
            file_id,
            page,
            flags,
            orig_len,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn record_marker_roundtrip() -> crate::Result<()> {
        let record = WalRecord::commit(42);
        let bytes = record.encode_into_vec();

        // op + tx + checksum + file + page + flags + orig size
        assert_eq!(1 + 8 + 2 + 4 + 8 + 1 + 4, bytes.len());

        let decoded = WalRecord::decode_from(&mut Cursor::new(bytes))?;
        assert_eq!(record, decoded);

        Ok(())
    }

    #[test]
    fn record_update_uncompressed_roundtrip() -> crate::Result<()> {
        let record = WalRecord::update(7, 1, 4_096, Some(b"page image"), 1_024)?;
        assert_eq!(0, record.flags & FLAG_COMPRESSED);

        let bytes = record.encode_into_vec();
        let decoded = WalRecord::decode_from(&mut Cursor::new(bytes))?;

        assert_eq!(record, decoded);
        assert_eq!(
            Some(b"page image".to_vec()),
            decoded.payload_decompressed()?
        );

        Ok(())
    }

    #[test]
    fn record_update_compressed_roundtrip() -> crate::Result<()> {
        let payload = b"repetitive ".repeat(200);

        let record = WalRecord::update(7, 1, 4_096, Some(&payload), 64)?;
        assert_ne!(0, record.flags & FLAG_COMPRESSED);

        let bytes = record.encode_into_vec();
        assert!(bytes.len() < payload.len());

        let decoded = WalRecord::decode_from(&mut Cursor::new(bytes))?;
        assert_eq!(Some(payload), decoded.payload_decompressed()?);

        Ok(())
    }

    #[test]
    fn record_metadata_only_update() -> crate::Result<()> {
        let record = WalRecord::update(7, 1, 4_096, None, 0)?;
        assert_ne!(0, record.flags & FLAG_META_ONLY);

        let decoded = WalRecord::decode_from(&mut Cursor::new(record.encode_into_vec()))?;
        assert_eq!(None, decoded.payload);

        Ok(())
    }

    #[test]
    fn record_truncated_decode_fails() {
        let bytes = WalRecord::commit(1).encode_into_vec();
        let truncated = &bytes[..bytes.len() - 3];

        assert!(WalRecord::decode_from(&mut Cursor::new(truncated)).is_err());
    }
}
