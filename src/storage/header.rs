// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size of the reserved header area at the start of every storage file.
pub const HEADER_BYTES: u64 = 4_096;

/// Size of the fixed per-block header.
pub const BLOCK_HEADER_BYTES: u64 = 16;

/// Offset of the engine-specific extra header area (B+tree root slot,
/// row-table signature) within the file header.
pub const EXTRA_OFFSET: u64 = 64;

/// Sentinel for "no block" in free-list and chain links.
pub const NO_BLOCK: u64 = 0;

/// Storage file header (first 64 bytes of the header area)
///
/// | offset | width | field |
/// |-------:|------:|-------|
/// | 0 | 8 | block count |
/// | 8 | 8 | free-list front |
/// | 16 | 8 | free-list tail (reserved) |
/// | 24 | 2 | format version |
/// | 26 | 28 | reserved |
/// | 54 | 2 | block payload size |
/// | 56 | 8 | live data count |
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileHeader {
    /// Number of blocks ever carved from the file tail
    pub block_count: u64,

    /// Offset of the first free block, or [`NO_BLOCK`]
    pub free_front: u64,

    /// Reserved
    pub free_tail: u64,

    /// Format version, per storage variant
    pub version: u16,

    /// Data block payload size, excluding the block header
    pub block_bytes: u16,

    /// Number of live payloads (first blocks) in the file
    pub live_count: u64,
}

impl FileHeader {
    /// Serialized length of the common header fields.
    #[must_use]
    pub const fn serialized_len() -> usize {
        64
    }
}

impl Encode for FileHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.block_count)?;
        writer.write_u64::<LittleEndian>(self.free_front)?;
        writer.write_u64::<LittleEndian>(self.free_tail)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_all(&[0u8; 28])?;
        writer.write_u16::<LittleEndian>(self.block_bytes)?;
        writer.write_u64::<LittleEndian>(self.live_count)?;

        Ok(())
    }
}

impl Decode for FileHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let block_count = reader.read_u64::<LittleEndian>()?;
        let free_front = reader.read_u64::<LittleEndian>()?;
        let free_tail = reader.read_u64::<LittleEndian>()?;
        let version = reader.read_u16::<LittleEndian>()?;

        let mut reserved = [0u8; 28];
        reader.read_exact(&mut reserved)?;

        let block_bytes = reader.read_u16::<LittleEndian>()?;
        let live_count = reader.read_u64::<LittleEndian>()?;

        if block_bytes == 0 {
            return Err(DecodeError::InvalidHeader("FileHeader"));
        }

        Ok(Self {
            block_count,
            free_front,
            free_tail,
            version,
            block_bytes,
            live_count,
        })
    }
}

/// Block status
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockStatus {
    /// Returned to the free-list
    Free,

    /// Holds payload data
    Live,
}

/// Position of a block within an overflow chain
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockMark {
    /// First block of a payload
    First,

    /// Continuation of an overflow chain
    Continuation,
}

/// Per-block header (16 bytes): status, mark, data length, total length,
/// next-link
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Free or live
    pub status: BlockStatus,

    /// First or continuation
    pub mark: BlockMark,

    /// Payload bytes stored in this block
    pub data_len: u16,

    /// Total payload bytes of the whole chain; only set on the first block
    pub total_len: u32,

    /// Next block of the chain while live; next free block while freed
    pub next: u64,
}

impl Encode for BlockHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(match self.status {
            BlockStatus::Free => 0,
            BlockStatus::Live => 1,
        })?;
        writer.write_u8(match self.mark {
            BlockMark::First => 1,
            BlockMark::Continuation => 2,
        })?;
        writer.write_u16::<LittleEndian>(self.data_len)?;
        writer.write_u32::<LittleEndian>(self.total_len)?;
        writer.write_u64::<LittleEndian>(self.next)?;

        Ok(())
    }
}

impl Decode for BlockHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let status = match reader.read_u8()? {
            0 => BlockStatus::Free,
            1 => BlockStatus::Live,
            tag => return Err(DecodeError::InvalidTag(("BlockStatus", tag))),
        };

        let mark = match reader.read_u8()? {
            1 => BlockMark::First,
            2 => BlockMark::Continuation,
            tag => return Err(DecodeError::InvalidTag(("BlockMark", tag))),
        };

        Ok(Self {
            status,
            mark,
            data_len: reader.read_u16::<LittleEndian>()?,
            total_len: reader.read_u32::<LittleEndian>()?,
            next: reader.read_u64::<LittleEndian>()?,
        })
    }
}
