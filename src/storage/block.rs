// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    backend::{Backing, MmapFile},
    header::{
        BlockHeader, BlockMark, BlockStatus, FileHeader, BLOCK_HEADER_BYTES, EXTRA_OFFSET,
        HEADER_BYTES, NO_BLOCK,
    },
    InvalidateFn,
};
use crate::{
    coding::{Decode, Encode},
    compression::CompressionType,
    meta::{BlockType, StorageOptions},
    pool::BufferPool,
};
use std::{
    borrow::Cow,
    io::Cursor,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

/// Random-access file of fixed-size blocks with a free-list of deleted
/// blocks and overflow chaining for payloads larger than one block.
///
/// Payloads are addressed by the byte offset of their first block. Freed
/// blocks are linked onto the free-list front and reused before the file
/// grows; reads of freed blocks return `None` instead of failing.
pub struct BlockStorage {
    inner: Mutex<Inner>,
    invalidate: Mutex<Option<InvalidateFn>>,
}

impl std::fmt::Debug for BlockStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStorage").finish_non_exhaustive()
    }
}

struct Inner {
    backing: Backing,
    header: FileHeader,
    increment: u64,
    compression: CompressionType,
    read_only: bool,
    pool: Arc<BufferPool>,
}

impl Inner {
    fn block_total(&self) -> u64 {
        BLOCK_HEADER_BYTES + u64::from(self.header.block_bytes)
    }

    fn check_offset(&self, offset: u64) -> crate::Result<()> {
        let total = self.block_total();
        let end = HEADER_BYTES + self.header.block_count * total;

        if offset < HEADER_BYTES || offset >= end || (offset - HEADER_BYTES) % total != 0 {
            return Err(crate::Error::StorageRead(format!(
                "offset {offset} is not a block index"
            )));
        }

        Ok(())
    }

    fn read_block_header(&self, offset: u64) -> crate::Result<BlockHeader> {
        let mut buf = [0u8; BLOCK_HEADER_BYTES as usize];
        self.backing.read_at(offset, &mut buf)?;

        Ok(BlockHeader::decode_from(&mut Cursor::new(buf))?)
    }

    fn write_block_header(&mut self, offset: u64, header: &BlockHeader) -> crate::Result<()> {
        self.backing.write_at(offset, &header.encode_into_vec())
    }

    fn persist_header(&mut self) -> crate::Result<()> {
        let bytes = self.header.encode_into_vec();
        self.backing.write_at(0, &bytes)
    }

    /// Pops the free-list, or carves a fresh block from the file tail.
    ///
    /// Returns the block offset and whether it was reused from the
    /// free-list (callers must invalidate caches for reused offsets).
    fn allocate(&mut self) -> crate::Result<(u64, bool)> {
        let total = self.block_total();

        if self.header.free_front != NO_BLOCK {
            let offset = self.header.free_front;
            let header = self.read_block_header(offset)?;

            if header.status != BlockStatus::Free {
                return Err(crate::Error::Internal(format!(
                    "free-list front {offset} points at a live block"
                )));
            }

            self.header.free_front = header.next;

            return Ok((offset, true));
        }

        let offset = HEADER_BYTES + self.header.block_count * total;
        self.header.block_count += 1;

        let needed = offset + total;
        if needed > self.backing.len() {
            let mut new_len = self.backing.len();
            while new_len < needed {
                new_len += self.increment;
            }
            self.backing.grow_to(new_len)?;
        }

        Ok((offset, false))
    }

    /// Lays the payload over the given chain, writing headers and chunks.
    fn write_chain(&mut self, offsets: &[u64], payload: &[u8]) -> crate::Result<()> {
        let cap = usize::from(self.header.block_bytes);

        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(cap).collect()
        };

        debug_assert_eq!(offsets.len(), chunks.len());

        for (pos, (&offset, chunk)) in offsets.iter().zip(&chunks).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let header = BlockHeader {
                status: BlockStatus::Live,
                mark: if pos == 0 {
                    BlockMark::First
                } else {
                    BlockMark::Continuation
                },
                data_len: chunk.len() as u16,
                total_len: if pos == 0 { payload.len() as u32 } else { 0 },
                next: offsets.get(pos + 1).copied().unwrap_or(NO_BLOCK),
            };

            self.write_block_header(offset, &header)?;
            self.backing.write_at(offset + BLOCK_HEADER_BYTES, chunk)?;
        }

        Ok(())
    }

    /// Links a block onto the free-list front.
    fn free_block(&mut self, offset: u64, mark: BlockMark) -> crate::Result<()> {
        let header = BlockHeader {
            status: BlockStatus::Free,
            mark,
            data_len: 0,
            total_len: 0,
            next: self.header.free_front,
        };

        self.write_block_header(offset, &header)?;
        self.header.free_front = offset;

        Ok(())
    }

    /// Collects a live chain's block offsets, first block included.
    fn collect_chain(&self, offset: u64) -> crate::Result<Vec<u64>> {
        let mut chain = vec![offset];
        let mut header = self.read_block_header(offset)?;

        while header.next != NO_BLOCK {
            chain.push(header.next);
            header = self.read_block_header(header.next)?;

            if header.status != BlockStatus::Live || header.mark != BlockMark::Continuation {
                return Err(crate::Error::StorageRead(format!(
                    "torn overflow chain at block {offset}"
                )));
            }
        }

        Ok(chain)
    }

    fn guard_writable(&self) -> crate::Result<()> {
        if self.read_only {
            return Err(crate::Error::InvalidOperation(
                "storage is read-only".into(),
            ));
        }

        Ok(())
    }
}

fn chain_len(payload_len: usize, cap: usize) -> usize {
    payload_len.div_ceil(cap).max(1)
}

impl BlockStorage {
    /// Creates a fresh storage file, truncating any previous content.
    pub fn create(path: &Path, opts: &StorageOptions) -> crate::Result<Self> {
        Self::build(path, opts, true, false)
    }

    /// Opens an existing storage file.
    pub fn open(path: &Path, opts: &StorageOptions, read_only: bool) -> crate::Result<Self> {
        Self::build(path, opts, false, read_only)
    }

    /// Creates an in-process storage without a file.
    pub fn memory(opts: &StorageOptions) -> crate::Result<Self> {
        let header = FileHeader {
            block_count: 0,
            free_front: NO_BLOCK,
            free_tail: NO_BLOCK,
            version: BlockType::Memory.format_version(),
            block_bytes: opts.block_bytes,
            live_count: 0,
        };

        let mut inner = Inner {
            backing: Backing::Memory(vec![0; HEADER_BYTES as usize]),
            header,
            increment: normalized_increment(opts),
            compression: CompressionType::None,
            read_only: false,
            pool: BufferPool::new(),
        };

        inner.persist_header()?;

        Ok(Self {
            inner: Mutex::new(inner),
            invalidate: Mutex::new(None),
        })
    }

    fn build(path: &Path, opts: &StorageOptions, create: bool, read_only: bool) -> crate::Result<Self> {
        let increment = normalized_increment(opts);
        let min_len = HEADER_BYTES + increment;

        if !create && !path.exists() {
            return Err(crate::Error::StorageRead(format!(
                "no storage file at {}",
                path.display()
            )));
        }

        let backing = Backing::Mmap(MmapFile::open(path, min_len, create)?);

        let header = if create {
            FileHeader {
                block_count: 0,
                free_front: NO_BLOCK,
                free_tail: NO_BLOCK,
                version: opts.block_type.format_version(),
                block_bytes: opts.block_bytes,
                live_count: 0,
            }
        } else {
            let mut buf = [0u8; FileHeader::serialized_len()];
            backing.read_at(0, &mut buf)?;
            let header = FileHeader::decode_from(&mut Cursor::new(buf))?;

            let expected = opts.block_type.format_version();

            // Version 0 is a legacy spelling of the mmap variant
            let matches = header.version == expected || (expected == 1 && header.version == 0);

            if !matches {
                return Err(crate::Error::InvalidVersion(header.version));
            }

            header
        };

        let mut inner = Inner {
            backing,
            header,
            increment,
            compression: opts.block_type.compression()?,
            read_only,
            pool: BufferPool::new(),
        };

        if create {
            inner.persist_header()?;
        }

        log::trace!(
            "opened block storage {path:?}, block payload {}, {} live payloads",
            inner.header.block_bytes,
            inner.header.live_count,
        );

        Ok(Self {
            inner: Mutex::new(inner),
            invalidate: Mutex::new(None),
        })
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("storage lock poisoned")
    }

    fn fire_invalidate(&self, offset: u64) {
        #[allow(clippy::expect_used)]
        let cb = self
            .invalidate
            .lock()
            .expect("invalidate lock poisoned")
            .clone();

        if let Some(cb) = cb {
            cb(offset);
        }
    }

    pub(crate) fn write_impl(&self, payload: &[u8]) -> crate::Result<u64> {
        let mut reused = Vec::new();

        let first = {
            let mut inner = self.lock();
            inner.guard_writable()?;

            let data: Cow<[u8]> = match inner.compression {
                CompressionType::None => Cow::Borrowed(payload),
                other => Cow::Owned(other.compress(payload)?),
            };

            let count = chain_len(data.len(), usize::from(inner.header.block_bytes));

            let mut offsets = Vec::with_capacity(count);
            for _ in 0..count {
                let (offset, was_free) = inner.allocate()?;
                offsets.push(offset);

                if was_free {
                    reused.push(offset);
                }
            }

            inner.write_chain(&offsets, &data)?;
            inner.header.live_count += 1;
            inner.persist_header()?;

            offsets.first().copied().ok_or_else(|| {
                crate::Error::Internal("write allocated no blocks".into())
            })?
        };

        for offset in reused {
            self.fire_invalidate(offset);
        }

        Ok(first)
    }

    pub(crate) fn write_at_impl(&self, offset: u64, payload: &[u8]) -> crate::Result<()> {
        let mut reused = Vec::new();

        {
            let mut inner = self.lock();
            inner.guard_writable()?;
            inner.check_offset(offset)?;

            let head = inner.read_block_header(offset)?;
            if head.status != BlockStatus::Live || head.mark != BlockMark::First {
                return Err(crate::Error::StorageWrite(format!(
                    "overwrite of freed or continuation block {offset}"
                )));
            }

            let data: Cow<[u8]> = match inner.compression {
                CompressionType::None => Cow::Borrowed(payload),
                other => Cow::Owned(other.compress(payload)?),
            };

            let needed = chain_len(data.len(), usize::from(inner.header.block_bytes));

            let mut chain = inner.collect_chain(offset)?;

            while chain.len() < needed {
                let (extra, was_free) = inner.allocate()?;
                chain.push(extra);

                if was_free {
                    reused.push(extra);
                }
            }

            let spare = chain.split_off(needed);

            inner.write_chain(&chain, &data)?;

            for off in spare {
                inner.free_block(off, BlockMark::Continuation)?;
            }

            inner.persist_header()?;
        }

        for off in reused {
            self.fire_invalidate(off);
        }

        Ok(())
    }

    pub(crate) fn read_impl(&self, offset: u64) -> crate::Result<Option<Vec<u8>>> {
        let inner = self.lock();
        inner.check_offset(offset)?;

        let head = inner.read_block_header(offset)?;

        if head.status == BlockStatus::Free {
            return Ok(None);
        }

        if head.mark != BlockMark::First {
            return Err(crate::Error::StorageRead(format!(
                "block {offset} is not a chain head"
            )));
        }

        let total = head.total_len as usize;
        let cap = usize::from(inner.header.block_bytes);

        let mut out = Vec::with_capacity(total);
        let mut scratch = inner.pool.get(cap);

        let mut current = offset;
        let mut header = head;

        while out.len() < total {
            let take = usize::from(header.data_len).min(total - out.len());

            let chunk = scratch.get_mut(..take).ok_or_else(|| {
                crate::Error::StorageRead(format!("oversized data length in block {current}"))
            })?;
            inner
                .backing
                .read_at(current + BLOCK_HEADER_BYTES, chunk)?;
            out.extend_from_slice(chunk);

            if out.len() >= total {
                break;
            }

            if header.next == NO_BLOCK {
                return Err(crate::Error::StorageRead(format!(
                    "torn overflow chain at block {offset}"
                )));
            }

            current = header.next;
            header = inner.read_block_header(current)?;

            if header.status != BlockStatus::Live || header.mark != BlockMark::Continuation {
                return Err(crate::Error::StorageRead(format!(
                    "torn overflow chain at block {offset}"
                )));
            }
        }

        let out = match inner.compression {
            CompressionType::None => out,
            other => other.decompress(&out)?,
        };

        Ok(Some(out))
    }

    pub(crate) fn delete_impl(&self, offset: u64) -> crate::Result<()> {
        {
            let mut inner = self.lock();
            inner.guard_writable()?;
            inner
                .check_offset(offset)
                .map_err(|_| crate::Error::StorageDelete(format!("bad block index {offset}")))?;

            let head = inner.read_block_header(offset)?;
            if head.status != BlockStatus::Live || head.mark != BlockMark::First {
                return Err(crate::Error::StorageDelete(format!(
                    "delete of freed or continuation block {offset}"
                )));
            }

            let chain = inner.collect_chain(offset)?;

            for &off in &chain {
                let mark = if off == offset {
                    BlockMark::First
                } else {
                    BlockMark::Continuation
                };
                inner.free_block(off, mark)?;
            }

            inner.header.live_count -= 1;
            inner.persist_header()?;
        }

        self.fire_invalidate(offset);

        Ok(())
    }

    pub(crate) fn read_extra_impl(&self, len: usize) -> crate::Result<Vec<u8>> {
        let inner = self.lock();

        if EXTRA_OFFSET + len as u64 > HEADER_BYTES {
            return Err(crate::Error::StorageRead(
                "extra header read beyond header area".into(),
            ));
        }

        let mut buf = vec![0u8; len];
        inner.backing.read_at(EXTRA_OFFSET, &mut buf)?;

        Ok(buf)
    }

    pub(crate) fn write_extra_impl(&self, bytes: &[u8]) -> crate::Result<()> {
        let mut inner = self.lock();
        inner.guard_writable()?;

        if EXTRA_OFFSET + bytes.len() as u64 > HEADER_BYTES {
            return Err(crate::Error::StorageWrite(
                "extra header write beyond header area".into(),
            ));
        }

        inner.backing.write_at(EXTRA_OFFSET, bytes)
    }

    pub(crate) fn live_count_impl(&self) -> u64 {
        self.lock().header.live_count
    }

    pub(crate) fn bytes_impl(&self) -> u64 {
        self.lock().backing.len()
    }

    pub(crate) fn block_payload_impl(&self) -> u32 {
        u32::from(self.lock().header.block_bytes)
    }

    pub(crate) fn compressed_impl(&self) -> bool {
        self.lock().compression != CompressionType::None
    }

    pub(crate) fn sync_impl(&self) -> crate::Result<()> {
        self.lock().backing.sync()
    }

    pub(crate) fn set_invalidation_impl(&self, cb: InvalidateFn) {
        #[allow(clippy::expect_used)]
        let mut guard = self.invalidate.lock().expect("invalidate lock poisoned");
        *guard = Some(cb);
    }

    /// Offsets currently linked on the free-list, front first (test/verify
    /// support).
    #[doc(hidden)]
    pub fn free_list(&self) -> crate::Result<Vec<u64>> {
        let inner = self.lock();

        let mut offsets = Vec::new();
        let mut current = inner.header.free_front;

        while current != NO_BLOCK {
            offsets.push(current);
            current = inner.read_block_header(current)?.next;
        }

        Ok(offsets)
    }
}

fn normalized_increment(opts: &StorageOptions) -> u64 {
    let block_total = BLOCK_HEADER_BYTES + u64::from(opts.block_bytes);
    opts.increment.max(block_total)
}
