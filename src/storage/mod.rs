// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod backend;
pub mod block;
pub mod header;

pub use block::BlockStorage;
pub use header::{BLOCK_HEADER_BYTES, EXTRA_OFFSET, HEADER_BYTES, NO_BLOCK};

use crate::wal::WalStorage;
use enum_dispatch::enum_dispatch;
use std::sync::Arc;

/// Callback fired when a block's cached representation must be dropped:
/// on delete, on free-list reuse, and on WAL commit/rollback touching the
/// block.
pub type InvalidateFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Block-level storage surface.
///
/// Implemented by the plain [`BlockStorage`] and by the WAL wrapper, which
/// intercepts mutations for transactional buffering. Payloads are addressed
/// by the byte offset (block index) of their first block.
#[enum_dispatch]
pub trait Storage {
    /// Persists a payload into a fresh (or reused) chain; returns its block
    /// index.
    fn write(&self, payload: &[u8]) -> crate::Result<u64>;

    /// Overwrites the payload at a block index in place.
    fn write_at(&self, index: u64, payload: &[u8]) -> crate::Result<()>;

    /// Reads the payload at a block index; `None` if the block was freed.
    fn read(&self, index: u64) -> crate::Result<Option<Vec<u8>>>;

    /// Frees the chain at a block index onto the free-list.
    fn delete(&self, index: u64) -> crate::Result<()>;

    /// Reads from the engine-specific extra header area.
    fn read_extra(&self, len: usize) -> crate::Result<Vec<u8>>;

    /// Writes into the engine-specific extra header area.
    fn write_extra(&self, bytes: &[u8]) -> crate::Result<()>;

    /// Data block payload size in bytes.
    fn block_payload(&self) -> u32;

    /// Number of live payloads.
    fn live_count(&self) -> u64;

    /// Current storage size in bytes.
    fn bytes(&self) -> u64;

    /// Whether payloads are stored compressed (such storages cannot host
    /// B+trees).
    fn compressed(&self) -> bool;

    /// Flushes to durable storage.
    fn sync(&self) -> crate::Result<()>;

    /// Installs the cache invalidation callback.
    fn set_invalidation(&self, cb: InvalidateFn);
}

/// The closed set of storage variants
#[enum_dispatch(Storage)]
pub enum AnyStorage {
    /// Unwrapped block storage
    Block(BlockStorage),

    /// WAL-wrapped block storage
    Wal(WalStorage),
}

impl Storage for BlockStorage {
    fn write(&self, payload: &[u8]) -> crate::Result<u64> {
        self.write_impl(payload)
    }

    fn write_at(&self, index: u64, payload: &[u8]) -> crate::Result<()> {
        self.write_at_impl(index, payload)
    }

    fn read(&self, index: u64) -> crate::Result<Option<Vec<u8>>> {
        self.read_impl(index)
    }

    fn delete(&self, index: u64) -> crate::Result<()> {
        self.delete_impl(index)
    }

    fn read_extra(&self, len: usize) -> crate::Result<Vec<u8>> {
        self.read_extra_impl(len)
    }

    fn write_extra(&self, bytes: &[u8]) -> crate::Result<()> {
        self.write_extra_impl(bytes)
    }

    fn block_payload(&self) -> u32 {
        self.block_payload_impl()
    }

    fn live_count(&self) -> u64 {
        self.live_count_impl()
    }

    fn bytes(&self) -> u64 {
        self.bytes_impl()
    }

    fn compressed(&self) -> bool {
        self.compressed_impl()
    }

    fn sync(&self) -> crate::Result<()> {
        self.sync_impl()
    }

    fn set_invalidation(&self, cb: InvalidateFn) {
        self.set_invalidation_impl(cb);
    }
}
