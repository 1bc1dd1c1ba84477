// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{record::WalRecord, TxId, Wal};
use crate::storage::{BlockStorage, InvalidateFn, Storage};
use std::sync::{Arc, Mutex, MutexGuard};

/// The header page (extra header area) acts as page 0; commit writes it
/// last so a crash leaves either the old root or a fully valid new one.
const ROOT_PAGE: u64 = 0;

/// Per-transaction buffer of not-yet-applied mutations.
struct TxBuffer {
    id: TxId,

    /// Latest page image per offset, in first-touch order
    dirty: Vec<(u64, Vec<u8>)>,

    /// Tombstoned page offsets
    tombstones: Vec<u64>,
}

impl TxBuffer {
    fn new(id: TxId) -> Self {
        Self {
            id,
            dirty: Vec::new(),
            tombstones: Vec::new(),
        }
    }

    fn dirty_image(&self, page: u64) -> Option<&[u8]> {
        self.dirty
            .iter()
            .rev()
            .find(|(idx, _)| *idx == page)
            .map(|(_, image)| image.as_slice())
    }

    fn upsert_dirty(&mut self, page: u64, image: Vec<u8>) {
        if let Some(entry) = self.dirty.iter_mut().find(|(idx, _)| *idx == page) {
            entry.1 = image;
        } else {
            self.dirty.push((page, image));
        }
    }
}

/// A [`BlockStorage`] wrapped by the write-ahead log.
///
/// Outside a transaction, calls pass through. Within one, in-place writes
/// and deletes are buffered (read-your-own-writes) and logged; appends are
/// materialized in origin eagerly since a rollback will not reuse them.
pub struct WalStorage {
    origin: BlockStorage,
    wal: Arc<Wal>,
    file_id: u32,
    tx: Mutex<Option<TxBuffer>>,
    invalidate: Mutex<Option<InvalidateFn>>,
}

impl WalStorage {
    pub(crate) fn new(origin: BlockStorage, wal: Arc<Wal>, file_id: u32) -> Self {
        Self {
            origin,
            wal,
            file_id,
            tx: Mutex::new(None),
            invalidate: Mutex::new(None),
        }
    }

    /// The id resolving this storage during recovery.
    #[must_use]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// The wrapped origin storage.
    #[must_use]
    pub fn origin(&self) -> &BlockStorage {
        &self.origin
    }

    #[allow(clippy::expect_used)]
    fn tx_lock(&self) -> MutexGuard<'_, Option<TxBuffer>> {
        self.tx.lock().expect("tx buffer lock poisoned")
    }

    fn fire_invalidate(&self, page: u64) {
        #[allow(clippy::expect_used)]
        let cb = self
            .invalidate
            .lock()
            .expect("invalidate lock poisoned")
            .clone();

        if let Some(cb) = cb {
            cb(page);
        }
    }

    /// The buffer for the active transaction, created on first touch.
    #[allow(clippy::expect_used)]
    fn buffer_mut<'a>(
        guard: &'a mut MutexGuard<'_, Option<TxBuffer>>,
        tx_id: TxId,
    ) -> &'a mut TxBuffer {
        let reset = match guard.as_ref() {
            Some(buffer) if buffer.id == tx_id => false,
            Some(buffer) => {
                log::warn!(
                    "discarding stale transaction buffer {} for transaction {tx_id}",
                    buffer.id
                );
                true
            }
            None => true,
        };

        if reset {
            **guard = Some(TxBuffer::new(tx_id));
        }

        guard.as_mut().expect("buffer was just ensured")
    }

    /// Applies the buffered mutations to origin: non-root pages, then
    /// non-root tombstones, then the root page last.
    pub fn commit_apply(&self, tx_id: TxId) -> crate::Result<()> {
        let buffer = {
            let mut guard = self.tx_lock();

            match guard.take() {
                None => return Ok(()),
                Some(buffer) if buffer.id == tx_id => buffer,
                Some(buffer) => {
                    let stale = buffer.id;
                    *guard = Some(buffer);
                    return Err(crate::Error::TransactionFailed(format!(
                        "buffer holds transaction {stale}, not {tx_id}"
                    )));
                }
            }
        };

        let mut touched = Vec::new();

        for (page, image) in &buffer.dirty {
            if *page != ROOT_PAGE {
                self.origin.write_at_impl(*page, image)?;
                touched.push(*page);
            }
        }

        for page in &buffer.tombstones {
            if *page != ROOT_PAGE {
                // Origin fires the invalidation callback itself
                self.origin.delete_impl(*page)?;
            }
        }

        if let Some(image) = buffer.dirty_image(ROOT_PAGE) {
            self.origin.write_extra_impl(image)?;
        }

        for page in touched {
            self.fire_invalidate(page);
        }

        Ok(())
    }

    /// Discards the buffered mutations; cached dirty reads are invalidated.
    pub fn rollback_discard(&self, tx_id: TxId) {
        let buffer = {
            let mut guard = self.tx_lock();

            match guard.take() {
                Some(buffer) if buffer.id == tx_id => buffer,
                other => {
                    *guard = other;
                    return;
                }
            }
        };

        for (page, _) in &buffer.dirty {
            if *page != ROOT_PAGE {
                self.fire_invalidate(*page);
            }
        }

        for page in &buffer.tombstones {
            if *page != ROOT_PAGE {
                self.fire_invalidate(*page);
            }
        }
    }

    /// Recovery: re-applies a committed page image.
    pub(crate) fn replay_update(&self, page: u64, payload: &[u8]) -> crate::Result<()> {
        if page == ROOT_PAGE {
            return self.origin.write_extra_impl(payload);
        }

        if self.origin.read_impl(page)?.is_none() {
            log::trace!("skipping replay of freed page {page}");
            return Ok(());
        }

        self.origin.write_at_impl(page, payload)?;
        self.fire_invalidate(page);

        Ok(())
    }

    /// Recovery: re-applies a committed tombstone.
    pub(crate) fn replay_delete(&self, page: u64) -> crate::Result<()> {
        if page == ROOT_PAGE {
            return Ok(());
        }

        if self.origin.read_impl(page)?.is_none() {
            log::trace!("skipping replay delete of freed page {page}");
            return Ok(());
        }

        self.origin.delete_impl(page)
    }

    pub(crate) fn sync_origin(&self) -> crate::Result<()> {
        self.origin.sync_impl()
    }
}

impl Storage for WalStorage {
    fn write(&self, payload: &[u8]) -> crate::Result<u64> {
        // Appends are safe to materialize eagerly: a rollback will not
        // reuse the assigned block
        let index = self.origin.write_impl(payload)?;

        if let Some(tx_id) = self.wal.active_tx() {
            self.wal
                .append(&WalRecord::write(tx_id, self.file_id, index, payload.len()))?;
        }

        Ok(index)
    }

    fn write_at(&self, index: u64, payload: &[u8]) -> crate::Result<()> {
        let Some(tx_id) = self.wal.active_tx() else {
            return self.origin.write_at_impl(index, payload);
        };

        let record = WalRecord::update(
            tx_id,
            self.file_id,
            index,
            self.wal.options().page_data.then_some(payload),
            self.wal.options().compression_threshold,
        )?;

        {
            let mut guard = self.tx_lock();
            let buffer = Self::buffer_mut(&mut guard, tx_id);
            buffer.upsert_dirty(index, payload.to_vec());
        }

        self.wal.append(&record)
    }

    fn read(&self, index: u64) -> crate::Result<Option<Vec<u8>>> {
        if let Some(tx_id) = self.wal.active_tx() {
            let guard = self.tx_lock();

            if let Some(buffer) = guard.as_ref().filter(|b| b.id == tx_id) {
                if buffer.tombstones.contains(&index) {
                    return Err(crate::Error::StorageRead(format!(
                        "page {index} is tombstoned in transaction {tx_id}"
                    )));
                }

                if let Some(image) = buffer.dirty_image(index) {
                    return Ok(Some(image.to_vec()));
                }
            }
        }

        self.origin.read_impl(index)
    }

    fn delete(&self, index: u64) -> crate::Result<()> {
        let Some(tx_id) = self.wal.active_tx() else {
            return self.origin.delete_impl(index);
        };

        {
            let mut guard = self.tx_lock();
            let buffer = Self::buffer_mut(&mut guard, tx_id);

            if !buffer.tombstones.contains(&index) {
                buffer.tombstones.push(index);
            }
        }

        self.wal
            .append(&WalRecord::delete(tx_id, self.file_id, index))
    }

    fn read_extra(&self, len: usize) -> crate::Result<Vec<u8>> {
        let mut out = self.origin.read_extra_impl(len)?;

        if let Some(tx_id) = self.wal.active_tx() {
            let guard = self.tx_lock();

            if let Some(buffer) = guard.as_ref().filter(|b| b.id == tx_id) {
                if let Some(image) = buffer.dirty_image(ROOT_PAGE) {
                    let take = image.len().min(out.len());

                    #[allow(clippy::indexing_slicing)]
                    out[..take].copy_from_slice(&image[..take]);
                }
            }
        }

        Ok(out)
    }

    fn write_extra(&self, bytes: &[u8]) -> crate::Result<()> {
        let Some(tx_id) = self.wal.active_tx() else {
            return self.origin.write_extra_impl(bytes);
        };

        let record = WalRecord::update(
            tx_id,
            self.file_id,
            ROOT_PAGE,
            self.wal.options().page_data.then_some(bytes),
            self.wal.options().compression_threshold,
        )?;

        {
            let mut guard = self.tx_lock();
            let buffer = Self::buffer_mut(&mut guard, tx_id);
            buffer.upsert_dirty(ROOT_PAGE, bytes.to_vec());
        }

        self.wal.append(&record)
    }

    fn block_payload(&self) -> u32 {
        self.origin.block_payload_impl()
    }

    fn live_count(&self) -> u64 {
        self.origin.live_count_impl()
    }

    fn bytes(&self) -> u64 {
        self.origin.bytes_impl()
    }

    fn compressed(&self) -> bool {
        self.origin.compressed_impl()
    }

    fn sync(&self) -> crate::Result<()> {
        self.origin.sync_impl()
    }

    fn set_invalidation(&self, cb: InvalidateFn) {
        self.origin.set_invalidation_impl(cb.clone());

        #[allow(clippy::expect_used)]
        let mut guard = self.invalidate.lock().expect("invalidate lock poisoned");
        *guard = Some(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{StorageOptions, WalOptions};
    use test_log::test;

    fn storage_opts() -> StorageOptions {
        StorageOptions {
            increment: 4_096,
            ..Default::default()
        }
    }

    fn wal_opts() -> WalOptions {
        WalOptions {
            checkpoint_interval: 0,
            ..Default::default()
        }
    }

    #[test]
    fn wrapped_write_is_eager() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let wal = Wal::open(&dir.path().join("t.wal"), wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&dir.path().join("t"), &storage_opts())?);

        let tx = wal.begin()?;
        let idx = storage.write(b"eager")?;

        // Already visible in origin, before commit
        assert_eq!(Some(b"eager".to_vec()), storage.origin().read_impl(idx)?);

        wal.commit(tx)?;

        Ok(())
    }

    #[test]
    fn wrapped_update_is_buffered_until_commit() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let wal = Wal::open(&dir.path().join("t.wal"), wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&dir.path().join("t"), &storage_opts())?);

        let idx = storage.write(b"before")?;

        let tx = wal.begin()?;
        storage.write_at(idx, b"after")?;

        // Read-your-own-writes within the transaction
        assert_eq!(Some(b"after".to_vec()), storage.read(idx)?);

        // Origin still unchanged
        assert_eq!(Some(b"before".to_vec()), storage.origin().read_impl(idx)?);

        storage.commit_apply(tx)?;
        wal.commit(tx)?;

        assert_eq!(Some(b"after".to_vec()), storage.origin().read_impl(idx)?);

        Ok(())
    }

    #[test]
    fn wrapped_rollback_discards_buffer() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let wal = Wal::open(&dir.path().join("t.wal"), wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&dir.path().join("t"), &storage_opts())?);

        let idx = storage.write(b"kept")?;

        let tx = wal.begin()?;
        storage.write_at(idx, b"dropped")?;
        storage.rollback_discard(tx);
        wal.rollback(tx)?;

        assert_eq!(Some(b"kept".to_vec()), storage.read(idx)?);

        Ok(())
    }

    #[test]
    fn wrapped_tombstone_read_fails() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let wal = Wal::open(&dir.path().join("t.wal"), wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&dir.path().join("t"), &storage_opts())?);

        let idx = storage.write(b"doomed")?;

        let tx = wal.begin()?;
        storage.delete(idx)?;

        let err = storage.read(idx).unwrap_err();
        assert!(matches!(err, crate::Error::StorageRead(_)));

        // Origin still live until commit
        assert_eq!(Some(b"doomed".to_vec()), storage.origin().read_impl(idx)?);

        storage.commit_apply(tx)?;
        wal.commit(tx)?;

        assert_eq!(None, storage.read(idx)?);

        Ok(())
    }

    #[test]
    fn wrapped_root_page_applies_last() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let wal = Wal::open(&dir.path().join("t.wal"), wal_opts())?;
        let storage = wal.wrap(BlockStorage::create(&dir.path().join("t"), &storage_opts())?);

        let idx = storage.write(b"node")?;

        let tx = wal.begin()?;
        storage.write_extra(b"ROOTSLOT")?;
        storage.write_at(idx, b"node v2")?;

        // Overlay visible in-transaction
        assert_eq!(b"ROOTSLOT".to_vec(), storage.read_extra(8)?);

        // Origin extra header untouched until commit
        assert_eq!(vec![0u8; 8], storage.origin().read_extra_impl(8)?);

        storage.commit_apply(tx)?;
        wal.commit(tx)?;

        assert_eq!(b"ROOTSLOT".to_vec(), storage.origin().read_extra_impl(8)?);

        Ok(())
    }
}
