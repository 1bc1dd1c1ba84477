// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod header;
pub mod record;
pub mod storage;

pub use header::{WalHeader, WAL_HEADER_BYTES};
pub use record::{WalOp, WalRecord};
pub use storage::WalStorage;

use crate::{
    coding::{Decode, Encode},
    meta::{WalMode, WalOptions},
    storage::BlockStorage,
};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

/// Staging buffer capacity; a full buffer always flushes.
const STAGE_CAPACITY: usize = 4 * 1_024 * 1_024;

/// Monotonic transaction id issued by [`Wal::begin`].
pub type TxId = u64;

/// Append-only log of operations on the wrapped block storages.
///
/// Records are staged in memory and flushed in batches; a commit flushes,
/// rewrites the header and syncs the channel, making the transaction
/// durable. On open, [`Wal::recover`] replays committed transactions
/// against the wrapped storages and discards the rest.
pub struct Wal {
    inner: Mutex<WalInner>,
    opts: WalOptions,
    next_file_id: AtomicU32,
    path: PathBuf,
}

struct WalInner {
    file: File,
    header: WalHeader,
    head: u64,
    stage: Vec<u8>,
    staged_records: u32,
    active_tx: Option<TxId>,
    committed_since_checkpoint: u32,
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

impl Wal {
    /// Opens (or creates) the log file at the given path.
    pub fn open(path: &Path, opts: WalOptions) -> crate::Result<Arc<Self>> {
        let fresh = !path.exists();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let header = if fresh || file.metadata()?.len() < WAL_HEADER_BYTES {
            let header = WalHeader::fresh(now_ms());

            file.set_len(WAL_HEADER_BYTES)?;
            (&file).seek(SeekFrom::Start(0))?;
            (&file).write_all(&header.encode_into_vec())?;
            file.sync_all()?;

            header
        } else {
            let mut buf = vec![0u8; WalHeader::fresh(0).encode_into_vec().len()];
            (&file).seek(SeekFrom::Start(0))?;
            (&file).read_exact(&mut buf)?;

            WalHeader::decode_from(&mut Cursor::new(buf))?
        };

        let file_len = file.metadata()?.len();
        let head = header
            .committed_offset
            .min(file_len)
            .max(WAL_HEADER_BYTES);

        log::debug!(
            "opened log {path:?}, head {head}, checkpoint {}, last tx {}",
            header.checkpoint_offset,
            header.last_tx_id,
        );

        Ok(Arc::new(Self {
            inner: Mutex::new(WalInner {
                file,
                header,
                head,
                stage: Vec::with_capacity(STAGE_CAPACITY),
                staged_records: 0,
                active_tx: None,
                committed_since_checkpoint: 0,
            }),
            opts,
            next_file_id: AtomicU32::new(0),
            path: path.into(),
        }))
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wraps a storage; mutations through the wrapper are logged and
    /// buffered per transaction.
    #[must_use]
    pub fn wrap(self: &Arc<Self>, origin: BlockStorage) -> WalStorage {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        WalStorage::new(origin, self.clone(), file_id)
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, WalInner> {
        self.inner.lock().expect("wal lock poisoned")
    }

    /// Starts a transaction; there can only be one at a time (the owning
    /// table's writer latch guarantees this).
    pub fn begin(&self) -> crate::Result<TxId> {
        let mut inner = self.lock();

        if let Some(active) = inner.active_tx {
            return Err(crate::Error::TransactionFailed(format!(
                "transaction {active} is still active"
            )));
        }

        inner.header.last_tx_id += 1;
        let id = inner.header.last_tx_id;
        inner.active_tx = Some(id);

        Ok(id)
    }

    /// The currently active transaction, if any.
    #[must_use]
    pub fn active_tx(&self) -> Option<TxId> {
        self.lock().active_tx
    }

    /// Appends a record, via the staging buffer or directly for oversized
    /// records.
    pub(crate) fn append(&self, record: &WalRecord) -> crate::Result<()> {
        let mut inner = self.lock();
        self.append_locked(&mut inner, record)
    }

    fn append_locked(&self, inner: &mut WalInner, record: &WalRecord) -> crate::Result<()> {
        let bytes = record.encode_into_vec();

        let direct = self.opts.direct_write_threshold > 0
            && bytes.len() >= self.opts.direct_write_threshold as usize;

        if direct {
            // The stage is flushed first, preserving append order
            self.flush_stage_locked(inner)?;

            (&inner.file).seek(SeekFrom::Start(inner.head))?;
            (&inner.file).write_all(&bytes)?;
            inner.head += bytes.len() as u64;
        } else {
            inner.stage.extend_from_slice(&bytes);
            inner.staged_records += 1;

            if inner.stage.len() >= STAGE_CAPACITY || inner.staged_records >= self.opts.batch_size
            {
                self.flush_stage_locked(inner)?;
            }
        }

        inner.header.total_count += 1;

        Ok(())
    }

    fn flush_stage_locked(&self, inner: &mut WalInner) -> crate::Result<()> {
        if inner.stage.is_empty() {
            return Ok(());
        }

        (&inner.file).seek(SeekFrom::Start(inner.head))?;
        (&inner.file).write_all(&inner.stage)?;

        inner.head += inner.stage.len() as u64;
        inner.stage.clear();
        inner.staged_records = 0;

        Ok(())
    }

    fn write_header_locked(inner: &mut WalInner) -> crate::Result<()> {
        let bytes = inner.header.encode_into_vec();
        (&inner.file).seek(SeekFrom::Start(0))?;
        (&inner.file).write_all(&bytes)?;

        Ok(())
    }

    /// Logs COMMIT, flushes and syncs; the transaction is durable once this
    /// returns.
    ///
    /// The wrapped storages must have applied their buffers (root last)
    /// before this is called.
    pub fn commit(&self, tx_id: TxId) -> crate::Result<()> {
        let mut inner = self.lock();

        if inner.active_tx != Some(tx_id) {
            return Err(crate::Error::TransactionNotStarted);
        }

        self.append_locked(&mut inner, &WalRecord::commit(tx_id))?;
        self.flush_stage_locked(&mut inner)?;

        inner.header.committed_offset = inner.head;
        Self::write_header_locked(&mut inner)?;
        inner.file.sync_all()?;

        inner.active_tx = None;
        inner.committed_since_checkpoint += 1;

        if self.opts.checkpoint_interval > 0
            && inner.committed_since_checkpoint >= self.opts.checkpoint_interval
        {
            log::debug!(
                "auto-checkpoint after {} commits",
                inner.committed_since_checkpoint
            );
            self.checkpoint_locked(&mut inner)?;
        }

        Ok(())
    }

    /// Logs ROLLBACK and drops the transaction.
    ///
    /// The wrapped storages must have discarded their buffers already.
    pub fn rollback(&self, tx_id: TxId) -> crate::Result<()> {
        let mut inner = self.lock();

        if inner.active_tx != Some(tx_id) {
            return Err(crate::Error::TransactionNotStarted);
        }

        self.append_locked(&mut inner, &WalRecord::rollback(tx_id))?;
        self.flush_stage_locked(&mut inner)?;

        inner.active_tx = None;

        Ok(())
    }

    /// Appends a CHECKPOINT marker; in TRUNCATE mode the log shrinks back
    /// to its header.
    pub fn checkpoint(&self) -> crate::Result<()> {
        let mut inner = self.lock();
        self.checkpoint_locked(&mut inner)
    }

    fn checkpoint_locked(&self, inner: &mut WalInner) -> crate::Result<()> {
        self.flush_stage_locked(inner)?;

        let bytes = WalRecord::checkpoint().encode_into_vec();
        (&inner.file).seek(SeekFrom::Start(inner.head))?;
        (&inner.file).write_all(&bytes)?;
        inner.head += bytes.len() as u64;

        inner.header.checkpoint_offset = inner.head;
        inner.header.committed_offset = inner.head;

        if self.opts.mode == WalMode::Truncate && inner.header.checkpoint_offset == inner.head {
            inner.file.set_len(WAL_HEADER_BYTES)?;
            inner.head = WAL_HEADER_BYTES;
            inner.header.checkpoint_offset = WAL_HEADER_BYTES;
            inner.header.committed_offset = WAL_HEADER_BYTES;
            inner.header.total_count = 0;
            inner.header.processed_count = 0;

            log::trace!("truncated log back to header");
        }

        Self::write_header_locked(inner)?;
        inner.file.sync_all()?;

        inner.committed_since_checkpoint = 0;

        Ok(())
    }

    /// Replays committed transactions against the wrapped storages.
    ///
    /// Scans `[max(header, checkpoint), committed]`; a corrupt tail stops
    /// the scan cleanly. Returns the number of transactions replayed.
    pub fn recover(&self, storages: &[&WalStorage]) -> crate::Result<u64> {
        let mut inner = self.lock();

        let file_len = inner.file.metadata()?.len();
        let start = inner.header.checkpoint_offset.max(WAL_HEADER_BYTES);
        let end = inner.header.committed_offset.min(file_len);

        if end <= start {
            log::trace!("log is clean, nothing to replay");
            return Ok(0);
        }

        let mut region = vec![0u8; (end - start) as usize];
        (&inner.file).seek(SeekFrom::Start(start))?;
        (&inner.file).read_exact(&mut region)?;

        let mut committed: BTreeMap<TxId, bool> = BTreeMap::new();
        let mut pending: BTreeMap<TxId, Vec<WalRecord>> = BTreeMap::new();

        let mut cursor = Cursor::new(&region[..]);

        while (cursor.position() as usize) < region.len() {
            match WalRecord::decode_from(&mut cursor) {
                Ok(record) => match record.op {
                    WalOp::Checkpoint => {
                        committed.clear();
                        pending.clear();
                    }
                    WalOp::Commit => {
                        committed.insert(record.tx_id, true);
                    }
                    WalOp::Rollback => {
                        committed.insert(record.tx_id, false);
                    }
                    WalOp::Begin => {}
                    WalOp::Write | WalOp::Update | WalOp::Delete => {
                        pending.entry(record.tx_id).or_default().push(record);
                    }
                },
                Err(e) => {
                    log::warn!("stopping log scan at corrupt tail: {e:?}");
                    break;
                }
            }
        }

        let mut replayed_txs = 0u64;
        let mut replayed_records = 0u64;

        for (tx_id, records) in pending {
            if committed.get(&tx_id).copied() != Some(true) {
                log::trace!("dropping unfinished transaction {tx_id}");
                continue;
            }

            for record in records {
                let Some(target) = storages.iter().find(|s| s.file_id() == record.file_id)
                else {
                    log::warn!("log record for unknown file id {}", record.file_id);
                    continue;
                };

                match record.op {
                    WalOp::Update => {
                        if let Some(payload) = record.payload_decompressed()? {
                            target.replay_update(record.page, &payload)?;
                            replayed_records += 1;
                        }
                    }
                    WalOp::Delete => {
                        target.replay_delete(record.page)?;
                        replayed_records += 1;
                    }
                    // Appends are already materialized in origin
                    _ => {}
                }
            }

            replayed_txs += 1;
        }

        inner.header.processed_count = replayed_records;

        if replayed_txs > 0 {
            log::debug!("replayed {replayed_txs} transactions ({replayed_records} records)");

            // The replayed state must be durable before the log may shrink
            for storage in storages {
                storage.sync_origin()?;
            }

            self.checkpoint_locked(&mut inner)?;
        }

        Ok(replayed_txs)
    }

    /// Flushes staged records and syncs the channel.
    pub fn sync(&self) -> crate::Result<()> {
        let mut inner = self.lock();

        self.flush_stage_locked(&mut inner)?;
        Self::write_header_locked(&mut inner)?;
        inner.file.sync_all()?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn staged_len(&self) -> usize {
        self.lock().stage.len()
    }

    #[cfg(test)]
    pub(crate) fn head(&self) -> u64 {
        self.lock().head
    }

    pub(crate) fn options(&self) -> &WalOptions {
        &self.opts
    }
}
