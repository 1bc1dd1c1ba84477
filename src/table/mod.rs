// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod cache;
pub mod predicate;

pub use predicate::{CmpOp, Condition, Predicate};

use crate::{
    bptree::{Direction, MatchAll, TreeCursor},
    latch::Latch,
    meta::{BlockType, Meta, StorageOptions, WalMode},
    row::{Row, RowId},
    sorter::{RowSource, Sorter},
    storage::{AnyStorage, BlockStorage, Storage},
    table::{cache::RowCache, predicate::CompiledPredicate},
    wal::{TxId, Wal, WalStorage},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

const SIGNATURE: [u8; 4] = *b"FLNT";
const SIGNATURE_VERSION: u16 = 1;
const SIGNATURE_BYTES: usize = 6;

/// Table open mode
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Mutations allowed; the WAL is opened when enabled
    ReadWrite,

    /// Reads only; no WAL, mutating calls fail
    ReadOnly,
}

/// Resolves row ids through the row cache, falling back to the heap.
pub(crate) struct HeapSource {
    heap: Arc<AnyStorage>,
    pub(crate) cache: Arc<RowCache>,
    meta: Meta,
}

impl RowSource for HeapSource {
    fn row(&self, id: RowId) -> crate::Result<Row> {
        if let Some(row) = self.cache.get(id) {
            return Ok(row);
        }

        let Some(image) = self.heap.read(id)? else {
            return Err(crate::Error::NotFound);
        };

        let row = Row::decode(&self.meta, &image, id)?;
        self.cache.insert(id, row.clone());

        Ok(row)
    }
}

/// The public surface for row operations: a row heap bound to one sorter
/// per index, wrapped by an optional write-ahead log.
///
/// Every mutating call runs under the writer latch and inside one WAL
/// transaction; a crash at any step is reconciled by replay on next open.
pub struct Table {
    meta: Meta,
    path: PathBuf,
    heap: Arc<AnyStorage>,
    wal: Option<Arc<Wal>>,
    sorters: Vec<Sorter>,
    source: Arc<HeapSource>,
    latch: Latch,
    read_only: bool,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

fn index_path(table_path: &Path, index_name: &str) -> PathBuf {
    let mut name = table_path.as_os_str().to_os_string();
    name.push(".i.");
    name.push(index_name);
    PathBuf::from(name)
}

fn wal_path(table_path: &Path) -> PathBuf {
    let mut name = table_path.as_os_str().to_os_string();
    name.push(".wal");
    PathBuf::from(name)
}

fn tree_storage_options(meta: &Meta) -> StorageOptions {
    StorageOptions {
        // Trees never live on compressed storage
        block_type: if meta.storage.block_type == BlockType::Memory {
            BlockType::Memory
        } else {
            BlockType::Mmap
        },
        ..meta.storage
    }
}

impl Table {
    /// Creates the table's files (descriptor, heap, one tree per index) and
    /// opens it.
    pub fn create(path: &Path, meta: Meta) -> crate::Result<Table> {
        meta.validate()?;

        if Meta::descriptor_path(path).exists() {
            return Err(crate::Error::InvalidOperation(format!(
                "table {:?} already exists",
                meta.name
            )));
        }

        log::debug!("creating table {:?} at {path:?}", meta.name);

        if meta.storage.block_type != BlockType::Memory {
            let heap = BlockStorage::create(path, &meta.storage)?;
            heap.write_extra_impl(&signature_bytes())?;
            heap.sync_impl()?;

            let tree_opts = tree_storage_options(&meta);

            for index in &meta.indexes {
                let storage = BlockStorage::create(&index_path(path, &index.name), &tree_opts)?;
                storage.sync_impl()?;
            }
        }

        meta.write_to(path)?;

        Self::open(path, OpenMode::ReadWrite)
    }

    /// Opens an existing table; WAL recovery runs before the table is
    /// returned.
    pub fn open(path: &Path, mode: OpenMode) -> crate::Result<Table> {
        let meta = Meta::read_from(path)?;
        let read_only = mode == OpenMode::ReadOnly;
        let in_memory = meta.storage.block_type == BlockType::Memory;

        log::debug!("opening table {:?} at {path:?} ({mode:?})", meta.name);

        let wal = if meta.wal.enabled && !read_only && !in_memory {
            Some(Wal::open(&wal_path(path), meta.wal)?)
        } else {
            None
        };

        let heap_block = if in_memory {
            BlockStorage::memory(&meta.storage)?
        } else {
            BlockStorage::open(path, &meta.storage, read_only)?
        };

        let heap = Arc::new(match &wal {
            Some(wal) => AnyStorage::Wal(wal.wrap(heap_block)),
            None => AnyStorage::Block(heap_block),
        });

        check_signature(&heap, in_memory)?;

        let cache = RowCache::with_capacity_bytes(meta.storage.cache_size);

        let source = Arc::new(HeapSource {
            heap: heap.clone(),
            cache: cache.clone(),
            meta: meta.clone(),
        });

        {
            let cache = cache.clone();
            heap.set_invalidation(Arc::new(move |id| cache.remove(id)));
        }

        let tree_opts = tree_storage_options(&meta);
        let mut sorters = Vec::with_capacity(meta.indexes.len());

        for index in &meta.indexes {
            let storage = if in_memory {
                BlockStorage::memory(&tree_opts)?
            } else {
                let tree_path = index_path(path, &index.name);

                if tree_path.exists() {
                    BlockStorage::open(&tree_path, &tree_opts, read_only)?
                } else if heap.live_count() == 0 && !read_only {
                    BlockStorage::create(&tree_path, &tree_opts)?
                } else {
                    return Err(crate::Error::IndexNotFound(index.name.clone()));
                }
            };

            let storage = Arc::new(match &wal {
                Some(wal) => AnyStorage::Wal(wal.wrap(storage)),
                None => AnyStorage::Block(storage),
            });

            sorters.push(Sorter::open(
                &meta,
                index,
                source.clone() as Arc<dyn RowSource>,
                storage,
            )?);
        }

        let table = Table {
            meta,
            path: path.into(),
            heap,
            wal,
            sorters,
            source,
            latch: Latch::default(),
            read_only,
        };

        if let Some(wal) = &table.wal {
            let wrapped = table.wal_storages();
            let replayed = wal.recover(&wrapped)?;

            if replayed > 0 {
                log::debug!(
                    "recovered {replayed} transactions for table {:?}",
                    table.name()
                );
            }
        }

        Ok(table)
    }

    /// The table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// The schema descriptor.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The heap file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of live rows.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.heap.live_count()
    }

    /// The sorters, primary first.
    #[doc(hidden)]
    #[must_use]
    pub fn sorters(&self) -> &[Sorter] {
        &self.sorters
    }

    fn wal_storages(&self) -> Vec<&WalStorage> {
        let mut wrapped = Vec::with_capacity(1 + self.sorters.len());

        if let AnyStorage::Wal(ws) = &*self.heap {
            wrapped.push(ws);
        }

        for sorter in &self.sorters {
            if let AnyStorage::Wal(ws) = &**sorter.storage() {
                wrapped.push(ws);
            }
        }

        wrapped
    }

    fn guard_writable(&self) -> crate::Result<()> {
        if self.read_only {
            return Err(crate::Error::InvalidOperation(
                "table is open read-only".into(),
            ));
        }

        Ok(())
    }

    fn begin_tx(&self) -> crate::Result<Option<TxId>> {
        match &self.wal {
            Some(wal) => Ok(Some(wal.begin()?)),
            None => Ok(None),
        }
    }

    fn commit_tx(&self, tx: Option<TxId>) -> crate::Result<()> {
        let Some(tx) = tx else {
            return Ok(());
        };

        let Some(wal) = &self.wal else {
            return Err(crate::Error::TransactionNotStarted);
        };

        for storage in self.wal_storages() {
            if let Err(e) = storage.commit_apply(tx) {
                self.rollback_tx(Some(tx));
                return Err(crate::Error::TransactionFailed(format!(
                    "commit of transaction {tx} failed: {e}"
                )));
            }
        }

        wal.commit(tx)
    }

    fn rollback_tx(&self, tx: Option<TxId>) {
        let Some(tx) = tx else {
            return;
        };

        for storage in self.wal_storages() {
            storage.rollback_discard(tx);
        }

        if let Some(wal) = &self.wal {
            if let Err(e) = wal.rollback(tx) {
                log::warn!("rollback of transaction {tx} failed: {e}");
            }
        }
    }

    /// Inserts a row, or overwrites the row with an equal primary key when
    /// `upsert` is set. Returns the row id.
    pub fn apply(&self, row: &Row, upsert: bool) -> crate::Result<RowId> {
        self.guard_writable()?;

        let image = row.encode(&self.meta)?;

        let _guard = self.latch.lock()?;
        let tx = self.begin_tx()?;

        match self.apply_inner(row, &image, upsert) {
            Ok(id) => {
                self.commit_tx(tx)?;
                Ok(id)
            }
            Err(e) => {
                self.rollback_tx(tx);
                Err(e)
            }
        }
    }

    fn apply_inner(&self, row: &Row, image: &[u8], upsert: bool) -> crate::Result<RowId> {
        let Some(primary) = self.sorters.first() else {
            return Err(crate::Error::Internal("table without a primary".into()));
        };

        let Some(existing) = primary.find_row(row)? else {
            let id = self.heap.write(image)?;

            for sorter in &self.sorters {
                sorter.create(id)?;
            }

            return Ok(id);
        };

        if !upsert {
            return Err(crate::Error::DuplicateKey(Box::new(row.clone())));
        }

        // Same key tuple: rewrite in place, re-sort the non-primary indexes
        for sorter in self.sorters.iter().skip(1) {
            sorter.delete(existing)?;
        }

        self.heap.write_at(existing, image)?;
        self.source.cache.remove(existing);

        for sorter in self.sorters.iter().skip(1) {
            sorter.create(existing)?;
        }

        Ok(existing)
    }

    /// Rewrites the row at a known row id.
    ///
    /// The primary key columns must be unchanged; a key-changing update is
    /// rejected rather than letting the heap drift from the primary sorter.
    pub fn update(&self, id: RowId, row: &Row) -> crate::Result<RowId> {
        self.guard_writable()?;

        let image = row.encode(&self.meta)?;

        let _guard = self.latch.lock()?;

        let old = self.source.row(id)?;

        let Some(primary) = self.sorters.first() else {
            return Err(crate::Error::Internal("table without a primary".into()));
        };

        for &position in primary.key_positions() {
            let (Some(old_value), Some(new_value)) = (old.get(position), row.get(position)) else {
                return Err(crate::Error::ColumnMismatch {
                    expected: self.meta.columns.len(),
                    got: row.values().len(),
                });
            };

            if old_value.compare(new_value)? != std::cmp::Ordering::Equal {
                return Err(crate::Error::InvalidOperation(
                    "UPDATE must not change primary key columns".into(),
                ));
            }
        }

        let tx = self.begin_tx()?;

        let result = (|| {
            for sorter in self.sorters.iter().skip(1) {
                sorter.delete(id)?;
            }

            self.heap.write_at(id, &image)?;
            self.source.cache.remove(id);

            for sorter in self.sorters.iter().skip(1) {
                sorter.create(id)?;
            }

            Ok(id)
        })();

        match result {
            Ok(id) => {
                self.commit_tx(tx)?;
                Ok(id)
            }
            Err(e) => {
                self.rollback_tx(tx);
                Err(e)
            }
        }
    }

    /// Deletes the row at a row id; 1 on success, -1 if the id is unknown.
    pub fn delete(&self, id: RowId) -> crate::Result<i64> {
        self.guard_writable()?;

        let _guard = self.latch.lock()?;

        match self.source.row(id) {
            Ok(_) => {}
            Err(crate::Error::NotFound) => return Ok(-1),
            Err(e) => return Err(e),
        }

        let tx = self.begin_tx()?;

        let result = (|| {
            // Non-primary sorters first, the primary last
            for sorter in self.sorters.iter().rev() {
                sorter.delete(id)?;
            }

            self.heap.delete(id)?;
            self.source.cache.remove(id);

            Ok(())
        })();

        match result {
            Ok(()) => {
                self.commit_tx(tx)?;
                Ok(1)
            }
            Err(e) => {
                self.rollback_tx(tx);
                Err(e)
            }
        }
    }

    /// Reads the row at a row id; `None` if the id is freed.
    pub fn read(&self, id: RowId) -> crate::Result<Option<Row>> {
        match self.source.row(id) {
            Ok(row) => Ok(Some(row)),
            Err(crate::Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Compiles a predicate string and returns a lazy cursor of row ids.
    ///
    /// The index comes from the `USE INDEX` hint, defaulting to the
    /// primary; `LIMIT`/`OFFSET` are honored after the residual filter.
    pub fn find(&self, predicate: &str, direction: Direction) -> crate::Result<RowCursor<'_>> {
        let parsed = Predicate::parse(predicate)?;

        let sorter = match &parsed.use_index {
            Some(name) => {
                let (position, _) = self
                    .meta
                    .index_by_name(name)
                    .ok_or_else(|| crate::Error::IndexNotFound(name.clone()))?;

                self.sorters
                    .get(position)
                    .ok_or_else(|| crate::Error::IndexNotFound(name.clone()))?
            }
            None => self
                .sorters
                .first()
                .ok_or_else(|| crate::Error::Internal("table without a primary".into()))?,
        };

        let (_, index) = self
            .meta
            .index_by_name(sorter.name())
            .ok_or_else(|| crate::Error::IndexNotFound(sorter.name().into()))?;

        let compiled = CompiledPredicate::compile(&parsed, &self.meta, index)?;
        let filter = compiled.descent_filter(self.source.clone() as Arc<dyn RowSource>);

        let inner = sorter.cursor(direction, Box::new(filter))?;

        Ok(RowCursor {
            inner,
            source: self.source.clone(),
            compiled,
            limit: parsed.limit,
            offset: parsed.offset,
            yielded: 0,
            skipped: 0,
        })
    }

    /// Full scan in primary order; the visitor returns false to stop.
    ///
    /// Returns the number of rows visited.
    pub fn traverse<F>(&self, mut visit: F) -> crate::Result<u64>
    where
        F: FnMut(RowId, &Row) -> bool,
    {
        let Some(primary) = self.sorters.first() else {
            return Ok(0);
        };

        let mut cursor = primary.cursor(Direction::Ascending, Box::new(MatchAll))?;
        let mut visited = 0;

        while let Some(key) = cursor.next()? {
            #[allow(clippy::cast_sign_loss)]
            let id = key as u64;
            let row = self.source.row(id)?;

            visited += 1;

            if !visit(id, &row) {
                break;
            }
        }

        cursor.close();

        Ok(visited)
    }

    /// Inserts many rows, committing every `bulk_insert.commit.interval`
    /// rows.
    ///
    /// Chunks committed before an error stay applied; the failing chunk
    /// rolls back.
    pub fn bulk_apply(&self, rows: &[Row], upsert: bool) -> crate::Result<Vec<RowId>> {
        self.guard_writable()?;

        let interval = self.meta.bulk_commit_interval.max(1) as usize;

        let _guard = self.latch.lock()?;

        let mut ids = Vec::with_capacity(rows.len());
        let mut tx = self.begin_tx()?;
        let mut in_flight = 0usize;

        for row in rows {
            let image = match row.encode(&self.meta) {
                Ok(image) => image,
                Err(e) => {
                    self.rollback_tx(tx);
                    return Err(e);
                }
            };

            match self.apply_inner(row, &image, upsert) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    self.rollback_tx(tx);
                    return Err(e);
                }
            }

            in_flight += 1;

            if in_flight >= interval {
                self.commit_tx(tx)?;
                tx = self.begin_tx()?;
                in_flight = 0;

                log::trace!("bulk load committed {} rows so far", ids.len());
            }
        }

        self.commit_tx(tx)?;

        Ok(ids)
    }

    /// Offline consistency check: sorter/heap agreement, tree invariants,
    /// free-list sanity.
    pub fn verify(&self) -> crate::Result<()> {
        let live = self.heap.live_count();

        for sorter in &self.sorters {
            sorter.check_invariants()?;

            let count = sorter.count()?;

            if count != live {
                return Err(crate::Error::Internal(format!(
                    "index {:?} holds {count} keys for {live} live rows",
                    sorter.name()
                )));
            }
        }

        // Every key must resolve to a live, decodable row of schema arity
        self.traverse(|_, row| row.values().len() == self.meta.columns.len())?;

        // Free-list blocks must all read as freed
        let origin = match &*self.heap {
            AnyStorage::Block(block) => block,
            AnyStorage::Wal(wal) => wal.origin(),
        };

        for offset in origin.free_list()? {
            if origin.read_impl(offset)?.is_some() {
                return Err(crate::Error::Internal(format!(
                    "free-list block {offset} is live"
                )));
            }
        }

        Ok(())
    }

    /// Flushes sorters and the heap; in TRUNCATE mode the WAL is
    /// checkpointed and shrinks back to its header.
    pub fn close(&self) -> crate::Result<()> {
        log::debug!("closing table {:?}", self.name());

        for sorter in &self.sorters {
            sorter.sync()?;
        }

        if let Some(wal) = &self.wal {
            if self.meta.wal.mode == WalMode::Truncate {
                wal.checkpoint()?;
            }
            wal.sync()?;
        }

        self.heap.sync()?;

        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.read_only {
            return;
        }

        if let Err(e) = self.close() {
            log::warn!("closing table {:?} failed: {e}", self.name());
        }
    }
}

fn signature_bytes() -> [u8; SIGNATURE_BYTES] {
    let mut bytes = [0u8; SIGNATURE_BYTES];
    bytes[..4].copy_from_slice(&SIGNATURE);
    bytes[4..].copy_from_slice(&SIGNATURE_VERSION.to_le_bytes());
    bytes
}

fn check_signature(heap: &AnyStorage, in_memory: bool) -> crate::Result<()> {
    let found = heap.read_extra(SIGNATURE_BYTES)?;

    if found.iter().all(|b| *b == 0) {
        // Memory tables start fresh on every open
        if in_memory {
            heap.write_extra(&signature_bytes())?;
            return Ok(());
        }

        return Err(crate::Error::InvalidVersion(0));
    }

    if found.get(..4) != Some(&SIGNATURE[..]) {
        return Err(crate::Error::InvalidOperation(
            "file is not a row heap".into(),
        ));
    }

    let mut version = [0u8; 2];
    version.copy_from_slice(found.get(4..6).unwrap_or(&[0; 2]));
    let version = u16::from_le_bytes(version);

    if version != SIGNATURE_VERSION {
        return Err(crate::Error::InvalidVersion(version));
    }

    Ok(())
}

/// Lazy cursor of row ids matching a compiled predicate.
pub struct RowCursor<'a> {
    inner: TreeCursor<'a>,
    source: Arc<HeapSource>,
    compiled: CompiledPredicate,
    limit: Option<u64>,
    offset: u64,
    yielded: u64,
    skipped: u64,
}

impl std::fmt::Debug for RowCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor").finish_non_exhaustive()
    }
}

impl RowCursor<'_> {
    /// The next matching row id.
    pub fn next(&mut self) -> crate::Result<Option<RowId>> {
        if self.limit.is_some_and(|limit| self.yielded >= limit) {
            return Ok(None);
        }

        while let Some(key) = self.inner.next()? {
            #[allow(clippy::cast_sign_loss)]
            let id = key as u64;
            let row = self.source.row(id)?;

            if !self.compiled.matches(&row)? {
                continue;
            }

            if self.skipped < self.offset {
                self.skipped += 1;
                continue;
            }

            self.yielded += 1;
            return Ok(Some(id));
        }

        Ok(None)
    }

    /// Reads the rows for the remaining matches.
    pub fn collect_rows(&mut self) -> crate::Result<Vec<Row>> {
        let mut rows = Vec::new();

        while let Some(id) = self.next()? {
            rows.push(self.source.row(id)?);
        }

        Ok(rows)
    }

    /// Releases the underlying tree cursor.
    pub fn close(&mut self) {
        self.inner.close();
    }
}
