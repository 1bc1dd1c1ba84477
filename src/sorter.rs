// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    bptree::{BPlusTree, Direction, KeyCompare, KeyFilter, TreeCursor},
    meta::{IndexDef, IndexKind, Meta},
    row::{Row, RowId},
    storage::{AnyStorage, Storage},
};
use std::{cmp::Ordering, sync::Arc};

/// Resolves a row id back to its row image, via the owning table's cache.
pub trait RowSource: Send + Sync {
    /// The row stored under the given id.
    fn row(&self, id: RowId) -> crate::Result<Row>;
}

/// Row-derived key order for a sorter's tree.
///
/// Keys are row ids; comparing two keys loads both rows and compares their
/// key column tuples. Non-primary orders break ties by row id, so equal
/// tuples stay distinct.
struct RowKeyOrder {
    source: Arc<dyn RowSource>,
    key_positions: Vec<usize>,
    with_row_id: bool,
}

impl KeyCompare for RowKeyOrder {
    fn cmp(&self, a: i64, b: i64) -> crate::Result<Ordering> {
        if a == b {
            return Ok(Ordering::Equal);
        }

        #[allow(clippy::cast_sign_loss)]
        let row_a = self.source.row(a as u64)?;
        #[allow(clippy::cast_sign_loss)]
        let row_b = self.source.row(b as u64)?;

        for &position in &self.key_positions {
            let (Some(va), Some(vb)) = (row_a.get(position), row_b.get(position)) else {
                return Err(crate::Error::Internal(format!(
                    "row misses key column {position}"
                )));
            };

            let ordering = va.compare(vb)?;

            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }

        if self.with_row_id {
            Ok(a.cmp(&b))
        } else {
            Ok(Ordering::Equal)
        }
    }
}

/// Filter matching rows whose key tuple equals a probe row's.
struct RowTupleFilter<'a> {
    source: Arc<dyn RowSource>,
    key_positions: &'a [usize],
    probe: &'a Row,
}

impl KeyFilter for RowTupleFilter<'_> {
    fn cmp(&self, key: i64) -> crate::Result<Ordering> {
        #[allow(clippy::cast_sign_loss)]
        let stored = self.source.row(key as u64)?;

        for &position in self.key_positions {
            let (Some(probe), Some(value)) = (self.probe.get(position), stored.get(position))
            else {
                return Err(crate::Error::Internal(format!(
                    "row misses key column {position}"
                )));
            };

            let ordering = probe.compare(value)?;

            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }

        Ok(Ordering::Equal)
    }
}

/// An ordered index over row ids, backed by one B+tree.
///
/// The PRIMARY sorter enforces key tuple uniqueness; SORT sorters permit
/// duplicates by folding the row id into the effective key.
pub struct Sorter {
    name: String,
    primary: bool,
    key_positions: Vec<usize>,
    tree: BPlusTree,
    storage: Arc<AnyStorage>,
    source: Arc<dyn RowSource>,
}

impl Sorter {
    /// Opens a sorter over its tree storage.
    pub fn open(
        meta: &Meta,
        def: &IndexDef,
        source: Arc<dyn RowSource>,
        storage: Arc<AnyStorage>,
    ) -> crate::Result<Self> {
        let key_positions = meta.key_positions(def)?;
        let primary = def.kind == IndexKind::Primary;

        let order = RowKeyOrder {
            source: source.clone(),
            key_positions: key_positions.clone(),
            with_row_id: !primary,
        };

        let tree = BPlusTree::open(storage.clone(), Arc::new(order), meta.storage.cache_size)?;

        log::trace!("opened sorter {:?} ({} keys)", def.name, key_positions.len());

        Ok(Self {
            name: def.name.clone(),
            primary,
            key_positions,
            tree,
            storage,
            source,
        })
    }

    /// The index name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the primary sorter.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Inserts a row id.
    pub fn create(&self, id: RowId) -> crate::Result<()> {
        #[allow(clippy::cast_possible_wrap)]
        let inserted = self.tree.insert(id as i64)?;

        if inserted {
            return Ok(());
        }

        if self.primary {
            Err(crate::Error::UniqueConstraintViolation(self.name.clone()))
        } else {
            Err(crate::Error::Internal(format!(
                "row {id} is already present in index {:?}",
                self.name
            )))
        }
    }

    /// Removes a row id; false if it was not present.
    #[allow(clippy::cast_possible_wrap)]
    pub fn delete(&self, id: RowId) -> crate::Result<bool> {
        self.tree.remove(id as i64)
    }

    /// Point lookup: the row id whose key tuple equals the probe row's.
    pub fn find_row(&self, probe: &Row) -> crate::Result<Option<RowId>> {
        let filter = RowTupleFilter {
            source: self.source.clone(),
            key_positions: &self.key_positions,
            probe,
        };

        let mut cursor = self.tree.cursor(Direction::Ascending, Box::new(filter))?;
        let found = cursor.next()?;
        cursor.close();

        #[allow(clippy::cast_sign_loss)]
        let found = found.map(|key| key as u64);

        Ok(found)
    }

    /// Range cursor over row ids.
    pub fn cursor<'a>(
        &'a self,
        direction: Direction,
        filter: Box<dyn KeyFilter + 'a>,
    ) -> crate::Result<TreeCursor<'a>> {
        self.tree.cursor(direction, filter)
    }

    /// Key column positions within the schema.
    #[must_use]
    pub fn key_positions(&self) -> &[usize] {
        &self.key_positions
    }

    /// Number of indexed row ids.
    pub fn count(&self) -> crate::Result<u64> {
        self.tree.len()
    }

    /// Tree height.
    pub fn height(&self) -> crate::Result<u32> {
        self.tree.height()
    }

    /// Storage size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.tree.bytes()
    }

    /// Structural invariant check (verify support).
    #[doc(hidden)]
    pub fn check_invariants(&self) -> crate::Result<()> {
        self.tree.check_invariants()
    }

    pub(crate) fn storage(&self) -> &Arc<AnyStorage> {
        &self.storage
    }

    /// Flushes the tree storage.
    pub fn sync(&self) -> crate::Result<()> {
        self.storage.sync()
    }
}
