// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod cursor;
pub mod node;

pub use cursor::{Direction, KeyFilter, MatchAll, TreeCursor};
pub use node::{InternalNode, LeafNode, Node, INTERNAL_MARK, KEY_NULL, NO_NODE};

use crate::storage::{AnyStorage, Storage};
use quick_cache::{sync::Cache as QuickCache, Weighter};
use std::{cmp::Ordering, sync::Arc};

const ROOT_MAGIC: [u8; 4] = *b"ROOT";
const ROOT_SLOT_BYTES: usize = 12;
const NO_ROOT: i64 = -1;

/// Key order used by a tree.
///
/// Keys are 64-bit values (row ids); the comparator may resolve them to
/// row images, so comparisons are fallible.
pub trait KeyCompare: Send + Sync {
    /// Compares two keys.
    fn cmp(&self, a: i64, b: i64) -> crate::Result<Ordering>;
}

/// Plain numeric key order.
pub struct NaturalOrder;

impl KeyCompare for NaturalOrder {
    fn cmp(&self, a: i64, b: i64) -> crate::Result<Ordering> {
        Ok(a.cmp(&b))
    }
}

#[derive(Clone)]
struct NodeWeighter;

impl Weighter<u64, Node> for NodeWeighter {
    fn weight(&self, _: &u64, node: &Node) -> u64 {
        node.weight()
    }
}

/// Lookaside cache of decoded nodes, keyed by block offset.
///
/// Entries are evicted on node free and, via the storage invalidation
/// callback, on WAL commit/rollback touching the page.
pub(crate) struct NodeCache {
    data: QuickCache<u64, Node, NodeWeighter, rustc_hash::FxBuildHasher>,
}

impl NodeCache {
    fn with_capacity_bytes(bytes: u64) -> Arc<Self> {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::expect_used)]
        let opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(bytes.max(1))
            .hot_allocation(0.9)
            .estimated_items_capacity(10_000)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let data = QuickCache::with_options(
            opts,
            NodeWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Arc::new(Self { data })
    }

    fn get(&self, offset: u64) -> Option<Node> {
        self.data.get(&offset)
    }

    fn insert(&self, node: Node) {
        self.data.insert(node.offset(), node);
    }

    pub(crate) fn remove(&self, offset: u64) {
        self.data.remove(&offset);
    }
}

/// One descent step: the internal node and the child slot taken.
struct PathEntry {
    node: InternalNode,
    slot: usize,
}

/// Sorted set of 64-bit keys backed by a block storage.
///
/// Single-writer; the owning table's latch serializes mutations. The root
/// slot lives in the storage's extra header, so root changes ride the same
/// WAL transaction as node writes and commit last.
pub struct BPlusTree {
    storage: Arc<AnyStorage>,
    cmp: Arc<dyn KeyCompare>,
    cache: Arc<NodeCache>,
    leaf_max: usize,
    internal_max: usize,
}

impl std::fmt::Debug for BPlusTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree").finish_non_exhaustive()
    }
}

impl BPlusTree {
    /// Opens a tree over the given storage, initializing the root slot on
    /// first use.
    pub fn open(
        storage: Arc<AnyStorage>,
        cmp: Arc<dyn KeyCompare>,
        cache_bytes: u64,
    ) -> crate::Result<Self> {
        if storage.compressed() {
            return Err(crate::Error::InvalidOperation(
                "compressed storages cannot host a B+tree".into(),
            ));
        }

        let payload = storage.block_payload() as usize;

        if payload % 8 != 0 || payload / 8 < 6 {
            return Err(crate::Error::InvalidOperation(format!(
                "block payload of {payload} bytes cannot hold tree nodes"
            )));
        }

        let leaf_max = payload / 8 - 2;
        let internal_max = leaf_max / 2;

        let slot = storage.read_extra(ROOT_SLOT_BYTES)?;

        #[allow(clippy::indexing_slicing)]
        if slot[..4] != ROOT_MAGIC {
            if slot.iter().all(|b| *b == 0) {
                write_root_slot(&storage, None)?;
            } else {
                return Err(crate::Error::InvalidOperation(
                    "storage does not hold a B+tree root slot".into(),
                ));
            }
        }

        let cache = NodeCache::with_capacity_bytes(cache_bytes);

        let cache_ref = cache.clone();
        storage.set_invalidation(Arc::new(move |offset| {
            cache_ref.remove(offset);
        }));

        log::trace!("opened B+tree, leaf fan-out {leaf_max}, internal fan-out {internal_max}");

        Ok(Self {
            storage,
            cmp,
            cache,
            leaf_max,
            internal_max,
        })
    }

    /// The current root block offset, if the tree is non-empty.
    pub fn root(&self) -> crate::Result<Option<u64>> {
        let slot = self.storage.read_extra(ROOT_SLOT_BYTES)?;

        #[allow(clippy::indexing_slicing)]
        if slot[..4] != ROOT_MAGIC {
            return Err(crate::Error::StorageRead("root slot is gone".into()));
        }

        let mut raw = [0u8; 8];
        raw.copy_from_slice(slot.get(4..12).unwrap_or(&[0; 8]));
        let value = i64::from_le_bytes(raw);

        #[allow(clippy::cast_sign_loss)]
        let root = (value != NO_ROOT).then_some(value as u64);

        Ok(root)
    }

    fn set_root(&self, root: Option<u64>) -> crate::Result<()> {
        write_root_slot(&self.storage, root)
    }

    fn load(&self, offset: u64) -> crate::Result<Node> {
        if let Some(node) = self.cache.get(offset) {
            return Ok(node);
        }

        let Some(bytes) = self.storage.read(offset)? else {
            return Err(crate::Error::StorageRead(format!(
                "dangling node link {offset}"
            )));
        };

        let node = Node::decode(offset, &bytes)?;
        self.cache.insert(node.clone());

        Ok(node)
    }

    pub(crate) fn load_leaf(&self, offset: u64) -> crate::Result<LeafNode> {
        match self.load(offset)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(crate::Error::Internal(format!(
                "expected a leaf at {offset}"
            ))),
        }
    }

    fn store_leaf(&self, leaf: &LeafNode) -> crate::Result<()> {
        self.storage
            .write_at(leaf.offset, &leaf.encode(self.leaf_max))?;
        self.cache.insert(Node::Leaf(leaf.clone()));

        Ok(())
    }

    fn store_internal(&self, node: &InternalNode) -> crate::Result<()> {
        self.storage
            .write_at(node.offset, &node.encode(self.internal_max))?;
        self.cache.insert(Node::Internal(node.clone()));

        Ok(())
    }

    fn alloc_leaf(&self, mut leaf: LeafNode) -> crate::Result<u64> {
        let offset = self.storage.write(&leaf.encode(self.leaf_max))?;
        leaf.offset = offset;
        self.cache.insert(Node::Leaf(leaf));

        Ok(offset)
    }

    fn alloc_internal(&self, mut node: InternalNode) -> crate::Result<u64> {
        let offset = self.storage.write(&node.encode(self.internal_max))?;
        node.offset = offset;
        self.cache.insert(Node::Internal(node));

        Ok(offset)
    }

    fn free_node(&self, offset: u64) -> crate::Result<()> {
        self.cache.remove(offset);
        self.storage.delete(offset)
    }

    /// First index with `keys[idx] >= key`.
    fn lower_bound(&self, keys: &[i64], key: i64) -> crate::Result<usize> {
        let mut lo = 0;
        let mut hi = keys.len();

        while lo < hi {
            let mid = (lo + hi) / 2;

            #[allow(clippy::expect_used)]
            let probe = *keys.get(mid).expect("mid is in bounds");

            if self.cmp.cmp(probe, key)? == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok(lo)
    }

    /// Child slot for a key: the number of separators at or below it.
    fn descend_slot(&self, node: &InternalNode, key: i64) -> crate::Result<usize> {
        let mut lo = 0;
        let mut hi = node.entries.len();

        while lo < hi {
            let mid = (lo + hi) / 2;

            #[allow(clippy::expect_used)]
            let sep = node.entries.get(mid).expect("mid is in bounds").0;

            if self.cmp.cmp(sep, key)? == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }

        Ok(lo)
    }

    /// Descends to the leaf responsible for `key`, recording the path.
    fn descend(&self, key: i64) -> crate::Result<(LeafNode, Vec<PathEntry>)> {
        let Some(root) = self.root()? else {
            return Err(crate::Error::Internal("descent into an empty tree".into()));
        };

        let mut current = root;
        let mut path = Vec::new();

        loop {
            match self.load(current)? {
                Node::Leaf(leaf) => return Ok((leaf, path)),
                Node::Internal(node) => {
                    let slot = self.descend_slot(&node, key)?;

                    #[allow(clippy::expect_used)]
                    let child = node.child_at(slot).expect("slot is within child count");

                    path.push(PathEntry { node, slot });
                    current = child;
                }
            }
        }
    }

    /// Whether an equal key is present.
    pub fn contains(&self, key: i64) -> crate::Result<bool> {
        if self.root()?.is_none() {
            return Ok(false);
        }

        let (leaf, _) = self.descend(key)?;
        let pos = self.lower_bound(&leaf.keys, key)?;

        match leaf.keys.get(pos) {
            Some(&k) => Ok(self.cmp.cmp(k, key)? == Ordering::Equal),
            None => Ok(false),
        }
    }

    /// Inserts a key; returns false if an equal key already exists.
    pub fn insert(&self, key: i64) -> crate::Result<bool> {
        if self.root()?.is_none() {
            let leaf = LeafNode {
                offset: 0,
                left: NO_NODE,
                right: NO_NODE,
                keys: vec![key],
            };

            let offset = self.alloc_leaf(leaf)?;
            self.set_root(Some(offset))?;

            return Ok(true);
        }

        let (mut leaf, path) = self.descend(key)?;
        let pos = self.lower_bound(&leaf.keys, key)?;

        if let Some(&existing) = leaf.keys.get(pos) {
            if self.cmp.cmp(existing, key)? == Ordering::Equal {
                return Ok(false);
            }
        }

        if leaf.keys.len() < self.leaf_max {
            leaf.keys.insert(pos, key);
            self.store_leaf(&leaf)?;

            return Ok(true);
        }

        if self.insert_cooperative(&mut leaf, pos, key, &path)? {
            return Ok(true);
        }

        // Split: the max key overflows into a fresh right sibling
        leaf.keys.insert(pos, key);

        #[allow(clippy::expect_used)]
        let moved = leaf.keys.pop().expect("leaf is overfull");

        let new_leaf = LeafNode {
            offset: 0,
            left: leaf.offset,
            right: leaf.right,
            keys: vec![moved],
        };
        let new_offset = self.alloc_leaf(new_leaf)?;

        if leaf.right != NO_NODE {
            let mut right = self.load_leaf(leaf.right)?;
            right.left = new_offset;
            self.store_leaf(&right)?;
        }

        leaf.right = new_offset;
        self.store_leaf(&leaf)?;

        self.insert_into_parent(path, leaf.offset, moved, new_offset)?;

        Ok(true)
    }

    /// Tries to shed one key to a same-parent sibling leaf with room.
    fn insert_cooperative(
        &self,
        leaf: &mut LeafNode,
        pos: usize,
        key: i64,
        path: &[PathEntry],
    ) -> crate::Result<bool> {
        let Some(entry) = path.last() else {
            return Ok(false);
        };

        let slot = entry.slot;

        // Right sibling: our max key moves to its front
        if slot + 1 < entry.node.child_count() {
            if let Some(right_offset) = entry.node.child_at(slot + 1) {
                if let Node::Leaf(mut right) = self.load(right_offset)? {
                    if right.keys.len() < self.leaf_max {
                        leaf.keys.insert(pos, key);

                        #[allow(clippy::expect_used)]
                        let moved = leaf.keys.pop().expect("leaf is overfull");
                        right.keys.insert(0, moved);

                        let mut parent = entry.node.clone();
                        if let Some(e) = parent.entries.get_mut(slot) {
                            e.0 = moved;
                        }

                        self.store_leaf(leaf)?;
                        self.store_leaf(&right)?;
                        self.store_internal(&parent)?;

                        return Ok(true);
                    }
                }
            }
        }

        // Left sibling: our min key moves to its back
        if slot > 0 {
            if let Some(left_offset) = entry.node.child_at(slot - 1) {
                if let Node::Leaf(mut left) = self.load(left_offset)? {
                    if left.keys.len() < self.leaf_max {
                        leaf.keys.insert(pos, key);
                        let moved = leaf.keys.remove(0);
                        left.keys.push(moved);

                        #[allow(clippy::expect_used)]
                        let new_min = *leaf.keys.first().expect("leaf is non-empty");

                        let mut parent = entry.node.clone();
                        if let Some(e) = parent.entries.get_mut(slot - 1) {
                            e.0 = new_min;
                        }

                        self.store_leaf(leaf)?;
                        self.store_leaf(&left)?;
                        self.store_internal(&parent)?;

                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    /// Propagates a new (separator, child) pair upward after a split.
    fn insert_into_parent(
        &self,
        mut path: Vec<PathEntry>,
        mut left_offset: u64,
        mut sep: i64,
        mut new_child: u64,
    ) -> crate::Result<()> {
        loop {
            let Some(entry) = path.pop() else {
                // Root split: a new internal root over the two halves
                let root = InternalNode {
                    offset: 0,
                    leftmost: left_offset,
                    entries: vec![(sep, new_child)],
                };

                let offset = self.alloc_internal(root)?;
                self.set_root(Some(offset))?;

                log::trace!("tree grew a level, new root {offset}");

                return Ok(());
            };

            let mut node = entry.node;
            node.entries.insert(entry.slot, (sep, new_child));

            if node.entries.len() <= self.internal_max {
                self.store_internal(&node)?;
                return Ok(());
            }

            if self.rotate_internal(&mut node, &path)? {
                return Ok(());
            }

            // Split around the middle entry; the promoted key leaves both
            // halves and is re-anchored at the parent
            let mid = node.entries.len() / 2;
            let right_entries = node.entries.split_off(mid + 1);

            #[allow(clippy::expect_used)]
            let (promoted_sep, promoted_child) =
                node.entries.pop().expect("mid entry exists");

            let right = InternalNode {
                offset: 0,
                leftmost: promoted_child,
                entries: right_entries,
            };

            let right_offset = self.alloc_internal(right)?;
            self.store_internal(&node)?;

            left_offset = node.offset;
            sep = promoted_sep;
            new_child = right_offset;
        }
    }

    /// Tries to rotate one entry of an overfull internal into a same-parent
    /// sibling with room.
    fn rotate_internal(&self, node: &mut InternalNode, path: &[PathEntry]) -> crate::Result<bool> {
        let Some(parent_entry) = path.last() else {
            return Ok(false);
        };

        let pslot = parent_entry.slot;

        // Rotate our last entry into the right sibling
        if pslot + 1 < parent_entry.node.child_count() {
            if let Some(right_offset) = parent_entry.node.child_at(pslot + 1) {
                if let Node::Internal(mut right) = self.load(right_offset)? {
                    if right.entries.len() < self.internal_max {
                        #[allow(clippy::expect_used)]
                        let (moved_sep, moved_child) =
                            node.entries.pop().expect("node is overfull");

                        let mut parent = parent_entry.node.clone();

                        #[allow(clippy::expect_used)]
                        let old_sep = parent.entries.get(pslot).expect("slot has a separator").0;

                        right.entries.insert(0, (old_sep, right.leftmost));
                        right.leftmost = moved_child;

                        if let Some(e) = parent.entries.get_mut(pslot) {
                            e.0 = moved_sep;
                        }

                        self.store_internal(node)?;
                        self.store_internal(&right)?;
                        self.store_internal(&parent)?;

                        return Ok(true);
                    }
                }
            }
        }

        // Rotate our left-most child into the left sibling
        if pslot > 0 {
            if let Some(left_offset) = parent_entry.node.child_at(pslot - 1) {
                if let Node::Internal(mut left) = self.load(left_offset)? {
                    if left.entries.len() < self.internal_max {
                        let mut parent = parent_entry.node.clone();

                        #[allow(clippy::expect_used)]
                        let old_sep =
                            parent.entries.get(pslot - 1).expect("slot has a separator").0;

                        left.entries.push((old_sep, node.leftmost));

                        let (first_sep, first_child) = node.entries.remove(0);
                        node.leftmost = first_child;

                        if let Some(e) = parent.entries.get_mut(pslot - 1) {
                            e.0 = first_sep;
                        }

                        self.store_internal(node)?;
                        self.store_internal(&left)?;
                        self.store_internal(&parent)?;

                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    /// Removes a key; returns false if no equal key exists.
    pub fn remove(&self, key: i64) -> crate::Result<bool> {
        if self.root()?.is_none() {
            return Ok(false);
        }

        let (mut leaf, mut path) = self.descend(key)?;
        let pos = self.lower_bound(&leaf.keys, key)?;

        match leaf.keys.get(pos) {
            Some(&k) if self.cmp.cmp(k, key)? == Ordering::Equal => {}
            _ => return Ok(false),
        }

        leaf.keys.remove(pos);

        if path.is_empty() {
            // The leaf is the root
            if leaf.keys.is_empty() {
                self.free_node(leaf.offset)?;
                self.set_root(None)?;
            } else {
                self.store_leaf(&leaf)?;
            }

            return Ok(true);
        }

        if !leaf.keys.is_empty() {
            self.store_leaf(&leaf)?;

            if pos == 0 {
                #[allow(clippy::expect_used)]
                let new_min = *leaf.keys.first().expect("leaf is non-empty");
                self.refresh_separators(&path, new_min)?;
            }

            return Ok(true);
        }

        // Empty leaf: unlink from the sibling chain, free, rebalance upward
        if leaf.left != NO_NODE {
            let mut left = self.load_leaf(leaf.left)?;
            left.right = leaf.right;
            self.store_leaf(&left)?;
        }

        if leaf.right != NO_NODE {
            let mut right = self.load_leaf(leaf.right)?;
            right.left = leaf.left;
            self.store_leaf(&right)?;
        }

        self.free_node(leaf.offset)?;
        self.remove_child(&mut path)?;

        Ok(true)
    }

    /// Removes the child that the deepest path entry points at, rebalancing
    /// the parent chain.
    fn remove_child(&self, path: &mut Vec<PathEntry>) -> crate::Result<()> {
        let Some(entry) = path.pop() else {
            return Ok(());
        };

        let mut node = entry.node;
        let slot = entry.slot;

        if slot == 0 {
            if node.entries.is_empty() {
                // Its only child is gone; drop this level entirely
                self.free_node(node.offset)?;

                if path.is_empty() {
                    self.set_root(None)?;
                    return Ok(());
                }

                return self.remove_child(path);
            }

            let (_, new_leftmost) = node.entries.remove(0);
            node.leftmost = new_leftmost;
        } else {
            node.entries.remove(slot - 1);
        }

        if !node.entries.is_empty() {
            self.store_internal(&node)?;

            if slot == 0 {
                let min = self.subtree_min(node.leftmost)?;
                self.refresh_separators(path, min)?;
            }

            return Ok(());
        }

        // A single child remains
        if path.is_empty() {
            // Root internal with one child: the child becomes the root
            self.free_node(node.offset)?;
            self.set_root(Some(node.leftmost))?;

            log::trace!("tree shrank a level, new root {}", node.leftmost);

            return Ok(());
        }

        self.rebalance_single_child(node, path)
    }

    /// Borrows from a sibling internal with >= 2 keys, else merges; recurses
    /// upward on merge.
    ///
    /// The parent separator for this subtree can be stale here (its old
    /// left-most child is gone), so separators referencing the subtree are
    /// recomputed from the actual minimum.
    fn rebalance_single_child(
        &self,
        mut node: InternalNode,
        path: &mut Vec<PathEntry>,
    ) -> crate::Result<()> {
        #[allow(clippy::expect_used)]
        let (parent, pslot) = {
            let entry = path.last().expect("path is non-empty");
            (entry.node.clone(), entry.slot)
        };

        let our_min = self.subtree_min(node.leftmost)?;

        // Borrow the left sibling's last entry
        if pslot > 0 {
            if let Some(left_offset) = parent.child_at(pslot - 1) {
                if let Node::Internal(mut left) = self.load(left_offset)? {
                    if left.entries.len() >= 2 {
                        #[allow(clippy::expect_used)]
                        let (moved_sep, moved_child) =
                            left.entries.pop().expect("sibling has entries");

                        let mut parent = parent;

                        node.entries.insert(0, (our_min, node.leftmost));
                        node.leftmost = moved_child;

                        if let Some(e) = parent.entries.get_mut(pslot - 1) {
                            e.0 = moved_sep;
                        }

                        self.store_internal(&left)?;
                        self.store_internal(&node)?;
                        self.store_internal(&parent)?;

                        return Ok(());
                    }
                }
            }
        }

        // Borrow the right sibling's left-most child
        if pslot + 1 < parent.child_count() {
            if let Some(right_offset) = parent.child_at(pslot + 1) {
                if let Node::Internal(mut right) = self.load(right_offset)? {
                    if right.entries.len() >= 2 {
                        let mut parent = parent;

                        #[allow(clippy::expect_used)]
                        let right_sep =
                            parent.entries.get(pslot).expect("slot has a separator").0;

                        let (first_sep, first_child) = right.entries.remove(0);
                        let moved_child = right.leftmost;
                        right.leftmost = first_child;

                        node.entries.push((right_sep, moved_child));

                        if let Some(e) = parent.entries.get_mut(pslot) {
                            e.0 = first_sep;
                        }

                        if let Some(e) = pslot.checked_sub(1).and_then(|i| parent.entries.get_mut(i))
                        {
                            e.0 = our_min;
                        }

                        self.store_internal(&right)?;
                        self.store_internal(&node)?;
                        self.store_internal(&parent)?;

                        if pslot == 0 {
                            // This subtree is its parent's left-most; the
                            // separator referencing it lives higher up
                            let upper = path.len() - 1;
                            self.refresh_separators(path.get(..upper).unwrap_or(&[]), our_min)?;
                        }

                        return Ok(());
                    }
                }
            }
        }

        // Merge into the left sibling when possible
        if pslot > 0 {
            if let Some(left_offset) = parent.child_at(pslot - 1) {
                if let Node::Internal(mut left) = self.load(left_offset)? {
                    left.entries.push((our_min, node.leftmost));

                    self.store_internal(&left)?;
                    self.free_node(node.offset)?;

                    return self.remove_child(path);
                }
            }
        }

        // Otherwise into the right sibling
        if pslot + 1 < parent.child_count() {
            if let Some(right_offset) = parent.child_at(pslot + 1) {
                if let Node::Internal(mut right) = self.load(right_offset)? {
                    #[allow(clippy::expect_used)]
                    let right_sep = parent.entries.get(pslot).expect("slot has a separator").0;

                    right.entries.insert(0, (right_sep, right.leftmost));
                    right.leftmost = node.leftmost;

                    self.store_internal(&right)?;
                    self.free_node(node.offset)?;

                    return self.remove_child(path);
                }
            }
        }

        // No siblings; the degenerate single-child node stays
        self.store_internal(&node)?;
        self.refresh_separators(path, our_min)
    }

    /// Updates the nearest ancestor separator covering a subtree whose
    /// minimum key changed.
    fn refresh_separators(&self, path: &[PathEntry], new_min: i64) -> crate::Result<()> {
        for entry in path.iter().rev() {
            if entry.slot > 0 {
                let mut node = entry.node.clone();

                if let Some(e) = node.entries.get_mut(entry.slot - 1) {
                    e.0 = new_min;
                }

                self.store_internal(&node)?;

                return Ok(());
            }
        }

        // The key was the global minimum; no separator references it
        Ok(())
    }

    /// Minimum leaf key of a subtree.
    fn subtree_min(&self, mut offset: u64) -> crate::Result<i64> {
        loop {
            match self.load(offset)? {
                Node::Leaf(leaf) => {
                    return leaf.keys.first().copied().ok_or_else(|| {
                        crate::Error::Internal(format!("empty leaf {offset} in subtree"))
                    });
                }
                Node::Internal(node) => offset = node.leftmost,
            }
        }
    }

    /// Opens a range cursor.
    pub fn cursor<'a>(
        &'a self,
        direction: Direction,
        filter: Box<dyn KeyFilter + 'a>,
    ) -> crate::Result<TreeCursor<'a>> {
        TreeCursor::new(self, direction, filter)
    }

    /// Descends to the boundary leaf for a filter.
    pub(crate) fn seek_leaf(
        &self,
        direction: Direction,
        filter: &dyn KeyFilter,
    ) -> crate::Result<Option<LeafNode>> {
        let Some(root) = self.root()? else {
            return Ok(None);
        };

        let mut current = root;

        loop {
            match self.load(current)? {
                Node::Leaf(leaf) => return Ok(Some(leaf)),
                Node::Internal(node) => {
                    let mut lo = 0;
                    let mut hi = node.entries.len();

                    while lo < hi {
                        let mid = (lo + hi) / 2;

                        #[allow(clippy::expect_used)]
                        let sep = node.entries.get(mid).expect("mid is in bounds").0;

                        let go_right = match direction {
                            Direction::Ascending => filter.cmp(sep)? == Ordering::Greater,
                            Direction::Descending => filter.cmp(sep)? != Ordering::Less,
                        };

                        if go_right {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }

                    #[allow(clippy::expect_used)]
                    let child = node.child_at(lo).expect("slot is within child count");
                    current = child;
                }
            }
        }
    }

    /// Number of keys, by walking the leaf chain.
    pub fn len(&self) -> crate::Result<u64> {
        let Some(mut leaf) = self.seek_leaf(Direction::Ascending, &MatchAll)? else {
            return Ok(0);
        };

        let mut count = leaf.keys.len() as u64;

        while leaf.right != NO_NODE {
            leaf = self.load_leaf(leaf.right)?;
            count += leaf.keys.len() as u64;
        }

        Ok(count)
    }

    /// Whether the tree holds no keys.
    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.root()?.is_none())
    }

    /// Number of levels.
    pub fn height(&self) -> crate::Result<u32> {
        let Some(mut current) = self.root()? else {
            return Ok(0);
        };

        let mut height = 1;

        loop {
            match self.load(current)? {
                Node::Leaf(_) => return Ok(height),
                Node::Internal(node) => {
                    current = node.leftmost;
                    height += 1;
                }
            }
        }
    }

    /// Storage size in bytes.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.storage.bytes()
    }

    /// Checks every structural invariant; test and verify support.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> crate::Result<()> {
        let Some(root) = self.root()? else {
            return Ok(());
        };

        self.check_node(root, true)?;

        // Leaf chain: doubly linked, ascending across the whole tree
        let Some(mut leaf) = self.seek_leaf(Direction::Ascending, &MatchAll)? else {
            return Err(crate::Error::Internal(
                "non-empty tree without a left-most leaf".into(),
            ));
        };

        if leaf.left != NO_NODE {
            return Err(crate::Error::Internal(
                "left-most leaf has a left sibling".into(),
            ));
        }

        let mut previous_max = None;
        let mut previous_offset = NO_NODE;

        loop {
            if leaf.left != previous_offset {
                return Err(crate::Error::Internal(format!(
                    "leaf {} back-link is broken",
                    leaf.offset
                )));
            }

            for window in leaf.keys.windows(2) {
                if let [a, b] = window {
                    if self.cmp.cmp(*a, *b)? != Ordering::Less {
                        return Err(crate::Error::Internal(format!(
                            "leaf {} keys out of order",
                            leaf.offset
                        )));
                    }
                }
            }

            if let (Some(max), Some(&min)) = (previous_max, leaf.keys.first()) {
                if self.cmp.cmp(max, min)? != Ordering::Less {
                    return Err(crate::Error::Internal(format!(
                        "leaf {} starts below its left sibling",
                        leaf.offset
                    )));
                }
            }

            previous_max = leaf.keys.last().copied().or(previous_max);
            previous_offset = leaf.offset;

            if leaf.right == NO_NODE {
                break;
            }

            leaf = self.load_leaf(leaf.right)?;
        }

        Ok(())
    }

    fn check_node(&self, offset: u64, is_root: bool) -> crate::Result<(i64, u32)> {
        match self.load(offset)? {
            Node::Leaf(leaf) => {
                if leaf.keys.is_empty() && !is_root {
                    return Err(crate::Error::Internal(format!(
                        "leaf {offset} is empty"
                    )));
                }

                if leaf.keys.len() > self.leaf_max {
                    return Err(crate::Error::Internal(format!(
                        "leaf {offset} is overfull"
                    )));
                }

                Ok((leaf.keys.first().copied().unwrap_or(KEY_NULL), 1))
            }

            Node::Internal(node) => {
                if node.entries.len() > self.internal_max {
                    return Err(crate::Error::Internal(format!(
                        "internal {offset} is overfull"
                    )));
                }

                for window in node.entries.windows(2) {
                    if let [(a, _), (b, _)] = window {
                        if self.cmp.cmp(*a, *b)? != Ordering::Less {
                            return Err(crate::Error::Internal(format!(
                                "internal {offset} has unsorted or duplicate separators"
                            )));
                        }
                    }
                }

                let (min, height) = self.check_node(node.leftmost, false)?;

                for (sep, child) in &node.entries {
                    let (child_min, child_height) = self.check_node(*child, false)?;

                    if child_height != height {
                        return Err(crate::Error::Internal(format!(
                            "internal {offset} has children at different heights"
                        )));
                    }

                    if self.cmp.cmp(*sep, child_min)? != Ordering::Equal {
                        return Err(crate::Error::Internal(format!(
                            "internal {offset} separator {sep} does not equal subtree minimum {child_min}"
                        )));
                    }
                }

                Ok((min, height + 1))
            }
        }
    }
}

fn write_root_slot(storage: &AnyStorage, root: Option<u64>) -> crate::Result<()> {
    let mut slot = [0u8; ROOT_SLOT_BYTES];
    slot[..4].copy_from_slice(&ROOT_MAGIC);

    #[allow(clippy::cast_possible_wrap)]
    let value = root.map_or(NO_ROOT, |offset| offset as i64);
    slot[4..].copy_from_slice(&value.to_le_bytes());

    storage.write_extra(&slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{meta::StorageOptions, storage::BlockStorage};
    use test_log::test;

    /// 48-byte payload: LEAF_MAX = 4, INTERNAL_MAX = 2.
    fn small_tree() -> crate::Result<BPlusTree> {
        let opts = StorageOptions {
            block_bytes: 48,
            increment: 4_096,
            ..Default::default()
        };

        let storage = Arc::new(AnyStorage::Block(BlockStorage::memory(&opts)?));

        BPlusTree::open(storage, Arc::new(NaturalOrder), 1_024 * 1_024)
    }

    fn collect(tree: &BPlusTree, direction: Direction) -> crate::Result<Vec<i64>> {
        let mut cursor = tree.cursor(direction, Box::new(MatchAll))?;
        let mut keys = Vec::new();

        while let Some(key) = cursor.next()? {
            keys.push(key);
        }

        Ok(keys)
    }

    #[test]
    fn tree_ascending_inserts() -> crate::Result<()> {
        let tree = small_tree()?;

        for key in 1..=100 {
            assert!(tree.insert(key)?);
        }

        tree.check_invariants()?;

        assert_eq!(100, tree.len()?);
        assert!(tree.height()? >= 3);
        assert_eq!((1..=100).collect::<Vec<_>>(), collect(&tree, Direction::Ascending)?);

        Ok(())
    }

    #[test]
    fn tree_descending_inserts() -> crate::Result<()> {
        let tree = small_tree()?;

        for key in (1..=100).rev() {
            assert!(tree.insert(key)?);
        }

        tree.check_invariants()?;
        assert_eq!((1..=100).collect::<Vec<_>>(), collect(&tree, Direction::Ascending)?);

        Ok(())
    }

    #[test]
    fn tree_interleaved_inserts() -> crate::Result<()> {
        let tree = small_tree()?;

        // Zig-zag insertion order exercises cooperative redistribution
        for key in (0..50).flat_map(|i| [i, 99 - i]) {
            assert!(tree.insert(key)?);
            tree.check_invariants()?;
        }

        assert_eq!((0..=99).collect::<Vec<_>>(), collect(&tree, Direction::Ascending)?);

        Ok(())
    }

    #[test]
    fn tree_duplicate_insert_is_noop() -> crate::Result<()> {
        let tree = small_tree()?;

        assert!(tree.insert(7)?);
        assert!(!tree.insert(7)?);
        assert_eq!(1, tree.len()?);

        Ok(())
    }

    #[test]
    fn tree_remove_missing_is_noop() -> crate::Result<()> {
        let tree = small_tree()?;

        assert!(!tree.remove(7)?);

        tree.insert(7)?;
        assert!(!tree.remove(8)?);
        assert!(tree.remove(7)?);

        Ok(())
    }

    #[test]
    fn tree_remove_all_resets_root() -> crate::Result<()> {
        let tree = small_tree()?;

        for key in 1..=50 {
            tree.insert(key)?;
        }

        for key in 1..=50 {
            assert!(tree.remove(key)?);
            tree.check_invariants()?;
        }

        assert!(tree.is_empty()?);
        assert_eq!(0, tree.len()?);
        assert_eq!(0, tree.height()?);

        // The tree is usable again afterwards
        tree.insert(42)?;
        assert!(tree.contains(42)?);

        Ok(())
    }

    #[test]
    fn tree_remove_in_reverse() -> crate::Result<()> {
        let tree = small_tree()?;

        for key in 1..=80 {
            tree.insert(key)?;
        }

        for key in (1..=80).rev() {
            assert!(tree.remove(key)?);
            tree.check_invariants()?;
        }

        assert!(tree.is_empty()?);

        Ok(())
    }

    #[test]
    fn tree_random_churn() -> crate::Result<()> {
        use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

        let tree = small_tree()?;
        let mut rng = StdRng::seed_from_u64(0xF11);

        let mut keys: Vec<i64> = (0..300).collect();
        keys.shuffle(&mut rng);

        for &key in &keys {
            assert!(tree.insert(key)?);
        }

        tree.check_invariants()?;
        assert_eq!(300, tree.len()?);

        keys.shuffle(&mut rng);

        for &key in keys.iter().take(150) {
            assert!(tree.remove(key)?);
        }

        tree.check_invariants()?;
        assert_eq!(150, tree.len()?);

        let mut expected: Vec<i64> = keys.iter().skip(150).copied().collect();
        expected.sort_unstable();

        assert_eq!(expected, collect(&tree, Direction::Ascending)?);

        Ok(())
    }

    #[test]
    fn tree_descending_cursor_reverses_ascending() -> crate::Result<()> {
        let tree = small_tree()?;

        for key in [5, 1, 9, 3, 7, 2, 8, 4, 6, 0] {
            tree.insert(key)?;
        }

        let mut ascending = collect(&tree, Direction::Ascending)?;
        let descending = collect(&tree, Direction::Descending)?;

        ascending.reverse();
        assert_eq!(ascending, descending);

        Ok(())
    }

    #[test]
    fn tree_range_filter_cursor() -> crate::Result<()> {
        struct Between(i64, i64);

        impl KeyFilter for Between {
            fn cmp(&self, key: i64) -> crate::Result<Ordering> {
                Ok(if key < self.0 {
                    Ordering::Greater
                } else if key > self.1 {
                    Ordering::Less
                } else {
                    Ordering::Equal
                })
            }
        }

        let tree = small_tree()?;

        for key in 0..100 {
            tree.insert(key)?;
        }

        let mut cursor = tree.cursor(Direction::Ascending, Box::new(Between(40, 49)))?;
        let mut keys = Vec::new();

        while let Some(key) = cursor.next()? {
            keys.push(key);
        }

        assert_eq!((40..=49).collect::<Vec<_>>(), keys);

        let mut cursor = tree.cursor(Direction::Descending, Box::new(Between(40, 49)))?;
        let mut keys = Vec::new();

        while let Some(key) = cursor.next()? {
            keys.push(key);
        }

        assert_eq!((40..=49).rev().collect::<Vec<_>>(), keys);

        Ok(())
    }

    #[test]
    fn tree_rejects_compressed_storage() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let opts = StorageOptions {
            block_type: crate::meta::BlockType::Z,
            increment: 4_096,
            ..Default::default()
        };

        let storage = Arc::new(AnyStorage::Block(BlockStorage::create(
            &dir.path().join("t"),
            &opts,
        )?));

        let err = BPlusTree::open(storage, Arc::new(NaturalOrder), 1_024).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidOperation(_)));

        Ok(())
    }
}
