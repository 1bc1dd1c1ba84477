// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// First field of an internal node; never a valid sibling link.
pub const INTERNAL_MARK: i64 = -2;

/// Fills unused key slots.
pub const KEY_NULL: i64 = -1;

/// "No node" in sibling/child links (block offsets start past the file
/// header).
pub const NO_NODE: u64 = 0;

/// A decoded B+tree node
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// Key-bearing leaf
    Leaf(LeafNode),

    /// Routing node
    Internal(InternalNode),
}

impl Node {
    /// The node's block offset.
    #[must_use]
    pub fn offset(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => leaf.offset,
            Self::Internal(node) => node.offset,
        }
    }

    /// Approximate in-memory weight for the node cache.
    #[must_use]
    pub fn weight(&self) -> u64 {
        match self {
            Self::Leaf(leaf) => 24 + 8 * leaf.keys.len() as u64,
            Self::Internal(node) => 24 + 16 * node.entries.len() as u64,
        }
    }

    /// Decodes a node from its block payload; the kind is told apart by the
    /// leading internal mark.
    pub fn decode(offset: u64, bytes: &[u8]) -> crate::Result<Self> {
        let mut reader = Cursor::new(bytes);

        let first = reader.read_i64::<LittleEndian>().map_err(|_| {
            crate::Error::StorageRead(format!("node {offset} is too short"))
        })?;

        if first == INTERNAL_MARK {
            let internal_max = (bytes.len() - 16) / 16;
            let leftmost = reader.read_u64::<LittleEndian>()?;

            let mut entries = Vec::new();

            for _ in 0..internal_max {
                let key = reader.read_i64::<LittleEndian>()?;
                let child = reader.read_u64::<LittleEndian>()?;

                if key == KEY_NULL {
                    break;
                }

                entries.push((key, child));
            }

            Ok(Self::Internal(InternalNode {
                offset,
                leftmost,
                entries,
            }))
        } else {
            let leaf_max = bytes.len() / 8 - 2;

            #[allow(clippy::cast_sign_loss)]
            let left = first as u64;
            let right = reader.read_u64::<LittleEndian>()?;

            let mut keys = Vec::new();

            for _ in 0..leaf_max {
                let key = reader.read_i64::<LittleEndian>()?;

                if key == KEY_NULL {
                    break;
                }

                keys.push(key);
            }

            Ok(Self::Leaf(LeafNode {
                offset,
                left,
                right,
                keys,
            }))
        }
    }
}

/// A leaf: sibling links plus sorted keys
#[derive(Clone, Debug, PartialEq)]
pub struct LeafNode {
    /// Block offset of this node
    pub offset: u64,

    /// Left sibling, or [`NO_NODE`]
    pub left: u64,

    /// Right sibling, or [`NO_NODE`]
    pub right: u64,

    /// Sorted keys
    pub keys: Vec<i64>,
}

impl LeafNode {
    /// Encodes the leaf into a full node payload.
    #[must_use]
    pub fn encode(&self, leaf_max: usize) -> Vec<u8> {
        debug_assert!(self.keys.len() <= leaf_max);

        let mut bytes = Vec::with_capacity((2 + leaf_max) * 8);

        #[allow(clippy::expect_used)]
        {
            bytes
                .write_u64::<LittleEndian>(self.left)
                .expect("cannot fail");
            bytes
                .write_u64::<LittleEndian>(self.right)
                .expect("cannot fail");

            for slot in 0..leaf_max {
                let key = self.keys.get(slot).copied().unwrap_or(KEY_NULL);
                bytes.write_i64::<LittleEndian>(key).expect("cannot fail");
            }
        }

        bytes
    }
}

/// An internal node: a left-most child plus (separator key, child) pairs
///
/// Each separator equals the minimum leaf key of the subtree hanging off
/// its child link.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalNode {
    /// Block offset of this node
    pub offset: u64,

    /// Child for keys below the first separator
    pub leftmost: u64,

    /// (separator, child) pairs in ascending separator order
    pub entries: Vec<(i64, u64)>,
}

impl InternalNode {
    /// Encodes the node into a full node payload.
    #[must_use]
    pub fn encode(&self, internal_max: usize) -> Vec<u8> {
        debug_assert!(self.entries.len() <= internal_max);

        let mut bytes = Vec::with_capacity(16 + internal_max * 16);

        #[allow(clippy::expect_used)]
        {
            bytes
                .write_i64::<LittleEndian>(INTERNAL_MARK)
                .expect("cannot fail");
            bytes
                .write_u64::<LittleEndian>(self.leftmost)
                .expect("cannot fail");

            for slot in 0..internal_max {
                let (key, child) = self.entries.get(slot).copied().unwrap_or((KEY_NULL, NO_NODE));
                bytes.write_i64::<LittleEndian>(key).expect("cannot fail");
                bytes.write_u64::<LittleEndian>(child).expect("cannot fail");
            }
        }

        bytes
    }

    /// Number of children (entries plus the left-most link).
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.entries.len() + 1
    }

    /// Child link at the given slot (0 is the left-most).
    #[must_use]
    pub fn child_at(&self, slot: usize) -> Option<u64> {
        if slot == 0 {
            Some(self.leftmost)
        } else {
            self.entries.get(slot - 1).map(|(_, child)| *child)
        }
    }
}
