// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{node::NO_NODE, BPlusTree};
use std::cmp::Ordering;

/// Cursor direction
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Keys in ascending order
    Ascending,

    /// Keys in descending order
    Descending,
}

/// Steers a range cursor.
///
/// Compares the sought range against a stored key: `Greater` when the key
/// lies before the range, `Equal` when it matches, `Less` when it lies
/// beyond. Over a sorted key sequence the results must be monotone
/// (`Greater*` then `Equal*` then `Less*`).
pub trait KeyFilter {
    /// Range-versus-key comparison.
    fn cmp(&self, key: i64) -> crate::Result<Ordering>;
}

/// Matches every key (full scans).
pub struct MatchAll;

impl KeyFilter for MatchAll {
    fn cmp(&self, _: i64) -> crate::Result<Ordering> {
        Ok(Ordering::Equal)
    }
}

/// Single-shot range cursor over a B+tree.
///
/// Yields keys matching the filter, walking sibling links in the chosen
/// direction, and stops at the first key beyond the range.
pub struct TreeCursor<'a> {
    tree: &'a BPlusTree,
    filter: Box<dyn KeyFilter + 'a>,
    direction: Direction,

    /// Keys of the current leaf
    keys: Vec<i64>,

    /// Next slot to look at; for descending cursors this is one past the
    /// slot
    pos: usize,

    /// Sibling link to follow when the current leaf is exhausted
    next_leaf: u64,

    done: bool,
}

impl<'a> TreeCursor<'a> {
    pub(super) fn new(
        tree: &'a BPlusTree,
        direction: Direction,
        filter: Box<dyn KeyFilter + 'a>,
    ) -> crate::Result<Self> {
        let mut cursor = Self {
            tree,
            filter,
            direction,
            keys: Vec::new(),
            pos: 0,
            next_leaf: NO_NODE,
            done: false,
        };

        match tree.seek_leaf(direction, cursor.filter.as_ref())? {
            Some(leaf) => {
                cursor.next_leaf = match direction {
                    Direction::Ascending => leaf.right,
                    Direction::Descending => leaf.left,
                };
                cursor.pos = match direction {
                    Direction::Ascending => 0,
                    Direction::Descending => leaf.keys.len(),
                };
                cursor.keys = leaf.keys;
            }
            None => cursor.done = true,
        }

        Ok(cursor)
    }

    /// The next matching key, or `None` once the range is exhausted.
    pub fn next(&mut self) -> crate::Result<Option<i64>> {
        while !self.done {
            let candidate = match self.direction {
                Direction::Ascending => {
                    if self.pos < self.keys.len() {
                        let key = *self.keys.get(self.pos).unwrap_or(&0);
                        self.pos += 1;
                        Some(key)
                    } else {
                        None
                    }
                }
                Direction::Descending => {
                    if self.pos > 0 {
                        self.pos -= 1;
                        let key = *self.keys.get(self.pos).unwrap_or(&0);
                        Some(key)
                    } else {
                        None
                    }
                }
            };

            let Some(key) = candidate else {
                if self.next_leaf == NO_NODE {
                    self.done = true;
                    break;
                }

                let leaf = self.tree.load_leaf(self.next_leaf)?;

                self.next_leaf = match self.direction {
                    Direction::Ascending => leaf.right,
                    Direction::Descending => leaf.left,
                };
                self.pos = match self.direction {
                    Direction::Ascending => 0,
                    Direction::Descending => leaf.keys.len(),
                };
                self.keys = leaf.keys;

                continue;
            };

            match (self.direction, self.filter.cmp(key)?) {
                (_, Ordering::Equal) => return Ok(Some(key)),

                // Key before the range: keep seeking
                (Direction::Ascending, Ordering::Greater)
                | (Direction::Descending, Ordering::Less) => {}

                // Key beyond the range: the cursor is exhausted
                (Direction::Ascending, Ordering::Less)
                | (Direction::Descending, Ordering::Greater) => {
                    self.done = true;
                }
            }
        }

        Ok(None)
    }

    /// Releases the cursor's leaf state.
    pub fn close(&mut self) {
        self.done = true;
        self.keys = Vec::new();
        self.next_leaf = NO_NODE;
    }
}
