// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{row::Row, value::Value};
use quick_cache::{sync::Cache as QuickCache, Weighter};
use std::sync::Arc;

#[derive(Clone)]
struct RowWeighter;

impl Weighter<u64, Row> for RowWeighter {
    fn weight(&self, _: &u64, row: &Row) -> u64 {
        let heap: usize = row
            .values()
            .iter()
            .map(|value| match value {
                Value::String(s) => s.len(),
                Value::Bytes(b) => b.len(),
                _ => 8,
            })
            .sum();

        32 + heap as u64
    }
}

/// Lookaside cache of decoded rows, keyed by row id.
///
/// Populated on read and invalidated through the storage callback on
/// delete, free-list reuse and WAL commit/rollback.
pub(crate) struct RowCache {
    data: QuickCache<u64, Row, RowWeighter, rustc_hash::FxBuildHasher>,
}

impl RowCache {
    pub fn with_capacity_bytes(bytes: u64) -> Arc<Self> {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::expect_used)]
        let opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(bytes.max(1))
            .hot_allocation(0.9)
            .estimated_items_capacity(100_000)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let data = QuickCache::with_options(
            opts,
            RowWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Arc::new(Self { data })
    }

    pub fn get(&self, id: u64) -> Option<Row> {
        self.data.get(&id)
    }

    pub fn insert(&self, id: u64, row: Row) {
        self.data.insert(id, row);
    }

    pub fn remove(&self, id: u64) {
        self.data.remove(&id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}
