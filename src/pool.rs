// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{Arc, Mutex};

const MIN_CLASS_SHIFT: u32 = 8; // 256 B
const CLASS_COUNT: usize = 13; // up to 1 MiB
const MAX_POOLED_PER_CLASS: usize = 16;

/// Pool of reusable I/O buffers in power-of-two size classes.
///
/// Borrow/return is thread-safe; oversize requests are allocated ad hoc and
/// not returned to the pool.
pub struct BufferPool {
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classes: (0..CLASS_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
        })
    }

    fn class_of(len: usize) -> Option<usize> {
        let bits = len.next_power_of_two().trailing_zeros().max(MIN_CLASS_SHIFT);
        let class = (bits - MIN_CLASS_SHIFT) as usize;

        (class < CLASS_COUNT).then_some(class)
    }

    /// Borrows a zeroed buffer of exactly `len` bytes.
    pub fn get(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let class = Self::class_of(len);

        let mut buf = match class {
            Some(idx) => self
                .classes
                .get(idx)
                .and_then(|slot| slot.lock().ok()?.pop())
                .unwrap_or_else(|| Vec::with_capacity(1 << (idx as u32 + MIN_CLASS_SHIFT))),
            None => Vec::with_capacity(len),
        };

        buf.clear();
        buf.resize(len, 0);

        PooledBuffer {
            buf,
            class,
            pool: self.clone(),
        }
    }

    fn put_back(&self, class: usize, buf: Vec<u8>) {
        if let Some(slot) = self.classes.get(class) {
            if let Ok(mut guard) = slot.lock() {
                if guard.len() < MAX_POOLED_PER_CLASS {
                    guard.push(buf);
                }
            }
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    class: Option<usize>,
    pool: Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl PooledBuffer {
    /// Detaches the buffer from the pool, keeping its contents.
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.class = None;
        std::mem::take(&mut self.buf)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(class) = self.class {
            self.pool.put_back(class, std::mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn pool_reuses_buffers() {
        let pool = BufferPool::new();

        let ptr = {
            let buf = pool.get(300);
            assert_eq!(300, buf.len());
            buf.as_ptr() as usize
        };

        // Same class, should hand back the pooled allocation
        let buf = pool.get(400);
        assert_eq!(400, buf.len());
        assert_eq!(ptr, buf.as_ptr() as usize);
    }

    #[test]
    fn pool_zeroes_reused_buffers() {
        let pool = BufferPool::new();

        {
            let mut buf = pool.get(256);
            buf.iter_mut().for_each(|b| *b = 0xAB);
        }

        let buf = pool.get(256);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn pool_oversize_is_ad_hoc() {
        let pool = BufferPool::new();

        let buf = pool.get(4 * 1_024 * 1_024);
        assert_eq!(4 * 1_024 * 1_024, buf.len());
    }
}
