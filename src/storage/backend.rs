// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::{fs::File, path::Path};

/// Raw byte-addressed backing of a block storage.
///
/// The storage layer above never touches files directly; both backings
/// present the same flat read/write surface.
pub enum Backing {
    /// Memory-mapped file
    Mmap(MmapFile),

    /// In-process byte array, not persisted
    Memory(Vec<u8>),
}

impl Backing {
    /// Current backing length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Mmap(m) => m.len,
            Self::Memory(v) => v.len() as u64,
        }
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::Result<()> {
        let start = offset as usize;
        let end = start + buf.len();

        let src = match self {
            Self::Mmap(m) => m.map.get(start..end),
            Self::Memory(v) => v.get(start..end),
        };

        let Some(src) = src else {
            return Err(crate::Error::StorageRead(format!(
                "read of {}..{} beyond backing length {}",
                start,
                end,
                self.len()
            )));
        };

        buf.copy_from_slice(src);

        Ok(())
    }

    /// Writes `bytes` at `offset`; the backing must already be large enough.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> crate::Result<()> {
        let start = offset as usize;
        let end = start + bytes.len();

        let dst = match self {
            Self::Mmap(m) => m.map.get_mut(start..end),
            Self::Memory(v) => v.get_mut(start..end),
        };

        let Some(dst) = dst else {
            return Err(crate::Error::StorageWrite(format!(
                "write of {start}..{end} beyond backing length"
            )));
        };

        dst.copy_from_slice(bytes);

        Ok(())
    }

    /// Grows the backing to at least `len` bytes.
    pub fn grow_to(&mut self, len: u64) -> crate::Result<()> {
        if len <= self.len() {
            return Ok(());
        }

        match self {
            Self::Mmap(m) => m.grow_to(len),
            Self::Memory(v) => {
                v.resize(len as usize, 0);
                Ok(())
            }
        }
    }

    /// Flushes dirty pages to disk.
    pub fn sync(&self) -> crate::Result<()> {
        match self {
            Self::Mmap(m) => {
                m.map.flush()?;
                m.file.sync_all()?;
                Ok(())
            }
            Self::Memory(_) => Ok(()),
        }
    }
}

/// A growable memory-mapped file
pub struct MmapFile {
    file: File,
    map: memmap2::MmapMut,
    len: u64,
}

impl MmapFile {
    /// Opens (or creates) a file and maps it with at least `min_len` bytes.
    pub fn open(path: &Path, min_len: u64, truncate: bool) -> crate::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;

        let mut len = file.metadata()?.len();

        if len < min_len {
            file.set_len(min_len)?;
            len = min_len;
        }

        // The mapping is never resized in place; growth remaps after
        // set_len, and all slicing is bounds-checked
        #[allow(unsafe_code)]
        let map = unsafe { memmap2::MmapMut::map_mut(&file)? };

        Ok(Self { file, map, len })
    }

    fn grow_to(&mut self, len: u64) -> crate::Result<()> {
        self.map.flush()?;
        self.file.set_len(len)?;

        #[allow(unsafe_code)]
        {
            self.map = unsafe { memmap2::MmapMut::map_mut(&self.file)? };
        }

        self.len = len;

        Ok(())
    }
}
