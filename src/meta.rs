// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{compression::CompressionType, value::ColumnType, value::Value};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound on a row image; schemas wider than this are rejected.
pub const MAX_ROW_BYTES: usize = 1_048_576;

/// Normalizes a column or index name (trimmed, case-insensitive).
#[must_use]
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A typed column descriptor, immutable after schema creation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Normalized column name
    pub name: String,

    /// Type tag
    pub ty: ColumnType,

    /// Byte capacity for `String`/`Bytes` columns
    #[serde(default)]
    pub bytes: u32,

    /// Fraction digits for `Decimal` columns
    #[serde(default)]
    pub precision: u8,

    /// Whether NULL is storable
    #[serde(default)]
    pub nullable: bool,

    /// Default value
    #[serde(default)]
    pub default: Option<Value>,

    /// Computed expression, carried for embedders
    #[serde(default)]
    pub expression: Option<String>,
}

impl Column {
    /// Creates a column of the given type.
    #[must_use]
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: normalize(name),
            ty,
            bytes: 0,
            precision: 0,
            nullable: false,
            default: None,
            expression: None,
        }
    }

    /// Sets the byte capacity (String/Bytes).
    #[must_use]
    pub fn with_bytes(mut self, bytes: u32) -> Self {
        self.bytes = bytes;
        self
    }

    /// Sets the decimal precision (fraction digits).
    #[must_use]
    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    /// Marks the column nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Fixed byte footprint of the value portion.
    #[must_use]
    pub fn value_width(&self) -> usize {
        match self.ty {
            ColumnType::Int16 => 2,
            ColumnType::Int32 => 4,
            ColumnType::Int64 | ColumnType::Time | ColumnType::Decimal => 8,
            ColumnType::Date => 3,
            ColumnType::Bit => 1,
            ColumnType::String | ColumnType::Bytes => 2 + self.bytes as usize,
        }
    }

    /// Fixed byte footprint including the null marker, if any.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.value_width() + usize::from(self.nullable)
    }
}

/// Index type
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Unique, non-nullable key columns; always index 0
    Primary,

    /// Ordered index permitting duplicate key tuples
    Sort,
}

/// An index declaration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Normalized index name
    pub name: String,

    /// Index type
    pub kind: IndexKind,

    /// Index algorithm; only "bptree" is recognized
    pub algorithm: String,

    /// Normalized key column names, in significance order
    pub keys: Vec<String>,
}

impl IndexDef {
    /// Declares an index over the given key columns.
    #[must_use]
    pub fn new(name: &str, kind: IndexKind, keys: &[&str]) -> Self {
        Self {
            name: normalize(name),
            kind,
            algorithm: "bptree".into(),
            keys: keys.iter().map(|k| normalize(k)).collect(),
        }
    }
}

/// Block storage flavor for the row heap
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BlockType {
    /// Memory-mapped file (default)
    Mmap,

    /// In-process, not persisted
    Memory,

    /// Deflate-compressed payloads
    Z,

    /// LZ4-compressed payloads
    Lz4,

    /// Zstd-compressed payloads
    Zstd,

    /// Snappy-compressed payloads
    Snappy,
}

impl BlockType {
    /// Storage format version written to the file header.
    #[must_use]
    pub fn format_version(self) -> u16 {
        match self {
            Self::Mmap => 1,
            Self::Memory => 2,
            Self::Z => 3,
            Self::Lz4 => 4,
            Self::Zstd => 5,
            Self::Snappy => 6,
        }
    }

    /// Payload compression applied by this variant.
    ///
    /// Fails when the required compression support is not compiled in.
    pub fn compression(self) -> crate::Result<CompressionType> {
        match self {
            Self::Mmap | Self::Memory => Ok(CompressionType::None),
            Self::Z => Ok(CompressionType::Deflate),

            #[cfg(feature = "lz4")]
            Self::Lz4 => Ok(CompressionType::Lz4),

            #[cfg(feature = "zstd")]
            Self::Zstd => Ok(CompressionType::Zstd),

            #[cfg(feature = "snappy")]
            Self::Snappy => Ok(CompressionType::Snappy),

            #[allow(unreachable_patterns)]
            other => Err(crate::Error::InvalidOperation(format!(
                "block type {other:?} requires a compression feature that is not enabled"
            ))),
        }
    }
}

/// Row heap storage options
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Storage flavor
    pub block_type: BlockType,

    /// Data block payload size in bytes (excluding the 16-byte block header)
    pub block_bytes: u16,

    /// File growth quantum in bytes
    pub increment: u64,

    /// Row cache capacity in bytes
    pub cache_size: u64,

    /// Free-block share (percent) above which a compaction is suggested;
    /// 0 disables the hint
    pub compact_threshold: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            block_type: BlockType::Mmap,
            block_bytes: 240,
            increment: /* 1 MiB */ 1_024 * 1_024,
            cache_size: /* 8 MiB */ 8 * 1_024 * 1_024,
            compact_threshold: 0,
        }
    }
}

/// Write-ahead log mode
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WalMode {
    /// Truncate the log back to its header on checkpoint
    Truncate,

    /// Keep the full log across checkpoints
    Log,
}

/// Write-ahead log options
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalOptions {
    /// Whether a WAL is kept at all
    pub enabled: bool,

    /// Truncate or keep the log on checkpoint
    pub mode: WalMode,

    /// Auto-checkpoint every N committed transactions; 0 disables
    pub checkpoint_interval: u32,

    /// Flush the staging buffer after this many records
    pub batch_size: u32,

    /// Deflate record payloads above this byte size
    pub compression_threshold: u32,

    /// Log full page images for UPDATE records (required for replay to
    /// restore in-place updates)
    pub page_data: bool,

    /// Records at or above this byte size bypass the staging buffer
    pub direct_write_threshold: u32,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: WalMode::Truncate,
            checkpoint_interval: 1_024,
            batch_size: 2_048,
            compression_threshold: 4_096,
            page_data: true,
            direct_write_threshold: /* 1 MiB */ 1_024 * 1_024,
        }
    }
}

/// Schema descriptor, persisted as a `.desc` sidecar next to the row heap
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Table name
    pub name: String,

    /// Ordered columns
    pub columns: Vec<Column>,

    /// Ordered indexes; index 0 is the primary
    pub indexes: Vec<IndexDef>,

    /// Row heap storage options
    #[serde(default)]
    pub storage: StorageOptions,

    /// Write-ahead log options
    #[serde(default)]
    pub wal: WalOptions,

    /// Companion text file delimiter (unused by the core)
    #[serde(default)]
    pub delimiter: Option<String>,

    /// Companion text file quote (unused by the core)
    #[serde(default)]
    pub quote: Option<String>,

    /// Companion text file NULL literal (unused by the core)
    #[serde(default)]
    pub null_literal: Option<String>,

    /// Companion text file has no header row (unused by the core)
    #[serde(default)]
    pub header_absent: bool,

    /// Commit every N rows during bulk loads
    #[serde(default = "default_bulk_commit_interval")]
    pub bulk_commit_interval: u32,
}

fn default_bulk_commit_interval() -> u32 {
    10_000
}

impl Meta {
    /// Starts a schema for the given table name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: normalize(name),
            columns: Vec::new(),
            indexes: Vec::new(),
            storage: StorageOptions::default(),
            wal: WalOptions::default(),
            delimiter: None,
            quote: None,
            null_literal: None,
            header_absent: false,
            bulk_commit_interval: default_bulk_commit_interval(),
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Appends an index declaration.
    #[must_use]
    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Overrides the storage options.
    #[must_use]
    pub fn storage_options(mut self, storage: StorageOptions) -> Self {
        self.storage = storage;
        self
    }

    /// Overrides the WAL options.
    #[must_use]
    pub fn wal_options(mut self, wal: WalOptions) -> Self {
        self.wal = wal;
        self
    }

    /// Position of a column by (normalized) name.
    #[must_use]
    pub fn column_position(&self, name: &str) -> Option<usize> {
        let name = normalize(name);
        self.columns.iter().position(|c| c.name == name)
    }

    /// Index descriptor by (normalized) name.
    #[must_use]
    pub fn index_by_name(&self, name: &str) -> Option<(usize, &IndexDef)> {
        let name = normalize(name);
        self.indexes
            .iter()
            .enumerate()
            .find(|(_, idx)| idx.name == name)
    }

    /// Key column positions of an index.
    pub fn key_positions(&self, index: &IndexDef) -> crate::Result<Vec<usize>> {
        index
            .keys
            .iter()
            .map(|key| {
                self.column_position(key).ok_or_else(|| {
                    crate::Error::InvalidOperation(format!(
                        "index {:?} references unknown column {key:?}",
                        index.name
                    ))
                })
            })
            .collect()
    }

    /// Fixed row image width in bytes.
    #[must_use]
    pub fn row_width(&self) -> usize {
        self.columns.iter().map(Column::footprint).sum()
    }

    /// Checks structural invariants of the schema.
    pub fn validate(&self) -> crate::Result<()> {
        if self.columns.is_empty() {
            return Err(crate::Error::InvalidOperation(
                "schema needs at least one column".into(),
            ));
        }

        let Some(primary) = self.indexes.first() else {
            return Err(crate::Error::InvalidOperation(
                "schema needs at least one index".into(),
            ));
        };

        if primary.kind != IndexKind::Primary {
            return Err(crate::Error::InvalidOperation(
                "index 0 must be the primary index".into(),
            ));
        }

        if self
            .indexes
            .iter()
            .skip(1)
            .any(|idx| idx.kind == IndexKind::Primary)
        {
            return Err(crate::Error::InvalidOperation(
                "only index 0 may be primary".into(),
            ));
        }

        for index in &self.indexes {
            if index.algorithm != "bptree" {
                return Err(crate::Error::InvalidOperation(format!(
                    "unknown index algorithm {:?}",
                    index.algorithm
                )));
            }

            for key in &index.keys {
                let Some(pos) = self.column_position(key) else {
                    return Err(crate::Error::InvalidOperation(format!(
                        "index {:?} references unknown column {key:?}",
                        index.name
                    )));
                };

                if index.kind == IndexKind::Primary {
                    #[allow(clippy::indexing_slicing)]
                    let column = &self.columns[pos];

                    if column.nullable {
                        return Err(crate::Error::InvalidOperation(format!(
                            "primary key column {key:?} must not be nullable"
                        )));
                    }
                }
            }
        }

        if self.row_width() > MAX_ROW_BYTES {
            return Err(crate::Error::RowBytesExceeded {
                limit: MAX_ROW_BYTES,
                got: self.row_width(),
            });
        }

        Ok(())
    }

    /// Applies one entry of the string-keyed configuration surface.
    pub fn apply_option(&mut self, key: &str, value: &str) -> crate::Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
            value.parse().map_err(|_| {
                crate::Error::InvalidOperation(format!("bad value {value:?} for option {key:?}"))
            })
        }

        match key {
            "wal.mode" => {
                self.wal.mode = match value.to_uppercase().as_str() {
                    "TRUNCATE" => WalMode::Truncate,
                    "LOG" => WalMode::Log,
                    _ => {
                        return Err(crate::Error::InvalidOperation(format!(
                            "bad value {value:?} for option {key:?}"
                        )))
                    }
                };
            }
            "wal.checkpoint.interval" => self.wal.checkpoint_interval = parse(key, value)?,
            "wal.batch.size" => self.wal.batch_size = parse(key, value)?,
            "wal.compression.threshold" => self.wal.compression_threshold = parse(key, value)?,
            "wal.page.data" => self.wal.page_data = parse::<u8>(key, value)? != 0,
            "wal.direct.write.threshold" => self.wal.direct_write_threshold = parse(key, value)?,
            "storage.increment" => self.storage.increment = parse(key, value)?,
            "bulk_insert.commit.interval" => self.bulk_commit_interval = parse(key, value)?,
            _ => {
                return Err(crate::Error::InvalidOperation(format!(
                    "unknown option {key:?}"
                )))
            }
        }

        Ok(())
    }

    /// Path of the descriptor sidecar for a given heap path.
    #[must_use]
    pub fn descriptor_path(table_path: &Path) -> PathBuf {
        let mut name = table_path.as_os_str().to_os_string();
        name.push(".desc");
        PathBuf::from(name)
    }

    /// Atomically writes the descriptor sidecar.
    pub fn write_to(&self, table_path: &Path) -> crate::Result<()> {
        let path = Self::descriptor_path(table_path);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| crate::Error::Internal(format!("descriptor serialization: {e}")))?;

        crate::file::rewrite_atomic(&path, &json)?;

        log::debug!("wrote descriptor {path:?}");

        Ok(())
    }

    /// Reads the descriptor sidecar.
    pub fn read_from(table_path: &Path) -> crate::Result<Self> {
        let path = Self::descriptor_path(table_path);

        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(crate::Error::TableNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let meta: Self = serde_json::from_slice(&bytes)
            .map_err(|e| crate::Error::Internal(format!("descriptor parse: {e}")))?;

        meta.validate()?;

        Ok(meta)
    }
}
