// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, file-backed relational storage engine.
//!
//! FlintDB's core persists typed rows into block-structured files, indexes
//! them with B+trees and guarantees crash-consistent updates through a
//! write-ahead log.
//!
//! The public surface is the [`Table`]: a typed schema ([`Meta`]) plus one
//! or more ordered indexes, the first of which is the primary key. Each
//! table owns a row heap (block storage), one sorter per index and,
//! optionally, a WAL that wraps all of them; a crash at any point is
//! reconciled by log replay on the next open.
//!
//! ```
//! use flintdb::{Column, ColumnType, Direction, IndexDef, IndexKind, Meta, Row, Table, Value};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let meta = Meta::new("users")
//!     .column(Column::new("id", ColumnType::Int64))
//!     .column(Column::new("name", ColumnType::String).with_bytes(16))
//!     .index(IndexDef::new("pk", IndexKind::Primary, &["id"]));
//!
//! let table = Table::create(&folder.path().join("users"), meta)?;
//!
//! let id = table.apply(
//!     &Row::new(vec![Value::Int64(1), Value::String("ada".into())]),
//!     false,
//! )?;
//!
//! let row = table.read(id)?.unwrap();
//! assert_eq!(Some(&Value::Int64(1)), row.get(0));
//!
//! let mut cursor = table.find("id >= 1", Direction::Ascending)?;
//! while let Some(id) = cursor.next()? {
//!     // ...
//! }
//! #
//! # Ok::<(), flintdb::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/flintdb/main/logo.png")]
#![deny(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(clippy::indexing_slicing)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod bptree;

#[doc(hidden)]
pub mod coding;

mod compression;
mod error;

#[doc(hidden)]
pub mod file;

mod latch;
mod meta;

#[doc(hidden)]
pub mod pool;

mod row;
mod sorter;

#[doc(hidden)]
pub mod storage;

mod table;
mod value;

#[doc(hidden)]
pub mod wal;

pub use {
    bptree::{BPlusTree, Direction, KeyCompare, KeyFilter, MatchAll, NaturalOrder},
    compression::CompressionType,
    error::{Error, ErrorCode, Result},
    latch::Latch,
    meta::{
        normalize, BlockType, Column, IndexDef, IndexKind, Meta, StorageOptions, WalMode,
        WalOptions,
    },
    pool::BufferPool,
    row::{Row, RowId},
    sorter::{RowSource, Sorter},
    storage::{AnyStorage, BlockStorage, Storage},
    table::{CmpOp, Condition, OpenMode, Predicate, RowCursor, Table},
    value::{ColumnType, Value},
    wal::{TxId, Wal, WalStorage},
};
