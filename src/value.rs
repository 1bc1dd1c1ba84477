// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Column type tag (closed set)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ColumnType {
    /// 16-bit signed integer
    Int16,

    /// 32-bit signed integer
    Int32,

    /// 64-bit signed integer
    Int64,

    /// Precision-aware fixed-point number, stored as a scaled 64-bit integer
    Decimal,

    /// Length-prefixed UTF-8 within a fixed byte capacity
    String,

    /// Length-prefixed raw bytes within a fixed byte capacity
    Bytes,

    /// Calendar date, packed as `year:14|month:4|day:5` in 24 bits
    Date,

    /// Point in time, 64-bit epoch milliseconds
    Time,

    /// Single bit
    Bit,
}

/// A typed cell value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value
    Null,

    /// 16-bit signed integer
    Int16(i16),

    /// 32-bit signed integer
    Int32(i32),

    /// 64-bit signed integer
    Int64(i64),

    /// Fixed-point number
    Decimal(f64),

    /// UTF-8 string
    String(String),

    /// Raw bytes
    Bytes(Vec<u8>),

    /// Packed calendar date
    Date(u32),

    /// Epoch milliseconds
    Time(i64),

    /// Single bit
    Bit(bool),
}

impl Value {
    /// Packs a calendar date into the 24-bit `year:14|month:4|day:5` form.
    #[must_use]
    pub fn date(year: u16, month: u8, day: u8) -> Self {
        let packed =
            (u32::from(year) << 9) | (u32::from(month & 0x0F) << 5) | u32::from(day & 0x1F);
        Self::Date(packed)
    }

    /// Unpacks a [`Value::Date`] into (year, month, day).
    #[must_use]
    pub fn date_parts(packed: u32) -> (u16, u8, u8) {
        (
            (packed >> 9) as u16,
            ((packed >> 5) & 0x0F) as u8,
            (packed & 0x1F) as u8,
        )
    }

    /// Whether this is [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Self::Int16(v) => Some(f64::from(*v)),
            Self::Int32(v) => Some(f64::from(*v)),
            #[allow(clippy::cast_precision_loss)]
            Self::Int64(v) => Some(*v as f64),
            Self::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    /// Total order over comparable values.
    ///
    /// `Null` sorts before everything; numeric types compare across widths.
    pub fn compare(&self, other: &Self) -> crate::Result<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Ok(Ordering::Equal),
            (Self::Null, _) => Ok(Ordering::Less),
            (_, Self::Null) => Ok(Ordering::Greater),

            (Self::Int16(a), Self::Int16(b)) => Ok(a.cmp(b)),
            (Self::Int32(a), Self::Int32(b)) => Ok(a.cmp(b)),
            (Self::Int64(a), Self::Int64(b)) => Ok(a.cmp(b)),
            (Self::String(a), Self::String(b)) => Ok(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Ok(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Ok(a.cmp(b)),
            (Self::Time(a), Self::Time(b)) => Ok(a.cmp(b)),
            (Self::Bit(a), Self::Bit(b)) => Ok(a.cmp(b)),

            (a, b) => match (a.numeric(), b.numeric()) {
                (Some(x), Some(y)) => Ok(x.total_cmp(&y)),
                _ => Err(crate::Error::InvalidDataType(format!(
                    "cannot compare {a:?} with {b:?}"
                ))),
            },
        }
    }

    /// Whether this value is an instance of the given column type.
    #[must_use]
    pub fn fits(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Self::Int16(_), ColumnType::Int16)
                | (Self::Int32(_), ColumnType::Int32)
                | (Self::Int64(_), ColumnType::Int64)
                | (Self::Decimal(_), ColumnType::Decimal)
                | (Self::String(_), ColumnType::String)
                | (Self::Bytes(_), ColumnType::Bytes)
                | (Self::Date(_), ColumnType::Date)
                | (Self::Time(_), ColumnType::Time)
                | (Self::Bit(_), ColumnType::Bit)
        )
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            Self::Bytes(v) => write!(f, "{}B", v.len()),
            Self::Date(v) => {
                let (y, m, d) = Self::date_parts(*v);
                write!(f, "{y:04}-{m:02}-{d:02}")
            }
            Self::Time(v) => write!(f, "{v}ms"),
            Self::Bit(v) => write!(f, "{}", u8::from(*v)),
        }
    }
}
