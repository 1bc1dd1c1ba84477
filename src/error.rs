// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    compression::CompressionType,
    row::Row,
};

/// Stable numeric error enumeration.
///
/// The discriminants are part of the public contract and must never change.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Row or key does not exist
    NotFound = 1,

    /// Primary key already exists
    DuplicateKey = 2,

    /// An index rejected a key that should have been unique
    UniqueConstraintViolation = 3,

    /// Row arity does not match the schema
    ColumnMismatch = 4,

    /// Row image exceeds the configured row byte budget
    RowBytesExceeded = 5,

    /// Value does not fit the column type
    InvalidDataType = 6,

    /// No descriptor file at the given path
    TableNotFound = 7,

    /// Unknown index name
    IndexNotFound = 8,

    /// Storage read failed
    StorageReadError = 9,

    /// Storage write failed
    StorageWriteError = 10,

    /// Storage delete failed
    StorageDeleteError = 11,

    /// Writer latch could not be acquired in time
    LockTimeout = 12,

    /// Transaction could not commit
    TransactionFailed = 13,

    /// Transactional operation outside a transaction
    TransactionNotStarted = 14,

    /// Operation not valid for this storage or table state
    InvalidOperation = 15,

    /// Anything else
    InternalError = 16,
}

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// Invalid or unparsable storage format version
    InvalidVersion(u16),

    /// Row or key does not exist
    NotFound,

    /// Primary key already exists; carries the offending row
    DuplicateKey(Box<Row>),

    /// An index rejected a key that should have been unique
    UniqueConstraintViolation(String),

    /// Row arity does not match the schema (expected, got)
    ColumnMismatch {
        /// Schema arity
        expected: usize,
        /// Row arity
        got: usize,
    },

    /// Row image exceeds the configured row byte budget (limit, got)
    RowBytesExceeded {
        /// Configured budget in bytes
        limit: usize,
        /// Actual image length in bytes
        got: usize,
    },

    /// Value does not fit the column type
    InvalidDataType(String),

    /// No descriptor file at the given path
    TableNotFound(String),

    /// Unknown index name
    IndexNotFound(String),

    /// Storage read failed
    StorageRead(String),

    /// Storage write failed
    StorageWrite(String),

    /// Storage delete failed
    StorageDelete(String),

    /// Writer latch could not be acquired in time
    LockTimeout,

    /// Transaction could not commit
    TransactionFailed(String),

    /// Transactional operation outside a transaction
    TransactionNotStarted,

    /// Operation not valid for this storage or table state
    InvalidOperation(String),

    /// Anything else
    Internal(String),
}

impl Error {
    /// Returns the stable numeric code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::NotFound,
            Self::DuplicateKey(_) => ErrorCode::DuplicateKey,
            Self::UniqueConstraintViolation(_) => ErrorCode::UniqueConstraintViolation,
            Self::ColumnMismatch { .. } => ErrorCode::ColumnMismatch,
            Self::RowBytesExceeded { .. } => ErrorCode::RowBytesExceeded,
            Self::InvalidDataType(_) => ErrorCode::InvalidDataType,
            Self::TableNotFound(_) => ErrorCode::TableNotFound,
            Self::IndexNotFound(_) => ErrorCode::IndexNotFound,
            Self::StorageRead(_) | Self::Decode(_) | Self::Decompress(_) => {
                ErrorCode::StorageReadError
            }
            Self::StorageWrite(_) | Self::Encode(_) => ErrorCode::StorageWriteError,
            Self::StorageDelete(_) => ErrorCode::StorageDeleteError,
            Self::LockTimeout => ErrorCode::LockTimeout,
            Self::TransactionFailed(_) => ErrorCode::TransactionFailed,
            Self::TransactionNotStarted => ErrorCode::TransactionNotStarted,
            Self::InvalidOperation(_) | Self::InvalidVersion(_) => ErrorCode::InvalidOperation,
            Self::Io(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FlintDbError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(1, ErrorCode::NotFound as u16);
        assert_eq!(2, ErrorCode::DuplicateKey as u16);
        assert_eq!(8, ErrorCode::IndexNotFound as u16);
        assert_eq!(12, ErrorCode::LockTimeout as u16);
        assert_eq!(16, ErrorCode::InternalError as u16);
    }

    #[test]
    fn error_maps_to_code() {
        assert_eq!(ErrorCode::LockTimeout, Error::LockTimeout.code());
        assert_eq!(
            ErrorCode::RowBytesExceeded,
            Error::RowBytesExceeded { limit: 16, got: 17 }.code()
        );
        assert_eq!(
            ErrorCode::StorageReadError,
            Error::StorageRead("torn chain".into()).code()
        );
    }
}
