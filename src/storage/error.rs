// SPDX-License-Identifier: MIT

//! Storage engine error kinds, matching spec.md §7 exactly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// All buckets are full and a new bucket could not be created.
    #[error("storage full: no bucket could admit the record and bucket creation failed")]
    StorageFull,

    /// The handle references a slot that has since been freed.
    #[error("handle references a freed slot")]
    HandleStale,

    /// The handle references a bucket id that does not exist.
    #[error("handle references an unknown bucket")]
    HandleInvalid,

    /// A bucket file failed header validation on load.
    #[error("bucket file {path} failed header validation: {reason}")]
    StorageCorrupt { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
