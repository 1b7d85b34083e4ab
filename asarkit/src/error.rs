use std::io;
use std::num;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AsarError>;

#[derive(Error, Debug)]
pub enum AsarError {
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("int conversion error: {0}")]
    TryFromIntError(#[from] num::TryFromIntError),
    #[error("invalid archive format: {0}")]
    FormatError(String),
    #[error("failed to find file entry '{0}'")]
    EntryNotFound(String),
    #[error("no content provided for packed entry '{0}'")]
    MissingEntry(String),
    #[error("integrity mismatch for entry '{0}'")]
    IntegrityMismatch(String),
}

impl AsarError {
    pub fn format_error(msg: impl Into<String>) -> Self {
        Self::FormatError(msg.into())
    }
}
