use thiserror::Error;

/// Errors produced by the cache core.
///
/// Lookup misses, I/O failures, duplicate file identities, and the handful
/// of ways a checkpoint or a memory reservation can be refused.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("not found")]
    NotFound,

    #[error("I/O failed: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("duplicate file identity for {0}")]
    DuplicateFileid(String),

    #[error("checkpoint already in progress")]
    AlreadyExists,

    #[error("cache is shutting down")]
    ShuttingDown,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
