use thiserror::Error;

/// Top-level error type for the consensus core.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// RPC transport errors. Never fatal: the worker drops them and the
/// coordinator retries on its next scheduled task.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Target node {0} not found")]
    NodeNotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Local storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
