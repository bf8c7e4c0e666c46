//! Error taxonomy shared by the sync engine.
//!
//! [`SyncError`] is `Clone` because coalesced operations (status probes,
//! orchestrator runs) hand the same result to every waiter.

use crate::rpc::RpcError;
use crate::sandbox::ProviderError;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Malformed input, rejected before any side effect.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Full replace would blank out too many files.
    #[error(
        "refusing to overwrite project: {empty} of {total} files would be empty ({})",
        .paths.join(", ")
    )]
    DangerousOverwrite {
        paths: Vec<String>,
        empty: usize,
        total: usize,
    },

    /// Partial merge carried empty content. Deletions go through a dedicated path.
    #[error(
        "empty content is not allowed in a partial update, use the delete operation instead ({})",
        .paths.join(", ")
    )]
    EmptyContent { paths: Vec<String> },

    /// Unknown project, version or session, or one owned by someone else.
    #[error("{0} not found")]
    NotFound(String),

    #[error("timed out: {0}")]
    RemoteTimeout(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("sandbox provider unreachable: {0}")]
    TransientProvider(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// HTTP status a route handler should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::DangerousOverwrite { .. } | Self::EmptyContent { .. } => {
                400
            }
            Self::NotFound(_) => 404,
            Self::RemoteTimeout(_) => 504,
            Self::Remote(_) | Self::TransientProvider(_) => 502,
            Self::Storage(_) => 500,
        }
    }

    /// Paths a caller has to fix before retrying, if the error names any.
    pub fn offending_paths(&self) -> &[String] {
        match self {
            Self::DangerousOverwrite { paths, .. } | Self::EmptyContent { paths } => paths,
            _ => &[],
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("corrupt stored JSON: {e}"))
    }
}

impl From<ProviderError> for SyncError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(what) => Self::NotFound(what),
            ProviderError::Transient(msg) => Self::TransientProvider(msg),
            ProviderError::Timeout(msg) => Self::RemoteTimeout(msg),
            other @ ProviderError::Api { .. } => Self::Remote(other.to_string()),
        }
    }
}

impl From<RpcError> for SyncError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Timeout { .. } => Self::RemoteTimeout(e.to_string()),
            RpcError::Remote(msg) => Self::Remote(msg),
            RpcError::Transport(msg) | RpcError::Decode(msg) => Self::Remote(msg),
        }
    }
}
