use std::path::PathBuf;

use thiserror::Error;

/// Conditions callers branch on. Everything else travels as plain `anyhow` context.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("internal error: will not overwrite existing queue item {0}")]
    DuplicateItem(String),

    #[error("queue item {0} not found in pending or archive")]
    ItemNotFound(String),

    #[error("sandboxed command exited with unexpected code {code} (policy {policy})")]
    UnexpectedExitCode { code: i32, policy: String },

    #[error("malformed status ledger {path}: {reason}")]
    MalformedLedger { path: PathBuf, reason: String },

    #[error("unparseable line {line_no} in result log {path}: {line:?}")]
    UnparseableResultLine { path: PathBuf, line_no: usize, line: String },

    #[error("result log {0} is empty and no known runner fault signature matched")]
    EmptyResultLog(PathBuf),

    #[error("cannot establish sandbox permission boundary on {path}: {reason}")]
    PermissionBoundary { path: PathBuf, reason: String },

    #[error("failed to copy sandbox input {source_path} -> {dest}: {reason}")]
    InputCopy { source_path: PathBuf, dest: PathBuf, reason: String },

    #[error("invalid queue record {key}: {reason}")]
    InvalidRecord { key: String, reason: String },
}

impl EngineError {
    /// Internal-consistency faults always go to the operator and are never retried blindly.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            EngineError::DuplicateItem(_)
                | EngineError::UnexpectedExitCode { .. }
                | EngineError::MalformedLedger { .. }
                | EngineError::UnparseableResultLine { .. }
                | EngineError::EmptyResultLog(_)
        )
    }
}
