//! Error types for the snapshot replication subsystem.

use thiserror::Error;

/// Errors that can occur while planning, transferring or pruning snapshots.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed or inconsistent job declaration.
    #[error("configuration error: {msg}")]
    Configuration {
        /// Description of the offending declaration.
        msg: String,
    },

    /// A required external tool could not be located.
    #[error("required tool not found: {tool}")]
    ToolUnavailable {
        /// Name of the missing tool.
        tool: String,
    },

    /// An external operation failed or exited with non-zero status.
    #[error("{op} failed: {detail}")]
    Transfer {
        /// The operation that failed (send, receive, delete, ...).
        op: String,
        /// Exit status or spawn error.
        detail: String,
    },

    /// The remote gate refused the requested operation.
    #[error("remote refused {op} for {path}")]
    Authorization {
        /// The refused operation.
        op: String,
        /// The path the operation targeted.
        path: String,
    },

    /// Execution was interrupted from outside.
    #[error("interrupted: {reason}")]
    Interrupted {
        /// What requested the interruption.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for the replication subsystem.
pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        VaultError::Configuration { msg: msg.into() }
    }

    /// Shorthand for a failed external operation.
    pub fn transfer(op: impl Into<String>, detail: impl Into<String>) -> Self {
        VaultError::Transfer {
            op: op.into(),
            detail: detail.into(),
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            VaultError::Configuration { .. } => 2,
            VaultError::ToolUnavailable { .. } => 3,
            VaultError::Interrupted { .. } => 130,
            VaultError::Transfer { .. } | VaultError::Authorization { .. } | VaultError::Io(_) => 1,
        }
    }

    /// True when the error came from an external interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, VaultError::Interrupted { .. })
    }
}
