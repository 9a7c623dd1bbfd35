//! Error types for tabsync-core operations.
//!
//! Nothing here is fatal to the host process. Transport and REST failures are
//! recoverable and self-heal on the next refresh or reconnect; integrity and
//! configuration failures are rejected at the boundary with a message the
//! user can act on.

use std::path::PathBuf;

use tabsync_protocol::ErrorInfo;

/// All errors that can occur in tabsync-core operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ─────────────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Not connected to the remote service")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost before {0} was acknowledged")]
    ConnectionLost(String),

    // ─────────────────────────────────────────────────────────────────────
    // REST Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Request failed: {context}: {source}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Remote service rejected {operation}: {code}: {message}")]
    Remote {
        operation: String,
        code: String,
        message: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Data Integrity Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid tab: {0}")]
    InvalidTab(String),

    #[error("Cannot resolve a document id for {url}; refresh the context and retry")]
    UnresolvedDocument { url: String },

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("No active context is bound")]
    NoActiveContext,

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid connection settings: {field}: {reason}")]
    InvalidSettings { field: &'static str, reason: String },

    #[error("Settings file malformed: {path}: {details}")]
    SettingsFile { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Collaborator Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Tab control failed: {0}")]
    TabControl(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),
}

impl SyncError {
    pub fn remote(operation: &str, info: ErrorInfo) -> Self {
        SyncError::Remote {
            operation: operation.to_string(),
            code: info.code,
            message: info.message,
        }
    }

    pub fn invalid_settings(field: &'static str, reason: impl Into<String>) -> Self {
        SyncError::InvalidSettings {
            field,
            reason: reason.into(),
        }
    }

    /// Transport and REST failures drive retries; everything else needs a
    /// different input before trying again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::NotConnected
                | SyncError::ConnectionFailed(_)
                | SyncError::ConnectionLost(_)
                | SyncError::Http { .. }
                | SyncError::Remote { .. }
        )
    }
}

impl From<ErrorInfo> for SyncError {
    fn from(info: ErrorInfo) -> Self {
        SyncError::MalformedDocument(format!("{}: {}", info.code, info.message))
    }
}

/// Convenience type alias for Results using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<SyncError> for String {
    fn from(err: SyncError) -> String {
        err.to_string()
    }
}
