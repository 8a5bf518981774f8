//! Error types for shopsync-core
//!
//! One error hierarchy for the whole core. Most variants never reach the UI:
//! batch and preload paths capture them per item, the push channel turns
//! transport errors into state transitions, and storage corruption is
//! recovered by resetting to empty.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for shopsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    // ===================
    // Network Errors
    // ===================
    #[error("Request to {url} failed: {message}")]
    NetworkFailure {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    // ===================
    // Push Channel Errors
    // ===================
    #[error("Push channel transport error: {message}")]
    TransportError { message: String },

    #[error("Push channel is shut down")]
    ChannelClosed,

    // ===================
    // Payload Errors
    // ===================
    #[error("Malformed payload from {source_name}: {message}")]
    MalformedPayload {
        source_name: String,
        message: String,
    },

    // ===================
    // Storage Errors
    // ===================
    #[error("Stored value for '{key}' is corrupted: {message}")]
    StorageCorruption { key: String, message: String },

    #[error("Storage I/O failed at {path}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl SyncError {
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::NetworkFailure {
            url: url.into(),
            status: None,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::TransportError {
            message: message.into(),
        }
    }

    pub fn malformed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::MalformedPayload {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable tag, used in logs and batch results
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::NetworkFailure { .. } => "network_failure",
            SyncError::Timeout { .. } => "timeout",
            SyncError::TransportError { .. } => "transport_error",
            SyncError::ChannelClosed => "channel_closed",
            SyncError::MalformedPayload { .. } => "malformed_payload",
            SyncError::StorageCorruption { .. } => "storage_corruption",
            SyncError::Storage { .. } => "storage",
            SyncError::InvalidConfig { .. } => "invalid_config",
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkFailure { .. }
                | SyncError::Timeout { .. }
                | SyncError::TransportError { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
