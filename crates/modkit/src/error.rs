//! Error types for the mod management core with context and classification

use std::path::PathBuf;
use thiserror::Error;

/// Comprehensive error type shared by every component of the SDK
#[derive(Error, Debug)]
pub enum ModError {
    /// HTTP-level failures from the catalog or transfer transport
    #[error("HTTP request to '{url}' failed")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// File system I/O errors with file context
    #[error("File operation failed on '{path}' while {operation}")]
    Io {
        path: PathBuf,
        operation: FileOperation,
        #[source]
        source: std::io::Error,
    },

    /// Not enough free space for the bytes a job is about to write
    #[error("Insufficient disk space at '{path}': need {required} bytes, available {available} bytes")]
    InsufficientSpace {
        required: u64,
        available: u64,
        path: PathBuf,
    },

    /// Downloaded artifact does not match its published checksum
    #[error("Corrupt artifact '{path}': expected digest {expected}, got {actual}")]
    CorruptArtifact {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Session could not be established or became invalid mid-flight
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Archive engine refused or failed to extract an artifact
    #[error("Archive extraction failed for '{path}': {reason}")]
    Archive { path: PathBuf, reason: String },

    /// Registry persistence problems (serialization, inconsistent state)
    #[error("Registry error: {0}")]
    Registry(String),

    /// URL that the transport cannot handle
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Operation stopped at a cancellation checkpoint
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Paid mod without a matching entitlement for the session user
    #[error("Mod '{mod_id}' is paid content and user '{user}' holds no entitlement")]
    NotEntitled { mod_id: String, user: String },

    /// Reference to a mod the catalog never described
    #[error("Unknown mod '{0}'")]
    UnknownMod(String),

    /// Operation requires mod management to be enabled first
    #[error("Mod management is not enabled")]
    ManagementDisabled,
}

/// Types of file operations for error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Delete,
    Rename,
    Metadata,
    CreateDir,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Read => write!(f, "reading"),
            FileOperation::Write => write!(f, "writing"),
            FileOperation::Create => write!(f, "creating"),
            FileOperation::Delete => write!(f, "deleting"),
            FileOperation::Rename => write!(f, "renaming"),
            FileOperation::Metadata => write!(f, "reading metadata"),
            FileOperation::CreateDir => write!(f, "creating directory"),
        }
    }
}

/// Failure classification carried by lifecycle events so hosts can render
/// "not enough space" differently from "failed to download"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Space,
    Corruption,
    Io,
    Network,
    Auth,
    Cancelled,
    Other,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Space => write!(f, "insufficient space"),
            FailureKind::Corruption => write!(f, "corrupt artifact"),
            FailureKind::Io => write!(f, "I/O failure"),
            FailureKind::Network => write!(f, "network failure"),
            FailureKind::Auth => write!(f, "authentication failure"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Other => write!(f, "failure"),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModError>;

impl ModError {
    /// Classify the error for event reporting
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ModError::Network { .. } => FailureKind::Network,
            ModError::Io { .. } => FailureKind::Io,
            ModError::InsufficientSpace { .. } => FailureKind::Space,
            ModError::CorruptArtifact { .. } => FailureKind::Corruption,
            ModError::Authentication(_) => FailureKind::Auth,
            ModError::Archive { .. } => FailureKind::Corruption,
            ModError::Cancelled { .. } => FailureKind::Cancelled,
            ModError::Registry(_)
            | ModError::InvalidUrl { .. }
            | ModError::NotEntitled { .. }
            | ModError::UnknownMod(_)
            | ModError::ManagementDisabled => FailureKind::Other,
        }
    }

    /// Check whether a later reconciliation pass may reasonably re-derive
    /// and re-run the failed job
    pub fn is_recoverable(&self) -> bool {
        match self {
            ModError::Network { .. } => true,
            ModError::InsufficientSpace { .. } => true,
            ModError::CorruptArtifact { .. } => true,
            ModError::Cancelled { .. } => true,
            ModError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            ModError::Authentication(_) => false,
            ModError::Archive { .. } => false,
            ModError::Registry(_) => false,
            ModError::InvalidUrl { .. } => false,
            ModError::NotEntitled { .. } => false,
            ModError::UnknownMod(_) => false,
            ModError::ManagementDisabled => false,
        }
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            ModError::Network { .. } => "network",
            ModError::Io { .. } => "io",
            ModError::InsufficientSpace { .. } => "insufficient_space",
            ModError::CorruptArtifact { .. } => "corrupt_artifact",
            ModError::Authentication(_) => "authentication",
            ModError::Archive { .. } => "archive",
            ModError::Registry(_) => "registry",
            ModError::InvalidUrl { .. } => "invalid_url",
            ModError::Cancelled { .. } => "cancelled",
            ModError::NotEntitled { .. } => "not_entitled",
            ModError::UnknownMod(_) => "unknown_mod",
            ModError::ManagementDisabled => "management_disabled",
        }
    }

    /// Attach path context to a raw I/O error
    pub fn io(path: impl Into<PathBuf>, operation: FileOperation, source: std::io::Error) -> Self {
        ModError::Io {
            path: path.into(),
            operation,
            source,
        }
    }
}

impl From<reqwest::Error> for ModError {
    fn from(error: reqwest::Error) -> Self {
        let url = error
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        ModError::Network { url, source: error }
    }
}

impl From<serde_json::Error> for ModError {
    fn from(error: serde_json::Error) -> Self {
        ModError::Registry(format!("serialization failed: {error}"))
    }
}
