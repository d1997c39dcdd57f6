//! Error handling for the capture pipeline
//!
//! This module defines the crate error type and a Result alias for use
//! throughout the library.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for capture operations
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The acquisition peer never accepted the control connection
    #[error("Could not reach acquisition peer at {path:?} after {attempts} attempts")]
    Connection { path: PathBuf, attempts: u32 },

    /// The peer sent an `error` line or a reply we do not understand
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command was issued without a live control session
    #[error("Not connected to acquisition peer")]
    NotConnected,

    /// Ring buffers need room for at least one element
    #[error("Ring buffer capacity must be at least 1")]
    InvalidCapacity,

    /// Errors related to configuration loading
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to starting or supervising a binner
    #[error("Binner error: {0}")]
    Binner(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket and signal errors reported by the OS
    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    /// Malformed configuration files
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<CaptureError>,
    },
}

impl CaptureError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CaptureError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error ends the current acquisition session.
    ///
    /// Protocol violations and transport failures are never retried; the
    /// pipeline tears the session down when it sees one.
    pub fn is_fatal(&self) -> bool {
        match self {
            CaptureError::Protocol(_)
            | CaptureError::Connection { .. }
            | CaptureError::Io(_)
            | CaptureError::Os(_) => true,
            CaptureError::WithContext { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Shorthand for a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        CaptureError::Protocol(message.into())
    }
}

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| CaptureError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| CaptureError::Io(e).with_context(f()))
    }
}
