use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PreloadError {
    #[error("invalid data id: {0}")]
    InvalidIdentifier(String),

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid preload parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("remote returned status {status}: {message}")]
    TransportStatus { status: u16, message: String },

    #[error("failed to extract {archive}: {reason}")]
    Extraction { archive: String, reason: String },

    #[error("failed to convert {leaf}: {reason}")]
    Conversion { leaf: String, reason: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("dataset not found in cache: {0}")]
    NotFound(String),

    #[error("preload worker failed: {0}")]
    Worker(String),

    #[error("preload has been cancelled")]
    Cancelled,
}

impl PreloadError {
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PreloadError::Transport(_) | PreloadError::TransportStatus { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PreloadError::Cancelled)
    }
}
