use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures raised by SDK checks and SDK-mutating operations.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("managed Cloud SDK is not supported on this platform: {0}")]
    UnsupportedPlatform(String),

    /// The installation exists but could not be verified.
    #[error("unable to verify managed Cloud SDK: {0}")]
    Verification(String),

    #[error("managed Cloud SDK version mismatch: {0}")]
    VersionMismatch(String),

    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("download failed: {0}")]
    Download(String),

    #[error("Cloud SDK not found at {}", .0.display())]
    NotInstalled(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("unexpected SDK output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("job panicked: {0}")]
    Panicked(String),
}

impl SdkError {
    pub fn command(command: impl Into<String>, detail: impl Into<String>) -> Self {
        SdkError::Command {
            command: command.into(),
            detail: detail.into(),
        }
    }

    /// Status-check failures that mean "reinstall" rather than "give up".
    pub fn is_recoverable_check(&self) -> bool {
        matches!(self, SdkError::Verification(_) | SdkError::VersionMismatch(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SdkError::Cancelled)
    }
}
