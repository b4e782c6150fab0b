//! Error types for the dispatcher crate.

use std::path::PathBuf;

use tokio::task::JoinError;

/// Why a background evaluation produced no output.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Background evaluation panicked: {0}")]
    Panicked(String),
    #[error("Background evaluation cancelled")]
    Cancelled,
}

impl From<JoinError> for JobError {
    fn from(err: JoinError) -> Self {
        if !err.is_panic() {
            return Self::Cancelled;
        }
        let payload = err.into_panic();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

/// Error returned by [`crate::DispatcherHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatcher service is closed")]
    Closed,
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for '{field}': {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
