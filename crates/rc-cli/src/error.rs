use rc_dispatch::{ConfigError, DispatchError};

use crate::scenario::ScenarioError;

/// Error type for CLI commands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("Dispatcher task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Failed to write output: {0}")]
    Output(#[from] std::io::Error),
    #[error("Failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Usage(String),
    #[error("Performance budget exceeded")]
    BudgetExceeded,
}
