//! Error types for kinet-orchestrator

use thiserror::Error;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error type for orchestrator operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Topology error: {0}")]
    Topology(#[from] kinet_core::TopologyError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an orchestration error
    pub fn orchestration(msg: impl Into<String>) -> Self {
        Self::Orchestration(msg.into())
    }
}
