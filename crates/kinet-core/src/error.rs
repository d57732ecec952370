//! Error types for topology loading

use thiserror::Error;

/// Core result type
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Errors raised while loading the static topology configuration.
///
/// All of these are fatal at startup; the decision loops never see them.
#[derive(Error, Debug)]
pub enum TopologyError {
    /// IO error while reading the config file
    #[error("failed to read topology config: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("failed to parse topology config: {0}")]
    Json(#[from] serde_json::Error),

    /// AP position string that does not parse as "x,y[,z]"
    #[error("access point {ap} has malformed position '{position}'")]
    MalformedPosition { ap: u32, position: String },

    /// Topology without any access points
    #[error("topology defines no access points")]
    NoAccessPoints,
}

impl TopologyError {
    /// Create a malformed-position error
    pub fn malformed_position(ap: u32, position: impl Into<String>) -> Self {
        Self::MalformedPosition {
            ap,
            position: position.into(),
        }
    }
}
