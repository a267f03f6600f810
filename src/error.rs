//! WolfMaster Error Types

use thiserror::Error;

/// Result type alias for WolfMaster operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMaster error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Membership errors
    #[error("Node is not a cluster member: {0}")]
    InvalidNode(String),

    // Region errors
    #[error("Invalid configuration for region {region}: {reason}")]
    UnknownRegionConfig { region: String, reason: String },

    #[error("Region not found: {0}")]
    UnknownRegion(String),

    // Role store errors
    #[error("Role store unavailable: {0}")]
    StoreUnavailable(String),

    /// A concurrent bootstrap election committed first. Handled inside the
    /// coordinator by re-reading the committed record.
    #[error("Election for device {0} was won by another node")]
    ElectionRaceResolved(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Network(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreUnavailable(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::StoreUnavailable("down".into()).is_retryable());
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::InvalidNode("node-9".into()).is_retryable());
        assert!(!Error::ElectionRaceResolved("of:0001".into()).is_retryable());
    }

    #[test]
    fn test_sqlite_error_maps_to_unavailable() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }
}
