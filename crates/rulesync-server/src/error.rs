//! Server error types.

use thiserror::Error;

use rulesync_bus::Error as BusError;

/// Server errors.
///
/// The bus variants abort hub construction; once a hub is running, failures
/// are logged rather than returned.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The bus could not be reached.
    #[error("failed to dial {dsn}: {source}")]
    Dial {
        dsn: String,
        #[source]
        source: BusError,
    },

    /// A channel could not be opened on the connection.
    #[error("failed to open channel: {0}")]
    OpenChannel(#[source] BusError),

    #[error("failed to declare exchange '{exchange}': {source}")]
    DeclareExchange {
        exchange: String,
        #[source]
        source: BusError,
    },

    #[error("failed to declare queue '{queue}': {source}")]
    DeclareQueue {
        queue: String,
        #[source]
        source: BusError,
    },

    #[error("failed to bind queue '{queue}' to exchange '{exchange}': {source}")]
    BindQueue {
        queue: String,
        exchange: String,
        #[source]
        source: BusError,
    },

    #[error("failed to consume queue '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: BusError,
    },

    /// Malformed console command.
    #[error("invalid command: {0}")]
    Command(String),

    /// The setup task ended without reporting success or failure.
    #[error("hub setup task exited without reporting a result")]
    SetupAborted,

    /// JSON error while reading configuration or rules.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_setup_errors_keep_bus_source() {
        let err = Error::BindQueue {
            queue: "replica".to_string(),
            exchange: "rules".to_string(),
            source: BusError::NotFound("exchange 'rules'".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "failed to bind queue 'replica' to exchange 'rules': not found: exchange 'rules'"
        );
        assert!(matches!(
            err.source().and_then(|s| s.downcast_ref::<BusError>()),
            Some(BusError::NotFound(_))
        ));
    }
}
