//! Error types for the CoolaData SDK.

/// Errors returned to callers of the SDK.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP client could not be created or a request failed outright.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// `track` was called before `setup`.
    #[error("setup(api_token) must be called before tracking events")]
    SetupRequired,

    /// The event violates a tracking precondition.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The key/value store rejected a read or write.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Client has been shutdown.
    #[error("Client has been shutdown")]
    Shutdown,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by a [`Transport`](crate::Transport) for one request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No HTTP response was received.
    #[error("network failure: {message}")]
    Network {
        /// Description of the connection failure
        message: String,
    },

    /// The server answered with a non-success status.
    #[error("{code} {description}")]
    Status {
        /// HTTP status code
        code: u16,
        /// Reason phrase or response body
        description: String,
    },

    /// No response arrived within the publish interval.
    #[error("408 Request Timeout")]
    Timeout,
}

impl TransportError {
    /// Status code handed to delivery callbacks.
    ///
    /// Network failures have no HTTP status and report `0`.
    pub fn status_code(&self) -> u16 {
        match self {
            TransportError::Network { .. } => 0,
            TransportError::Status { code, .. } => *code,
            TransportError::Timeout => 408,
        }
    }

    /// Human-readable description handed to delivery callbacks.
    pub fn description(&self) -> String {
        match self {
            TransportError::Network { message } => message.clone(),
            TransportError::Status { description, .. } => description.clone(),
            TransportError::Timeout => "Request Timeout".into(),
        }
    }

    /// Whether the API token was refused.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Status {
                code: 401 | 403,
                ..
            }
        )
    }
}
