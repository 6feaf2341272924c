//! Result and error types for the test host.

use thiserror::Error;

/// Result type for test host operations
pub type TestHostResult<T> = Result<T, TestHostError>;

/// Errors that can occur in the test host
#[derive(Debug, Error)]
pub enum TestHostError {
    /// Invalid or inconsistent settings
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Malformed control-protocol traffic
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message
        message: String,
    },

    /// The controller channel is gone
    #[error("Communication channel closed")]
    ChannelClosed,

    /// A session with the same source is already scheduled
    #[error("Session for source {source_id} already exists")]
    DuplicateSession {
        /// Source identifier
        source_id: String,
    },

    /// No session is registered for the source
    #[error("No session for source {source_id}")]
    UnknownSession {
        /// Source identifier
        source_id: String,
    },

    /// Coverage instrumentation could not be used
    #[error("Coverage unavailable: {message}")]
    Coverage {
        /// Error message
        message: String,
    },

    /// Test framework adapter error
    #[error("Test framework error: {message}")]
    Framework {
        /// Error message
        message: String,
    },

    /// Operation called in the wrong state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TestHostError {
    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a coverage error
    #[must_use]
    pub fn coverage(message: impl Into<String>) -> Self {
        Self::Coverage {
            message: message.into(),
        }
    }

    /// Create a framework error
    #[must_use]
    pub fn framework(message: impl Into<String>) -> Self {
        Self::Framework {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
}

/// Fault raised by a session's unit of work.
///
/// This is the single value type the isolation boundary hands to a session's
/// error callback, whatever the job did wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job returned an error
    #[error("job failed: {message}")]
    Failed {
        /// Error message
        message: String,
    },

    /// The job panicked while running
    #[error("job panicked: {message}")]
    Panicked {
        /// Panic payload rendered as text
        message: String,
    },

    /// The isolation boundary itself could not be set up
    #[error("isolation boundary unavailable: {message}")]
    Isolation {
        /// Error message
        message: String,
    },

    /// The test framework adapter reported a failure
    #[error("test framework failed: {message}")]
    Framework {
        /// Error message
        message: String,
    },
}

impl JobError {
    /// Create a failure
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Create a framework failure
    #[must_use]
    pub fn framework(message: impl Into<String>) -> Self {
        Self::Framework {
            message: message.into(),
        }
    }

    /// Build a panic error from a `catch_unwind` payload
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked { message }
    }
}

impl From<TestHostError> for JobError {
    fn from(err: TestHostError) -> Self {
        match err {
            TestHostError::Framework { message } => Self::Framework { message },
            other => Self::Failed {
                message: other.to_string(),
            },
        }
    }
}
