use thiserror::Error;

/// Common error type for QuerySight components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid duration {input:?}: {reason}")]
    Duration { input: String, reason: String },
}

impl Error {
    pub(crate) fn duration(input: &str, reason: impl Into<String>) -> Self {
        Error::Duration {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using QuerySight's Error.
pub type Result<T> = std::result::Result<T, Error>;
