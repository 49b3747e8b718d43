use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TraderError {
    /// Bad order parameters or unknown exchange/account; rejected before any
    /// exchange contact is made.
    #[error("Validation Error: {0}")]
    Validation(String),

    /// Market-data feed problems (connection drop, malformed message).
    /// Retried internally by the feed adapter; callers only ever see these
    /// in logs.
    #[error("Feed Error: {0}")]
    Feed(String),

    /// An exchange rejected a call or the call never reached it.
    #[error("Exchange Error: {0}")]
    Exchange(String),

    /// Failure while driving an execution session.
    #[error("Execution Error: {0}")]
    Execution(String),

    /// Account balance too low for the requested order.
    #[error("Insufficient Balance: {0}")]
    InsufficientBalance(String),

    /// Order-history store failures.
    #[error("Persistence Error: {0}")]
    Persistence(String),

    /// Parsing errors for feed or exchange payloads.
    #[error("Parse Error: {0}")]
    ParseError(String),

    /// Configuration errors
    #[error("Config Error: {0}")]
    ConfigError(String),

    /// Unknown/unclassified errors
    #[error("Unknown Error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for TraderError {
    fn from(err: serde_json::Error) -> Self {
        TraderError::ParseError(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<rusqlite::Error> for TraderError {
    fn from(err: rusqlite::Error) -> Self {
        TraderError::Persistence(format!("SQLite error: {}", err))
    }
}

impl From<anyhow::Error> for TraderError {
    fn from(err: anyhow::Error) -> Self {
        TraderError::Unknown(format!("{}", err))
    }
}

impl TraderError {
    /// Determines if an error is recoverable through retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            TraderError::Validation(_) => false,
            TraderError::Feed(_) => true,
            TraderError::Exchange(_) => true,
            TraderError::Execution(_) => true,
            TraderError::InsufficientBalance(_) => false,
            TraderError::Persistence(_) => true,
            TraderError::ParseError(_) => false,
            TraderError::ConfigError(_) => false,
            TraderError::Unknown(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TraderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_recoverable() {
        assert!(!TraderError::Validation("bad size".into()).is_recoverable());
        assert!(TraderError::Feed("ws dropped".into()).is_recoverable());
        assert!(TraderError::Exchange("503".into()).is_recoverable());
    }
}
