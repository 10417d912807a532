use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to open connection: {0}")]
    Open(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Failed to close connection: {0}")]
    Close(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Gateway already disposed")]
    Disposed,
}

impl GatewayError {
    /// Cancellation is an outcome of its own, not a driver failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinct() {
        assert!(GatewayError::Cancelled.is_cancelled());
        assert!(!GatewayError::Open("refused".into()).is_cancelled());
    }
}
