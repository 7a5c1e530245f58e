use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The builder rejected the credential. Retrying cannot succeed.
    #[error("You are unauthorized to use this builder")]
    Unauthorized,

    #[error("Invalid remote builder address '{address}': {message}")]
    InvalidTarget { address: String, message: String },

    #[error("Failed to start tunnel session: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Tunnel connection failed: {0}")]
    Connection(String),

    #[error("Daemon health probe did not answer within {0:?}")]
    ProbeTimeout(Duration),

    #[error("Could not ping remote builder within {} minutes, aborting", .0.as_secs() / 60)]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TunnelError::Unauthorized | TunnelError::InvalidTarget { .. })
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_is_not_retryable() {
        assert!(!TunnelError::Unauthorized.is_retryable());
        assert!(TunnelError::Connection("connection refused".into()).is_retryable());
        assert!(TunnelError::ProbeTimeout(Duration::from_secs(5)).is_retryable());
    }

    #[test]
    fn test_timeout_message() {
        let err = TunnelError::Timeout(Duration::from_secs(300));
        assert_eq!(
            err.to_string(),
            "Could not ping remote builder within 5 minutes, aborting"
        );
    }
}
