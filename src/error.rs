use thiserror::Error;

#[derive(Error, Debug)]
pub enum GossipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Keyring requires at least one key")]
    EmptyKeyring,

    #[error("Keyring keys must be {expected} bytes, got {actual}")]
    BadKeyLength { expected: usize, actual: usize },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Datagram failed verification against all keyring keys")]
    FailedVerification,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, GossipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GossipError::Configuration("ack_timeout must be less than protocol_period".into());
        assert!(err.to_string().contains("Configuration error"));

        let err = GossipError::BadKeyLength {
            expected: 32,
            actual: 16,
        };
        assert!(err.to_string().contains("32"));
        assert!(err.to_string().contains("16"));
    }
}
