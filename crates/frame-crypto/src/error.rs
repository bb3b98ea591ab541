use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid key length for {algorithm}: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        algorithm: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid iv length for {algorithm}: expected {expected} bytes, got {actual}")]
    InvalidIv {
        algorithm: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("header authentication failed for key {0}")]
    HeaderAuthentication(String),

    #[error("{algorithm} {operation} failed")]
    Cipher {
        algorithm: &'static str,
        operation: &'static str,
    },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl CryptoError {
    pub(crate) fn encrypt_failed(algorithm: &'static str) -> Self {
        Self::Cipher {
            algorithm,
            operation: "encryption",
        }
    }

    pub(crate) fn decrypt_failed(algorithm: &'static str) -> Self {
        Self::Cipher {
            algorithm,
            operation: "decryption",
        }
    }
}
