//! Error types for attestation and request signing
//!
//! Errors fan out to every caller waiting on a shared key registration, so
//! `AttestError` is `Clone` and carries foreign failures as strings.

use thiserror::Error;

/// Attestation error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttestError {
    /// No attestation support on this device and no bypass secret configured
    #[error("Attestation not supported on this device")]
    NotSupported,

    /// Unexpected or unparseable server or local response
    #[error("Internal error: {0}")]
    Internal(String),

    /// Server rejected the attestation for policy reasons
    #[error("Server policy violation")]
    PolicyViolation,

    /// Server rejected a stale or incorrect nonce
    #[error("Nonce mismatch")]
    NonceMismatch,

    /// Server no longer recognizes the key
    #[error("Invalid key")]
    InvalidKey,

    /// Request already carries reserved `Dreiattest-*` headers
    #[error("Request contains reserved Dreiattest headers")]
    IllegalHeaders,

    /// HTTP transport failed
    #[error("Network error: {0}")]
    Network(String),

    /// The attestation primitive failed
    #[error("Attestation primitive error: {0}")]
    Attestation(String),

    /// Persistent store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queued registration dropped because its manager shut down
    #[error("Key registration cancelled")]
    Cancelled,
}

/// Server error codes understood by the client, in lookup order.
///
/// Unknown codes map to [`AttestError::Internal`]. The nonce mismatch code
/// is reported as a policy violation, matching the server's behaviour.
pub const SERVER_ERROR_CODES: &[(&str, ServerErrorKind)] = &[
    ("dreiAttest_policy_violation", ServerErrorKind::PolicyViolation),
    ("dreiAttest_nonce_mismatch", ServerErrorKind::PolicyViolation),
    ("dreiAttest_invalid_key", ServerErrorKind::InvalidKey),
];

/// Error kinds a server error code can resolve to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    PolicyViolation,
    /// Reserved; the server's nonce-mismatch code currently maps to `PolicyViolation`
    NonceMismatch,
    InvalidKey,
}

impl From<ServerErrorKind> for AttestError {
    fn from(kind: ServerErrorKind) -> Self {
        match kind {
            ServerErrorKind::PolicyViolation => AttestError::PolicyViolation,
            ServerErrorKind::NonceMismatch => AttestError::NonceMismatch,
            ServerErrorKind::InvalidKey => AttestError::InvalidKey,
        }
    }
}

impl AttestError {
    /// Map a server error code (body or `Dreiattest-Error` header) to an error.
    pub fn from_server_code(code: &str) -> Self {
        let code = code.trim();
        SERVER_ERROR_CODES
            .iter()
            .find(|(known, _)| *known == code)
            .map(|(_, kind)| AttestError::from(*kind))
            .unwrap_or_else(|| {
                AttestError::Internal(format!("unknown server error code: {}", code))
            })
    }

    /// Whether this is the server telling us the key is gone.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, AttestError::InvalidKey)
    }
}

impl From<reqwest::Error> for AttestError {
    fn from(err: reqwest::Error) -> Self {
        AttestError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for AttestError {
    fn from(err: serde_json::Error) -> Self {
        AttestError::Internal(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for AttestError {
    fn from(err: std::io::Error) -> Self {
        AttestError::Store(err.to_string())
    }
}

/// Result type for attestation operations
pub type Result<T> = std::result::Result<T, AttestError>;
