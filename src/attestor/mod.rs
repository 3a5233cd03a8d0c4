//! Attestation primitive abstraction.
//!
//! The `Attestor` trait is the seam to the platform's hardware-backed key
//! store (Secure Enclave, TPM, Android Keystore). Implementations:
//! - `SoftwareAttestor`: in-memory Ed25519 keys for development servers and tests

pub mod software;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use software::SoftwareAttestor;

/// Opaque identifier of a hardware-backed keypair, issued by the attestor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for KeyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hardware attestation capability set.
///
/// `client_data_hash` is always a 32-byte SHA-256 digest computed by the
/// caller; implementations sign or attest over it verbatim.
#[async_trait]
pub trait Attestor: Send + Sync {
    /// Whether the platform can generate attested keys at all.
    fn is_supported(&self) -> bool;

    /// Generate a fresh keypair and return its handle.
    async fn generate_key(&self) -> Result<KeyId>;

    /// Produce an attestation statement binding `key_id` to `client_data_hash`.
    async fn attest_key(&self, key_id: &KeyId, client_data_hash: &[u8]) -> Result<Vec<u8>>;

    /// Sign `client_data_hash` with an already attested key.
    async fn generate_assertion(&self, key_id: &KeyId, client_data_hash: &[u8]) -> Result<Vec<u8>>;
}
