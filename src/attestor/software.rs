//! Software attestor backed by in-memory Ed25519 keys.
//!
//! Keys never leave the process and vanish with it, so a server only
//! accepts these attestations when running in a development mode. The
//! attestor also records how often each capability was invoked, which the
//! test-suite uses to assert that bypass mode never touches it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Attestor, KeyId};
use crate::error::{AttestError, Result};

/// Ed25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

/// In-memory attestor.
///
/// - Key id: base64 of SHA-256 over the public key
/// - Attestation statement: `public_key || signature(client_data_hash)`
/// - Assertion: `signature(client_data_hash)`
pub struct SoftwareAttestor {
    keys: DashMap<KeyId, SigningKey>,
    supported: AtomicBool,
    fail_assertions: AtomicBool,
    generate_count: AtomicU32,
    attest_count: AtomicU32,
    assertion_count: AtomicU32,
}

impl SoftwareAttestor {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            supported: AtomicBool::new(true),
            fail_assertions: AtomicBool::new(false),
            generate_count: AtomicU32::new(0),
            attest_count: AtomicU32::new(0),
            assertion_count: AtomicU32::new(0),
        }
    }

    /// Report the platform as (un)supported.
    pub fn with_supported(self, supported: bool) -> Self {
        self.supported.store(supported, Ordering::SeqCst);
        self
    }

    /// Make every subsequent assertion fail.
    pub fn set_fail_assertions(&self, fail: bool) {
        self.fail_assertions.store(fail, Ordering::SeqCst);
    }

    /// Public half of a generated key.
    pub fn verifying_key(&self, key_id: &KeyId) -> Option<VerifyingKey> {
        self.keys.get(key_id).map(|k| k.verifying_key())
    }

    pub fn generate_count(&self) -> u32 {
        self.generate_count.load(Ordering::SeqCst)
    }

    pub fn attest_count(&self) -> u32 {
        self.attest_count.load(Ordering::SeqCst)
    }

    pub fn assertion_count(&self) -> u32 {
        self.assertion_count.load(Ordering::SeqCst)
    }

    /// Total number of calls into the attestor.
    pub fn total_calls(&self) -> u32 {
        self.generate_count() + self.attest_count() + self.assertion_count()
    }

    fn signing_key(&self, key_id: &KeyId) -> Result<SigningKey> {
        self.keys
            .get(key_id)
            .map(|k| k.value().clone())
            .ok_or_else(|| AttestError::Attestation(format!("unknown key {}", key_id)))
    }

    fn key_id_for(verifying_key: &VerifyingKey) -> KeyId {
        let digest = Sha256::digest(verifying_key.as_bytes());
        KeyId::new(base64::engine::general_purpose::STANDARD.encode(digest))
    }
}

impl Default for SoftwareAttestor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Attestor for SoftwareAttestor {
    fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    async fn generate_key(&self) -> Result<KeyId> {
        self.generate_count.fetch_add(1, Ordering::SeqCst);
        if !self.is_supported() {
            return Err(AttestError::NotSupported);
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let key_id = Self::key_id_for(&signing_key.verifying_key());
        self.keys.insert(key_id.clone(), signing_key);

        debug!(key_id = %key_id, "Generated software key");
        Ok(key_id)
    }

    async fn attest_key(&self, key_id: &KeyId, client_data_hash: &[u8]) -> Result<Vec<u8>> {
        self.attest_count.fetch_add(1, Ordering::SeqCst);
        let signing_key = self.signing_key(key_id)?;

        let mut statement = Vec::with_capacity(PUBLIC_KEY_LEN + SIGNATURE_LEN);
        statement.extend_from_slice(signing_key.verifying_key().as_bytes());
        statement.extend_from_slice(&signing_key.sign(client_data_hash).to_bytes());
        Ok(statement)
    }

    async fn generate_assertion(&self, key_id: &KeyId, client_data_hash: &[u8]) -> Result<Vec<u8>> {
        self.assertion_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_assertions.load(Ordering::SeqCst) {
            return Err(AttestError::Attestation("assertion generation disabled".into()));
        }

        let signing_key = self.signing_key(key_id)?;
        Ok(signing_key.sign(client_data_hash).to_bytes().to_vec())
    }
}
