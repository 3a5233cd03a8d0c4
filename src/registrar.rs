//! Server side of the key lifecycle: registration handshake and revocation.
//!
//! Registration is a three-step exchange:
//!
//! 1. `GET dreiattest/nonce` with `Dreiattest-Uid` returns a short-lived snonce
//! 2. the attestor attests the new key over
//!    `SHA256(service_uid || key_id || snonce)`
//! 3. `POST dreiattest/key` publishes the key and its attestation statement
//!
//! Revocation is a `DELETE dreiattest/key` signed with the key being revoked.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::attestor::{Attestor, KeyId};
use crate::config::ValidationLevel;
use crate::error::{AttestError, Result};
use crate::identity::ServiceUid;
use crate::protocol::{Endpoint, DRIVER, NONCE_HEADER, UID_HEADER};
use crate::signer::{hash_request, header_value, RequestSigner};

/// Remote key registration and revocation.
#[async_trait]
pub trait KeyRegistrar: Send + Sync {
    /// Attest `key_id` and publish it for `service_uid`.
    async fn register_new_key(&self, key_id: &KeyId, service_uid: &ServiceUid) -> Result<()>;

    /// Ask the server to forget `key_id`. Succeeds only on HTTP 200.
    async fn deregister_key(&self, key_id: &KeyId, service_uid: &ServiceUid) -> Result<()>;
}

/// Challenge the attestation statement is bound to.
pub fn registration_challenge(service_uid: &ServiceUid, key_id: &KeyId, snonce: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(service_uid.as_str().as_bytes());
    hasher.update(key_id.as_str().as_bytes());
    hasher.update(snonce.as_bytes());
    hasher.finalize().into()
}

/// Extract a nonce from a response body.
///
/// The server answers with a JSON string literal; bare tokens are accepted too.
pub fn parse_nonce(body: &str) -> Result<String> {
    if let Ok(nonce) = serde_json::from_str::<String>(body) {
        if !nonce.is_empty() {
            return Ok(nonce);
        }
    }

    let bare = body.trim();
    if !bare.is_empty() && !bare.contains(char::is_whitespace) && !bare.starts_with('"') {
        return Ok(bare.to_string());
    }

    Err(AttestError::Internal(format!("invalid nonce response: {:?}", body)))
}

#[derive(Debug, Serialize)]
struct RegisterKeyRequest<'a> {
    key_id: &'a str,
    attestation: String,
    driver: &'a str,
}

/// `KeyRegistrar` speaking the dreiattest HTTP protocol.
pub struct HttpKeyRegistrar {
    client: Client,
    base_url: Url,
    attestor: Arc<dyn Attestor>,
    signer: RequestSigner,
}

impl HttpKeyRegistrar {
    pub fn new(client: Client, base_url: Url, attestor: Arc<dyn Attestor>) -> Self {
        let signer = RequestSigner::new(Arc::clone(&attestor), ValidationLevel::SignOnly);
        Self {
            client,
            base_url,
            attestor,
            signer,
        }
    }

    /// Fetch a registration snonce for `service_uid`.
    pub async fn fetch_snonce(&self, service_uid: &ServiceUid) -> Result<String> {
        let endpoint = Endpoint::key_registration_nonce();
        let response = self
            .client
            .request(endpoint.method.clone(), endpoint.url(&self.base_url)?)
            .header(UID_HEADER, header_value(service_uid.as_str())?)
            .header(ACCEPT, "text/plain")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttestError::Internal(format!("nonce request failed: HTTP {}", status)));
        }

        let body = response.text().await?;
        parse_nonce(&body)
    }
}

#[async_trait]
impl KeyRegistrar for HttpKeyRegistrar {
    async fn register_new_key(&self, key_id: &KeyId, service_uid: &ServiceUid) -> Result<()> {
        let snonce = self.fetch_snonce(service_uid).await?;
        let challenge = registration_challenge(service_uid, key_id, &snonce);
        let statement = self.attestor.attest_key(key_id, &challenge).await?;

        let body = RegisterKeyRequest {
            key_id: key_id.as_str(),
            attestation: base64::engine::general_purpose::STANDARD.encode(statement),
            driver: DRIVER,
        };

        let endpoint = Endpoint::register_key();
        let response = self
            .client
            .request(endpoint.method.clone(), endpoint.url(&self.base_url)?)
            .header(UID_HEADER, header_value(service_uid.as_str())?)
            .header(NONCE_HEADER, header_value(&snonce)?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::OK {
            info!(service_uid = %service_uid, key_id = %key_id, "Registered attestation key");
            return Ok(());
        }

        let bytes = response.bytes().await?;
        match std::str::from_utf8(&bytes) {
            Ok(code) => {
                debug!(status = %status, code = %code.trim(), "Key registration rejected");
                Err(AttestError::from_server_code(code))
            }
            Err(_) => Err(AttestError::Internal(format!(
                "key registration failed: HTTP {}",
                status
            ))),
        }
    }

    async fn deregister_key(&self, key_id: &KeyId, service_uid: &ServiceUid) -> Result<()> {
        let snonce = self.fetch_snonce(service_uid).await?;

        let endpoint = Endpoint::delete_key();
        let request = self
            .client
            .request(endpoint.method.clone(), endpoint.url(&self.base_url)?)
            .header(UID_HEADER, header_value(service_uid.as_str())?)
            .header(CONTENT_TYPE, "text/plain")
            .body(key_id.as_str().to_string())
            .build()?;

        let hash = hash_request(&request)?;
        let request = self.signer.attach_signature(request, &hash, &snonce, key_id).await?;

        let response = self.client.execute(request).await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(AttestError::Internal(format!(
                "key deregistration failed: HTTP {}",
                status
            )));
        }

        info!(service_uid = %service_uid, key_id = %key_id, "Deregistered attestation key");
        Ok(())
    }
}
