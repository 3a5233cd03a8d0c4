//! Request fingerprinting and signing.
//!
//! A request is fingerprinted as `SHA256(url || method || body)`. Headers are
//! not part of the fingerprint, since transports add and rewrite them. The
//! fingerprint is then bound to a freshness token,
//! `SHA256(request_hash || token)`, and the attestor signs that value with
//! the registered key.
//!
//! # Headers
//!
//! ```text
//! Dreiattest-Uid           service uid
//! Dreiattest-User-Headers  header names present at signing time
//! Dreiattest-Nonce         freshness token
//! Dreiattest-Signature     base64 assertion
//! ```

use std::sync::Arc;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, Request, Url};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::attestor::{Attestor, KeyId};
use crate::config::ValidationLevel;
use crate::error::{AttestError, Result};
use crate::identity::ServiceUid;
use crate::protocol::{
    is_reserved_header, NONCE_HEADER, SIGNATURE_HEADER, UID_HEADER, USER_HEADERS_HEADER,
};

/// Freshness token used when the server does not issue per-request nonces.
pub const DEFAULT_REQUEST_NONCE: &str = "00000000-0000-0000-0000-000000000000";

/// SHA-256 fingerprint of a request's URL, method and body.
pub fn request_hash(url: &Url, method: &Method, body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(url.as_str().as_bytes());
    hasher.update(method.as_str().as_bytes());
    hasher.update(body);
    hasher.finalize().into()
}

/// Bind a request fingerprint to a freshness token.
pub fn request_nonce(request_hash: &[u8], snonce: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(request_hash);
    hasher.update(snonce.as_bytes());
    hasher.finalize().into()
}

/// Fail with `IllegalHeaders` if any reserved header is already present.
pub fn check_reserved_headers(headers: &HeaderMap) -> Result<()> {
    if headers.keys().any(is_reserved_header) {
        return Err(AttestError::IllegalHeaders);
    }
    Ok(())
}

/// In-memory body bytes of a request; streaming bodies cannot be fingerprinted.
pub fn body_bytes(request: &Request) -> Result<&[u8]> {
    match request.body() {
        None => Ok(&[]),
        Some(body) => body.as_bytes().ok_or_else(|| {
            AttestError::Internal("streaming request bodies cannot be signed".into())
        }),
    }
}

/// Fingerprint of a fully built request.
pub fn hash_request(request: &Request) -> Result<[u8; 32]> {
    Ok(request_hash(request.url(), request.method(), body_bytes(request)?))
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AttestError::Internal(format!("invalid header value: {}", e)))
}

/// Signs outgoing requests with an attested key.
pub struct RequestSigner {
    attestor: Arc<dyn Attestor>,
    validation_level: ValidationLevel,
}

impl RequestSigner {
    pub fn new(attestor: Arc<dyn Attestor>, validation_level: ValidationLevel) -> Self {
        Self {
            attestor,
            validation_level,
        }
    }

    pub fn validation_level(&self) -> ValidationLevel {
        self.validation_level
    }

    /// Sign `request` on behalf of `service_uid` with `key_id`.
    ///
    /// The fingerprint is computed on the blocking pool while the freshness
    /// token is obtained; signing starts once both are available.
    pub async fn sign(
        &self,
        mut request: Request,
        service_uid: &ServiceUid,
        key_id: &KeyId,
    ) -> Result<Request> {
        check_reserved_headers(request.headers())?;

        let headers = request.headers_mut();
        headers.insert(UID_HEADER, header_value(service_uid.as_str())?);
        let user_headers = user_header_names(headers);
        headers.insert(USER_HEADERS_HEADER, header_value(&user_headers)?);

        let url = request.url().clone();
        let method = request.method().clone();
        let body = body_bytes(&request)?.to_vec();

        let hash_task = async move {
            tokio::task::spawn_blocking(move || request_hash(&url, &method, &body))
                .await
                .map_err(|e| AttestError::Internal(format!("request hashing failed: {}", e)))
        };

        let (hash, snonce) = tokio::try_join!(hash_task, self.freshness_token())?;

        self.attach_signature(request, &hash, &snonce, key_id).await
    }

    /// Sign an already fingerprinted request and attach signature and nonce headers.
    pub(crate) async fn attach_signature(
        &self,
        mut request: Request,
        request_hash: &[u8],
        snonce: &str,
        key_id: &KeyId,
    ) -> Result<Request> {
        let nonce = request_nonce(request_hash, snonce);

        let engine = base64::engine::general_purpose::STANDARD;
        debug!(request_hash = %engine.encode(request_hash), "Request hash");
        debug!(snonce = %snonce, "Snonce");
        debug!(nonce = %engine.encode(nonce), "Nonce");

        let assertion = self.attestor.generate_assertion(key_id, &nonce).await?;

        let headers = request.headers_mut();
        headers.insert(SIGNATURE_HEADER, header_value(&engine.encode(assertion))?);
        headers.insert(NONCE_HEADER, header_value(snonce)?);

        debug!(method = %request.method(), url = %request.url(), "Signed request");
        Ok(request)
    }

    /// Freshness token for the configured validation level.
    async fn freshness_token(&self) -> Result<String> {
        match self.validation_level {
            ValidationLevel::SignOnly => Ok(DEFAULT_REQUEST_NONCE.to_string()),
            // TODO: fetch from the request-nonce endpoint once its response format is defined
            ValidationLevel::WithNonce => Err(AttestError::Internal(
                "per-request nonces are not implemented".into(),
            )),
        }
    }
}

/// Comma-joined header names, followed by the user-headers header itself.
fn user_header_names(headers: &HeaderMap) -> String {
    headers
        .keys()
        .map(|name| name.as_str())
        .chain(std::iter::once(USER_HEADERS_HEADER.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}
