//! Wire protocol constants shared by the registrar, signer and service

use reqwest::header::HeaderName;
use reqwest::{Method, Url};

use crate::error::{AttestError, Result};

/// Path prefix of every attestation endpoint below the base URL
pub const ENDPOINT_BASE: &str = "dreiattest";

/// Prefix of every header this crate injects; requests arriving with one are rejected
pub const HEADER_PREFIX: &str = "dreiattest-";

pub const UID_HEADER: HeaderName = HeaderName::from_static("dreiattest-uid");
pub const NONCE_HEADER: HeaderName = HeaderName::from_static("dreiattest-nonce");
pub const SIGNATURE_HEADER: HeaderName = HeaderName::from_static("dreiattest-signature");
pub const USER_HEADERS_HEADER: HeaderName = HeaderName::from_static("dreiattest-user-headers");
pub const SHARED_SECRET_HEADER: HeaderName = HeaderName::from_static("dreiattest-shared-secret");

/// Response header carrying the server error code
pub const ERROR_HEADER: HeaderName = HeaderName::from_static("dreiattest-error");

/// Driver name sent with key registrations
pub const DRIVER: &str = "apple";

/// A server endpoint relative to the base URL
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: &'static str,
    pub method: Method,
}

impl Endpoint {
    pub fn register_key() -> Self {
        Self { name: "key", method: Method::POST }
    }

    pub fn delete_key() -> Self {
        Self { name: "key", method: Method::DELETE }
    }

    pub fn key_registration_nonce() -> Self {
        Self { name: "nonce", method: Method::GET }
    }

    pub fn request_nonce() -> Self {
        Self { name: "request-nonce", method: Method::GET }
    }

    /// Absolute URL of this endpoint below `base_url`.
    pub fn url(&self, base_url: &Url) -> Result<Url> {
        let base = base_url.as_str().trim_end_matches('/');
        let joined = format!("{}/{}/{}", base, ENDPOINT_BASE, self.name);
        Url::parse(&joined)
            .map_err(|e| AttestError::Internal(format!("bad endpoint URL {}: {}", joined, e)))
    }
}

/// Whether `url` lies below `base` (scheme-insensitive prefix match).
///
/// The base is treated as a directory: `https://h/api` covers
/// `https://h/api/x` but not `https://h/api` itself or `https://h/apix`.
pub fn is_subpath(url: &Url, base: &Url) -> bool {
    let mut base = strip_scheme(base.as_str()).to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    strip_scheme(url.as_str()).starts_with(&base)
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map(|(_, rest)| rest).unwrap_or(url)
}

/// Whether a header name falls in the reserved `Dreiattest-*` namespace.
pub fn is_reserved_header(name: &HeaderName) -> bool {
    // HeaderName is always lowercase
    name.as_str().starts_with(HEADER_PREFIX)
}
