//! Client configuration
//!
//! Loaded from TOML, then overridden by the environment and CLI flags:
//!
//! ```toml
//! base_url = "https://api.example.com/v1"
//! uid = "alice"
//! validation_level = "sign-only"
//! store_path = "/var/lib/dreiattest/store.json"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use reqwest::Url;

use crate::error::{AttestError, Result};

/// Environment variable carrying the shared-secret bypass token
pub const BYPASS_SECRET_ENV: &str = "DREIATTEST_BYPASS_SECRET";

/// How signed requests are bound to freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationLevel {
    /// Sign with the fixed placeholder token
    #[default]
    SignOnly,
    /// Fetch a per-request token from the server (not implemented)
    WithNonce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestConfig {
    /// Base URL; only requests below it are signed
    pub base_url: String,

    /// Logical user id (empty for single-user installs)
    #[serde(default)]
    pub uid: String,

    #[serde(default)]
    pub validation_level: ValidationLevel,

    /// Shared secret that replaces attestation (development servers only)
    #[serde(default)]
    pub shared_secret: Option<String>,

    /// Persistent store path; in-memory when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Key registrations allowed to run at once
    #[serde(default = "default_max_concurrent_registrations")]
    pub max_concurrent_registrations: usize,
}

fn default_request_timeout() -> u64 { 30 }
fn default_max_concurrent_registrations() -> usize { 1 }

impl AttestConfig {
    /// Configuration with defaults for everything but the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            uid: String::new(),
            validation_level: ValidationLevel::default(),
            shared_secret: None,
            store_path: None,
            request_timeout_secs: default_request_timeout(),
            max_concurrent_registrations: default_max_concurrent_registrations(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AttestError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AttestError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    pub fn with_shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.shared_secret = Some(secret.into());
        self
    }

    pub fn with_validation_level(mut self, level: ValidationLevel) -> Self {
        self.validation_level = level;
        self
    }

    pub fn with_max_concurrent_registrations(mut self, max: usize) -> Self {
        self.max_concurrent_registrations = max;
        self
    }

    /// Take the shared secret from the environment when set and non-empty.
    pub fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(BYPASS_SECRET_ENV) {
            if !secret.is_empty() {
                self.shared_secret = Some(secret);
            }
        }
    }

    /// Parsed base URL.
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            AttestError::Config(format!("invalid base_url {:?}: {}", self.base_url, e))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(AttestError::Config(format!("unsupported base_url scheme: {}", other))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        if self.max_concurrent_registrations == 0 {
            return Err(AttestError::Config(
                "max_concurrent_registrations must be at least 1".into(),
            ));
        }
        if matches!(&self.shared_secret, Some(s) if s.is_empty()) {
            return Err(AttestError::Config("shared_secret must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml() {
        let config = AttestConfig::from_toml_str(r#"base_url = "https://h/api""#).unwrap();
        assert_eq!(config.uid, "");
        assert_eq!(config.validation_level, ValidationLevel::SignOnly);
        assert_eq!(config.max_concurrent_registrations, 1);
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.shared_secret.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_toml() {
        let config = AttestConfig::from_toml_str(
            r#"
            base_url = "http://localhost:8000"
            uid = "alice"
            validation_level = "with-nonce"
            shared_secret = "s3cret"
            store_path = "/tmp/store.json"
            max_concurrent_registrations = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.uid, "alice");
        assert_eq!(config.validation_level, ValidationLevel::WithNonce);
        assert_eq!(config.shared_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/store.json")));
        assert_eq!(config.max_concurrent_registrations, 4);
    }

    #[test]
    fn test_missing_base_url() {
        assert!(matches!(
            AttestConfig::from_toml_str("uid = \"x\""),
            Err(AttestError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(AttestConfig::new("ftp://h/api").validate().is_err());
        assert!(AttestConfig::new("not a url").validate().is_err());
        assert!(AttestConfig::new("https://h")
            .with_max_concurrent_registrations(0)
            .validate()
            .is_err());
        assert!(AttestConfig::new("https://h").with_shared_secret("").validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dreiattest.toml");
        std::fs::write(&path, "base_url = \"https://h\"\nuid = \"bob\"\n").unwrap();

        let config = AttestConfig::load(&path).unwrap();
        assert_eq!(config.uid, "bob");
        assert!(AttestConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
