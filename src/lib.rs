//! dreiattest - hardware-backed key attestation for HTTP clients
//!
//! Proves to a server, per logical user, that requests come from an install
//! holding an attested key, and signs every in-scope request with it.
//!
//! ## Components
//!
//! - **IdentityStore**: logical user id → install-stable service uid → cached key
//! - **KeyRegistrar**: nonce fetch, attestation and key publication
//! - **KeyLifecycleManager**: single-flight key generation and registration
//! - **RequestSigner**: request fingerprint, freshness binding, signature headers
//! - **AttestService**: scope check, shared-secret bypass, invalid-key retry

pub mod attestor;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod protocol;
pub mod registrar;
pub mod service;
pub mod signer;
pub mod store;

pub use attestor::{Attestor, KeyId, SoftwareAttestor};
pub use config::{AttestConfig, ValidationLevel};
pub use error::{AttestError, Result};
pub use identity::{IdentityStore, ServiceUid};
pub use lifecycle::KeyLifecycleManager;
pub use registrar::{HttpKeyRegistrar, KeyRegistrar};
pub use service::{AttestService, RetryDecision};
pub use signer::RequestSigner;
pub use store::{FileStore, KeyValueStore, MemoryStore};
