//! Key lifecycle - single-flight key generation and registration
//!
//! ## Single flight
//!
//! When several callers ask for the key of the same service identity while
//! none is cached, exactly ONE generate+register sequence runs and its result
//! is broadcast to every waiting caller. Different identities register
//! independently, but all registrations share a semaphore so that at most
//! `max_concurrent_registrations` handshakes talk to the server at once.
//!
//! ```text
//! get_key(uid)
//!   ├─ cached?            → return it
//!   ├─ in flight for uid? → subscribe to its result
//!   └─ otherwise          → spawn worker, subscribe
//!                             └─ permit → re-check cache → generate → register → cache
//! ```
//!
//! ## Teardown
//!
//! `shutdown()` (or dropping the manager) revokes the registration guard.
//! Workers still waiting for a permit resolve with `Cancelled`; a worker
//! that already holds one finishes and delivers its result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::attestor::{Attestor, KeyId};
use crate::error::{AttestError, Result};
use crate::identity::{IdentityStore, ServiceUid};
use crate::registrar::KeyRegistrar;

// =============================================================================
// Registration Guard
// =============================================================================

/// Revocable token shared by the manager and its workers.
#[derive(Debug, Clone, Default)]
pub struct RegistrationGuard {
    revoked: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl RegistrationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Resolves once the guard is revoked.
    pub async fn revoked(&self) {
        loop {
            // register interest before checking the flag so a concurrent revoke is not missed
            let notified = self.notify.notified();
            if self.is_revoked() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Lifecycle Manager
// =============================================================================

type PendingRegistration = broadcast::Sender<Result<KeyId>>;

struct Shared {
    identities: Arc<IdentityStore>,
    attestor: Arc<dyn Attestor>,
    registrar: Arc<dyn KeyRegistrar>,
    /// In-flight registrations (service uid -> broadcast channel)
    in_flight: Mutex<HashMap<ServiceUid, PendingRegistration>>,
    permits: Semaphore,
    guard: RegistrationGuard,
}

/// Hands out registered keys, generating and registering one when needed.
pub struct KeyLifecycleManager {
    shared: Arc<Shared>,
}

impl KeyLifecycleManager {
    pub fn new(
        identities: Arc<IdentityStore>,
        attestor: Arc<dyn Attestor>,
        registrar: Arc<dyn KeyRegistrar>,
        max_concurrent_registrations: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                identities,
                attestor,
                registrar,
                in_flight: Mutex::new(HashMap::new()),
                permits: Semaphore::new(max_concurrent_registrations.max(1)),
                guard: RegistrationGuard::new(),
            }),
        }
    }

    pub fn identities(&self) -> &Arc<IdentityStore> {
        &self.shared.identities
    }

    /// Registered key for `service_uid`, registering a fresh one if none is cached.
    pub async fn get_key(&self, service_uid: &ServiceUid) -> Result<KeyId> {
        if let Some(key_id) = self.shared.identities.cached_key(service_uid) {
            return Ok(key_id);
        }

        let mut receiver = {
            let mut in_flight = self.shared.in_flight.lock().await;
            match in_flight.get(service_uid) {
                Some(pending) => {
                    debug!(service_uid = %service_uid, "Joining in-flight key registration");
                    pending.subscribe()
                }
                None => {
                    if self.shared.guard.is_revoked() {
                        return Err(AttestError::Cancelled);
                    }

                    let (sender, receiver) = broadcast::channel(1);
                    in_flight.insert(service_uid.clone(), sender);

                    let shared = Arc::clone(&self.shared);
                    let service_uid = service_uid.clone();
                    tokio::spawn(shared.run_registration(service_uid));
                    receiver
                }
            }
        };

        match receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(AttestError::Internal("key registration worker exited".into())),
        }
    }

    /// Forget the cached key without telling the server.
    pub fn invalidate(&self, service_uid: &ServiceUid) {
        info!(service_uid = %service_uid, "Invalidating cached key");
        self.shared.identities.set_cached_key(service_uid, None);
    }

    /// Forget the cached key only if it is still `stale_key`.
    ///
    /// Returns whether anything was evicted. A key registered since
    /// `stale_key` was handed out stays cached.
    pub async fn invalidate_if(&self, service_uid: &ServiceUid, stale_key: &KeyId) -> bool {
        // the in-flight lock orders this against a worker caching a fresh key
        let _in_flight = self.shared.in_flight.lock().await;
        match self.shared.identities.cached_key(service_uid) {
            Some(cached) if cached == *stale_key => {
                info!(
                    service_uid = %service_uid,
                    key_id = %stale_key,
                    "Invalidating rejected key"
                );
                self.shared.identities.set_cached_key(service_uid, None);
                true
            }
            _ => {
                debug!(
                    service_uid = %service_uid,
                    key_id = %stale_key,
                    "Rejected key already replaced"
                );
                false
            }
        }
    }

    /// Forget the cached key, then ask the server to revoke it.
    ///
    /// Server failures are logged and swallowed.
    pub async fn deregister(&self, service_uid: &ServiceUid) {
        let Some(key_id) = self.shared.identities.cached_key(service_uid) else {
            debug!(service_uid = %service_uid, "No key to deregister");
            return;
        };

        self.shared.identities.set_cached_key(service_uid, None);

        if let Err(e) = self.shared.registrar.deregister_key(&key_id, service_uid).await {
            warn!(
                service_uid = %service_uid,
                key_id = %key_id,
                error = %e,
                "Key deregistration failed"
            );
        }
    }

    /// Cancel registrations that have not started yet.
    pub fn shutdown(&self) {
        if !self.shared.guard.is_revoked() {
            info!("Shutting down key lifecycle manager");
        }
        self.shared.guard.revoke();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.guard.is_revoked()
    }

    /// Number of registrations currently in flight.
    pub async fn pending_count(&self) -> usize {
        self.shared.in_flight.lock().await.len()
    }
}

impl Drop for KeyLifecycleManager {
    fn drop(&mut self) {
        self.shared.guard.revoke();
    }
}

impl Shared {
    async fn run_registration(self: Arc<Self>, service_uid: ServiceUid) {
        // waiters resolve even if the worker panics
        let worker = {
            let shared = Arc::clone(&self);
            let service_uid = service_uid.clone();
            tokio::spawn(async move { shared.acquire_and_register(&service_uid).await })
        };

        let result = match worker.await {
            Ok(result) => result,
            Err(e) => {
                error!(service_uid = %service_uid, error = %e, "Key registration worker failed");
                Err(AttestError::Internal(format!("key registration worker failed: {}", e)))
            }
        };

        let mut in_flight = self.in_flight.lock().await;
        if let Ok(key_id) = &result {
            self.identities.set_cached_key(&service_uid, Some(key_id));
        }
        if let Some(sender) = in_flight.remove(&service_uid) {
            // no receivers left is fine, the result is cached either way
            let _ = sender.send(result);
        }
    }

    async fn acquire_and_register(&self, service_uid: &ServiceUid) -> Result<KeyId> {
        let _permit = tokio::select! {
            biased;
            _ = self.guard.revoked() => return Err(AttestError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| AttestError::Cancelled)?,
        };

        if self.guard.is_revoked() {
            debug!(service_uid = %service_uid, "Dropping queued key registration");
            return Err(AttestError::Cancelled);
        }

        if let Some(key_id) = self.identities.cached_key(service_uid) {
            return Ok(key_id);
        }

        let key_id = self.attestor.generate_key().await?;
        debug!(service_uid = %service_uid, key_id = %key_id, "Generated key, registering");

        if let Err(e) = self.registrar.register_new_key(&key_id, service_uid).await {
            warn!(service_uid = %service_uid, error = %e, "Key registration failed");
            return Err(e);
        }

        Ok(key_id)
    }
}

// =============================================================================
// Tests
// =============================================================================
