//! Service identities and the cached key handle per identity.
//!
//! A logical user id is whatever the application uses to tell its users
//! apart (empty for single-user apps). Each one is mapped once per install
//! to a service uid `"<logical>;<uuid>"`, which is what the server sees.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attestor::KeyId;
use crate::store::KeyValueStore;

/// Install-stable identity presented to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceUid(String);

impl ServiceUid {
    /// Wrap an existing identity string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh identity for a logical user.
    fn generate(logical_uid: &str) -> Self {
        Self(format!("{};{}", logical_uid, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The logical user id this identity was minted for.
    pub fn logical_uid(&self) -> &str {
        // logical ids may themselves contain ';', the uuid suffix never does
        self.0.rsplit_once(';').map(|(logical, _)| logical).unwrap_or(&self.0)
    }
}

impl fmt::Display for ServiceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceUid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn uid_key(logical_uid: &str) -> String {
    format!("uid:{}", logical_uid)
}

fn key_id_key(service_uid: &ServiceUid) -> String {
    format!("key_id:{}", service_uid)
}

/// Maps logical users to service identities and identities to key handles.
///
/// Writes go straight to the backing store. If persisting fails the error
/// is logged and the caller still gets a consistent answer for this process.
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
    /// Serializes create-on-first-use so racing callers agree on one identity
    create_lock: Mutex<()>,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            create_lock: Mutex::new(()),
        }
    }

    /// Service identity for `logical_uid`, created and persisted on first use.
    pub fn service_uid(&self, logical_uid: &str) -> ServiceUid {
        let key = uid_key(logical_uid);
        if let Some(existing) = self.store.get(&key) {
            return ServiceUid(existing);
        }

        let _guard = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = self.store.get(&key) {
            return ServiceUid(existing);
        }

        let service_uid = ServiceUid::generate(logical_uid);
        if let Err(e) = self.store.set(&key, service_uid.as_str()) {
            warn!(error = %e, "Failed to persist service uid");
        }
        info!(service_uid = %service_uid, "Created service identity");
        service_uid
    }

    /// Cached key handle for an identity, if one is registered.
    pub fn cached_key(&self, service_uid: &ServiceUid) -> Option<KeyId> {
        self.store.get(&key_id_key(service_uid)).map(KeyId::new)
    }

    /// Cache or (with `None`) evict the key handle for an identity.
    pub fn set_cached_key(&self, service_uid: &ServiceUid, key_id: Option<&KeyId>) {
        let key = key_id_key(service_uid);
        let result = match key_id {
            Some(key_id) => {
                debug!(service_uid = %service_uid, key_id = %key_id, "Caching key handle");
                self.store.set(&key, key_id.as_str())
            }
            None => {
                debug!(service_uid = %service_uid, "Evicting key handle");
                self.store.remove(&key)
            }
        };

        if let Err(e) = result {
            warn!(service_uid = %service_uid, error = %e, "Failed to persist key handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn identity_store() -> IdentityStore {
        IdentityStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_uid_generation() {
        let identities = identity_store();

        let uid1 = identities.service_uid("user1");
        let uid2 = identities.service_uid("user2");
        let uid3 = identities.service_uid("");

        let parts1: Vec<&str> = uid1.as_str().split(';').collect();
        let parts2: Vec<&str> = uid2.as_str().split(';').collect();
        let parts3: Vec<&str> = uid3.as_str().split(';').collect();

        assert_eq!(parts1[0], "user1");
        assert_eq!(parts2[0], "user2");
        assert_eq!(parts3[0], "");

        assert_ne!(parts1[1], parts2[1]);
        assert_ne!(parts1[1], parts3[1]);
        assert_ne!(parts2[1], parts3[1]);

        // reload
        assert_eq!(identities.service_uid("user1"), uid1);
        assert_eq!(identities.service_uid(""), uid3);
    }

    #[test]
    fn test_logical_uid_roundtrip() {
        let identities = identity_store();
        assert_eq!(identities.service_uid("a;b").logical_uid(), "a;b");
        assert_eq!(identities.service_uid("").logical_uid(), "");
    }

    #[test]
    fn test_identity_survives_store_reuse() {
        let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let uid = IdentityStore::new(Arc::clone(&backing)).service_uid("alice");
        assert_eq!(IdentityStore::new(backing).service_uid("alice"), uid);
    }

    #[test]
    fn test_concurrent_first_use_agrees() {
        let identities = Arc::new(identity_store());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let identities = Arc::clone(&identities);
                std::thread::spawn(move || identities.service_uid("racer"))
            })
            .collect();

        let uids: Vec<ServiceUid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(uids.iter().all(|uid| *uid == uids[0]));
    }

    #[test]
    fn test_cached_key() {
        let identities = identity_store();
        let uid = identities.service_uid("user");
        assert!(identities.cached_key(&uid).is_none());

        let key_id = KeyId::new("key-1");
        identities.set_cached_key(&uid, Some(&key_id));
        assert_eq!(identities.cached_key(&uid), Some(key_id));

        identities.set_cached_key(&uid, None);
        assert!(identities.cached_key(&uid).is_none());
    }
}
