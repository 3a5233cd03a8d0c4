//! Durable key-value storage for identities and key handles.
//!
//! - `MemoryStore`: process-lifetime map, for tests and ephemeral installs
//! - `FileStore`: JSON document on disk, written through on every change

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;

/// String-to-string store with write-through semantics.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Insert or replace a value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}
