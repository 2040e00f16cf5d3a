//! Key-value store the registry persists to.
//!
//! Production uses etcd; [`MemoryStore`] keeps the same revision semantics in
//! process for tests and local development.
mod etcd;
mod memory;

use async_trait::async_trait;

use crate::error::RegistryError;

pub use etcd::{EtcdConfig, EtcdStore};
pub use memory::MemoryStore;

/// A value together with the store revision that last modified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, RegistryError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), RegistryError>;

    /// Writes `value` only if the key's mod revision still equals
    /// `expected_revision`; `0` means the key must not exist. Returns whether
    /// the write happened.
    async fn compare_and_put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: i64,
    ) -> Result<bool, RegistryError>;

    /// Returns whether a key was deleted.
    async fn delete(&self, key: &str) -> Result<bool, RegistryError>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, RegistryError>;
}
