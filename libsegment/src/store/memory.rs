use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{KvStore, Versioned};
use crate::error::RegistryError;

#[derive(Default)]
struct MemoryState {
    revision: i64,
    entries: BTreeMap<String, Versioned>,
}

impl MemoryState {
    fn write(&mut self, key: &str, value: Vec<u8>) {
        self.revision += 1;
        self.entries.insert(
            key.to_string(),
            Versioned {
                value,
                mod_revision: self.revision,
            },
        );
    }
}

/// In-process store with etcd-like revisions: one store-wide counter bumped
/// on every write.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, RegistryError> {
        Ok(self.state.lock().await.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), RegistryError> {
        self.state.lock().await.write(key, value);
        Ok(())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: i64,
    ) -> Result<bool, RegistryError> {
        let mut state = self.state.lock().await;
        let current = state.entries.get(key).map_or(0, |v| v.mod_revision);
        if current != expected_revision {
            return Ok(false);
        }
        state.write(key, value);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        let mut state = self.state.lock().await;
        let existed = state.entries.remove(key).is_some();
        if existed {
            state.revision += 1;
        }
        Ok(existed)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, RegistryError> {
        Ok(self
            .state
            .lock()
            .await
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect())
    }
}
