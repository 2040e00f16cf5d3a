use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, KvClient, Txn, TxnOp};
use log::info;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{KvStore, Versioned};
use crate::error::RegistryError;

#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            namespace: default_namespace(),
            username: None,
            password: None,
        }
    }
}

fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_namespace() -> String {
    common::DEFAULT_NAMESPACE.to_string()
}

#[derive(Clone)]
pub struct EtcdStore {
    kv_api: Arc<Mutex<KvClient>>,
}

impl EtcdStore {
    pub async fn connect(config: &EtcdConfig) -> Result<Self, RegistryError> {
        let opts = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            ConnectOptions::default().with_user(user.clone(), pass.clone())
        } else {
            ConnectOptions::default()
        };
        let cli = Client::connect(config.endpoints.clone(), Some(opts)).await?;
        info!("connected to etcd at {:?}", config.endpoints);
        Ok(Self {
            kv_api: Arc::new(Mutex::new(cli.kv_client())),
        })
    }

    async fn kv(&self) -> tokio::sync::MutexGuard<'_, KvClient> {
        self.kv_api.lock().await
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, RegistryError> {
        let resp = self.kv().await.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| Versioned {
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), RegistryError> {
        self.kv().await.put(key, value, None).await?;
        Ok(())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: i64,
    ) -> Result<bool, RegistryError> {
        let cmp = if expected_revision == 0 {
            Compare::version(key, CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key, CompareOp::Equal, expected_revision)
        };
        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = self.kv().await.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        let resp = self.kv().await.delete(key, None).await?;
        Ok(resp.deleted() > 0)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, RegistryError> {
        let resp = self
            .kv()
            .await
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    kv.value().to_vec(),
                )
            })
            .collect())
    }
}
