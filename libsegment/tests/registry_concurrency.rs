// tests/registry_concurrency.rs
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use common::{BufferDescriptor, Protocol, Segment};
use libsegment::{
    EtcdConfig, EtcdStore, KvStore, MemoryStore, RegistryError, SegmentRegistry, Versioned,
};
use log::info;

/// Delays every read so that concurrent writers all act on stale revisions,
/// the way a remote etcd round trip does.
struct SlowReadStore {
    inner: MemoryStore,
    latency: Duration,
}

#[async_trait]
impl KvStore for SlowReadStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, RegistryError> {
        let value = self.inner.get(key).await?;
        tokio::time::sleep(self.latency).await;
        Ok(value)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), RegistryError> {
        self.inner.put(key, value).await
    }

    async fn compare_and_put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: i64,
    ) -> Result<bool, RegistryError> {
        self.inner.compare_and_put(key, value, expected_revision).await
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        self.inner.delete(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, RegistryError> {
        self.inner.list_prefix(prefix).await
    }
}

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .try_init();
    });
}

fn segment(name: &str) -> Segment {
    Segment::new(name, Protocol::NvmeOf)
        .with_buffer(BufferDescriptor::new("/mnt/data/a.bin", 100))
        .with_buffer(BufferDescriptor::new("/mnt/data/b.bin", 200))
}

async fn race_hosts(store: Arc<dyn KvStore>, namespace: &str, hosts: usize) {
    let registry = SegmentRegistry::new(store, namespace);
    registry.register(&segment("optane12")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..hosts {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .update_buffer_mount(
                    "optane12",
                    "/mnt/data/a.bin",
                    &format!("host{i}"),
                    &format!("/mnt/p{i}"),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = registry.lookup("optane12").await.unwrap().unwrap();
    let map = &stored.buffer("/mnt/data/a.bin").unwrap().local_path_map;
    info!("final mount map: {map:?}");
    assert_eq!(map.len(), hosts);
    for i in 0..hosts {
        assert_eq!(map[&format!("host{i}")], format!("/mnt/p{i}"));
    }
    assert!(stored.buffer("/mnt/data/b.bin").unwrap().local_path_map.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_hosts_updating_same_buffer_both_survive() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let registry = SegmentRegistry::new(store, "/mooncake");
    registry.register(&segment("optane12")).await.unwrap();

    let a = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .update_buffer_mount("optane12", "/mnt/data/a.bin", "hostA", "/mnt/p1")
                .await
        })
    };
    let b = {
        let registry = registry.clone();
        tokio::spawn(async move {
            registry
                .update_buffer_mount("optane12", "/mnt/data/a.bin", "hostB", "/mnt/p2")
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let stored = registry.lookup("optane12").await.unwrap().unwrap();
    let map = &stored.buffer("/mnt/data/a.bin").unwrap().local_path_map;
    assert_eq!(map.len(), 2);
    assert_eq!(map["hostA"], "/mnt/p1");
    assert_eq!(map["hostB"], "/mnt/p2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_hosts_updating_same_buffer_all_survive() {
    init_logging();
    race_hosts(Arc::new(MemoryStore::new()), "/mooncake", 16).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn many_hosts_against_slow_reads_all_survive() {
    init_logging();
    let store = SlowReadStore {
        inner: MemoryStore::new(),
        latency: Duration::from_millis(2),
    };
    race_hosts(Arc::new(store), "/mooncake", 32).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registers_for_different_names_do_not_interfere() {
    init_logging();
    let registry = SegmentRegistry::new(Arc::new(MemoryStore::new()), "/mooncake");
    let mut handles = Vec::new();
    for i in 0..16 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.register(&segment(&format!("node{i:02}"))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let names = registry.list().await.unwrap();
    assert_eq!(names.len(), 16);
    for i in 0..16 {
        assert_eq!(
            registry.lookup(&format!("node{i:02}")).await.unwrap(),
            Some(segment(&format!("node{i:02}")))
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires etcd on 127.0.0.1:2379"]
async fn etcd_hosts_updating_same_buffer_all_survive() {
    init_logging();
    let store = EtcdStore::connect(&EtcdConfig::default())
        .await
        .expect("failed to connect etcd");
    let namespace = format!("/mooncake-test/{}", std::process::id());
    race_hosts(Arc::new(store), &namespace, 4).await;
}
