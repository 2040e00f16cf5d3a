//! Seam to the engine that actually moves bytes between hosts.
//!
//! The production engine (RDMA/TCP) lives outside this crate. [`LoopbackTransport`]
//! implements the same contract inside one process by copying between the
//! buffer pools of clients attached to a shared [`LoopbackFabric`].
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{Mutex, RwLock};

use crate::error::TransferError;
use crate::pool::BufferPool;

pub type SegmentHandle = u64;
pub type BatchId = u64;

pub const DEFAULT_PORT: u16 = 12001;
pub const LOCAL_MEMORY_LOCATION: &str = "cpu:0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// remote -> local
    Read,
    /// local -> remote
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub opcode: Opcode,
    pub source: u64,
    pub target: SegmentHandle,
    pub target_offset: u64,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Waiting,
    Pending,
    Completed { transferred: usize },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    Rdma { nic_priority_matrix: String },
    Tcp,
}

impl TransportKind {
    pub fn from_protocol(protocol: &str, device: &str) -> Result<Self, TransferError> {
        match protocol {
            "rdma" => Ok(TransportKind::Rdma {
                nic_priority_matrix: serde_json::json!({ LOCAL_MEMORY_LOCATION: [[device], []] })
                    .to_string(),
            }),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(TransferError::UnsupportedProtocol(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Rdma { .. } => "rdma",
            TransportKind::Tcp => "tcp",
        }
    }
}

/// Who this client is, as announced to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub local_endpoint: String,
    pub host: String,
    pub port: u16,
    pub metadata_server: String,
    pub transport: TransportKind,
    pub device: String,
}

impl ClientIdentity {
    pub fn new(
        local_endpoint: &str,
        metadata_server: &str,
        protocol: &str,
        device: &str,
    ) -> Result<Self, TransferError> {
        let (host, port) = parse_host_with_port(local_endpoint);
        Ok(Self {
            local_endpoint: local_endpoint.to_string(),
            host,
            port,
            metadata_server: metadata_server.to_string(),
            transport: TransportKind::from_protocol(protocol, device)?,
            device: device.to_string(),
        })
    }
}

/// Splits `host[:port]`; a missing or unparsable port yields [`DEFAULT_PORT`].
pub fn parse_host_with_port(endpoint: &str) -> (String, u16) {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(DEFAULT_PORT)),
        None => (endpoint.to_string(), DEFAULT_PORT),
    }
}

#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Announces the client and hands the engine its managed region.
    async fn install(
        &self,
        identity: &ClientIdentity,
        region: Arc<BufferPool>,
    ) -> Result<(), TransferError>;

    async fn register_local_memory(
        &self,
        address: u64,
        length: usize,
        location: &str,
    ) -> Result<(), TransferError>;

    async fn unregister_local_memory(&self, address: u64) -> Result<(), TransferError>;

    async fn open_segment(&self, name: &str) -> Result<SegmentHandle, TransferError>;

    async fn submit(&self, request: TransferRequest) -> Result<BatchId, TransferError>;

    async fn status(&self, batch: BatchId) -> Result<TransferStatus, TransferError>;

    async fn free_batch(&self, batch: BatchId) -> Result<(), TransferError>;
}

/// Endpoints reachable by loopback transports, keyed by local endpoint name.
#[derive(Default)]
pub struct LoopbackFabric {
    endpoints: RwLock<HashMap<String, Arc<BufferPool>>>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn attach(&self, name: &str, pool: Arc<BufferPool>) {
        self.endpoints.write().await.insert(name.to_string(), pool);
    }

    async fn lookup(&self, name: &str) -> Option<Arc<BufferPool>> {
        self.endpoints.read().await.get(name).cloned()
    }
}

struct LocalSide {
    pool: Arc<BufferPool>,
    /// start -> length of every registered range
    registered: BTreeMap<u64, usize>,
}

impl LocalSide {
    fn is_registered(&self, address: u64, length: usize) -> bool {
        self.registered
            .range(..=address)
            .next_back()
            .is_some_and(|(&start, &len)| address + length as u64 <= start + len as u64)
    }
}

pub struct LoopbackTransport {
    fabric: Arc<LoopbackFabric>,
    local: Mutex<Option<LocalSide>>,
    segments: Mutex<HashMap<SegmentHandle, String>>,
    batches: Mutex<HashMap<BatchId, TransferStatus>>,
    next_id: AtomicU64,
}

impl LoopbackTransport {
    pub fn new(fabric: Arc<LoopbackFabric>) -> Self {
        Self {
            fabric,
            local: Mutex::new(None),
            segments: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn execute(&self, request: &TransferRequest) -> Result<usize, TransferError> {
        let local = {
            let guard = self.local.lock().await;
            let side = guard.as_ref().ok_or(TransferError::NotInitialized)?;
            if !side.is_registered(request.source, request.length) {
                return Err(TransferError::Transport(format!(
                    "local range {:#x}+{} is not registered",
                    request.source, request.length
                )));
            }
            side.pool.clone()
        };
        let peer_name = self
            .segments
            .lock()
            .await
            .get(&request.target)
            .cloned()
            .ok_or_else(|| TransferError::Transport(format!("unknown segment handle {}", request.target)))?;
        let peer = self
            .fabric
            .lookup(&peer_name)
            .await
            .ok_or_else(|| TransferError::Transport(format!("endpoint {peer_name} went away")))?;

        match request.opcode {
            Opcode::Read => {
                let data = peer.read_bytes(request.target_offset, request.length)?;
                local.write_bytes(request.source, &data)?;
            }
            Opcode::Write => {
                let data = local.read_bytes(request.source, request.length)?;
                peer.write_bytes(request.target_offset, &data)?;
            }
        }
        Ok(request.length)
    }
}

#[async_trait]
impl TransportEngine for LoopbackTransport {
    async fn install(
        &self,
        identity: &ClientIdentity,
        region: Arc<BufferPool>,
    ) -> Result<(), TransferError> {
        self.fabric
            .attach(&identity.local_endpoint, region.clone())
            .await;
        *self.local.lock().await = Some(LocalSide {
            pool: region,
            registered: BTreeMap::new(),
        });
        debug!(
            "loopback transport installed for {} ({})",
            identity.local_endpoint,
            identity.transport.name()
        );
        Ok(())
    }

    async fn register_local_memory(
        &self,
        address: u64,
        length: usize,
        _location: &str,
    ) -> Result<(), TransferError> {
        let mut guard = self.local.lock().await;
        let side = guard.as_mut().ok_or(TransferError::NotInitialized)?;
        side.registered.insert(address, length);
        Ok(())
    }

    async fn unregister_local_memory(&self, address: u64) -> Result<(), TransferError> {
        let mut guard = self.local.lock().await;
        let side = guard.as_mut().ok_or(TransferError::NotInitialized)?;
        if side.registered.remove(&address).is_none() {
            warn!("unregistering unknown memory range {address:#x}");
        }
        Ok(())
    }

    async fn open_segment(&self, name: &str) -> Result<SegmentHandle, TransferError> {
        if self.fabric.lookup(name).await.is_none() {
            return Err(TransferError::Transport(format!(
                "cannot open segment {name}: endpoint not found"
            )));
        }
        let handle = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.segments.lock().await.insert(handle, name.to_string());
        Ok(handle)
    }

    async fn submit(&self, request: TransferRequest) -> Result<BatchId, TransferError> {
        let batch = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.batches
            .lock()
            .await
            .insert(batch, TransferStatus::Pending);
        let status = match self.execute(&request).await {
            Ok(transferred) => TransferStatus::Completed { transferred },
            Err(e) => {
                warn!("loopback transfer {batch} failed: {e}");
                TransferStatus::Failed
            }
        };
        self.batches.lock().await.insert(batch, status);
        Ok(batch)
    }

    async fn status(&self, batch: BatchId) -> Result<TransferStatus, TransferError> {
        self.batches
            .lock()
            .await
            .get(&batch)
            .copied()
            .ok_or_else(|| TransferError::Transport(format!("unknown batch {batch}")))
    }

    async fn free_batch(&self, batch: BatchId) -> Result<(), TransferError> {
        self.batches.lock().await.remove(&batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_with_port() {
        assert_eq!(
            parse_host_with_port("0.0.0.0:1234"),
            ("0.0.0.0".to_string(), 1234)
        );
        assert_eq!(
            parse_host_with_port("1.2.3.4:111111"),
            ("1.2.3.4".to_string(), DEFAULT_PORT)
        );
        assert_eq!(
            parse_host_with_port("node1"),
            ("node1".to_string(), DEFAULT_PORT)
        );
    }

    #[test]
    fn test_transport_kind() {
        match TransportKind::from_protocol("rdma", "erdma_0").unwrap() {
            TransportKind::Rdma { nic_priority_matrix } => {
                let v: serde_json::Value = serde_json::from_str(&nic_priority_matrix).unwrap();
                assert_eq!(v["cpu:0"][0][0], "erdma_0");
                assert!(v["cpu:0"][1].as_array().unwrap().is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            TransportKind::from_protocol("tcp", "").unwrap(),
            TransportKind::Tcp
        );
        assert!(matches!(
            TransportKind::from_protocol("ib", ""),
            Err(TransferError::UnsupportedProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_open_unknown_segment_fails() {
        let transport = LoopbackTransport::new(LoopbackFabric::new());
        assert!(matches!(
            transport.open_segment("nowhere:1").await,
            Err(TransferError::Transport(_))
        ));
    }
}
