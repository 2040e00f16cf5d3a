use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::error::TransferError;
use crate::pool::{BufferPool, ManagedBuffer, PoolConfig};
use crate::transport::{
    BatchId, ClientIdentity, LOCAL_MEMORY_LOCATION, Opcode, SegmentHandle, TransferRequest,
    TransferStatus, TransportEngine,
};

const STATUS_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Synchronous transfers of managed buffers to and from named remote endpoints.
pub struct TransferClient {
    engine: Arc<dyn TransportEngine>,
    pool: Arc<BufferPool>,
    identity: Mutex<Option<ClientIdentity>>,
    handles: Mutex<HashMap<String, SegmentHandle>>,
}

impl TransferClient {
    pub fn new(engine: Arc<dyn TransportEngine>, pool_config: PoolConfig) -> Result<Self, TransferError> {
        Ok(Self {
            engine,
            pool: Arc::new(BufferPool::new(pool_config)?),
            identity: Mutex::new(None),
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Registers this client with the transport engine.
    ///
    /// Repeating the call with identical arguments is a no-op; different
    /// arguments fail with [`TransferError::AlreadyInitialized`].
    pub async fn initialize(
        &self,
        local_endpoint: &str,
        metadata_server: &str,
        protocol: &str,
        device: &str,
    ) -> Result<(), TransferError> {
        let identity = ClientIdentity::new(local_endpoint, metadata_server, protocol, device)?;
        let mut current = self.identity.lock().await;
        if let Some(existing) = current.as_ref() {
            if *existing == identity {
                return Ok(());
            }
            return Err(TransferError::AlreadyInitialized(
                existing.local_endpoint.clone(),
            ));
        }

        self.engine.install(&identity, self.pool.clone()).await?;
        let (base, length) = self.pool.slab_region();
        self.engine
            .register_local_memory(base, length, LOCAL_MEMORY_LOCATION)
            .await
            .map_err(|e| TransferError::Allocation {
                length,
                reason: format!("failed to register managed region: {e}"),
            })?;

        info!(
            "transfer client {} initialized over {} (metadata server {})",
            identity.local_endpoint,
            identity.transport.name(),
            identity.metadata_server
        );
        *current = Some(identity);
        Ok(())
    }

    pub async fn allocate(&self, length: usize) -> Result<ManagedBuffer, TransferError> {
        self.ensure_initialized().await?;
        let buffer = self.pool.allocate(length)?;
        if self.pool.is_slab_address(buffer.address) {
            return Ok(buffer);
        }

        if let Err(e) = self
            .engine
            .register_local_memory(buffer.address, length, LOCAL_MEMORY_LOCATION)
            .await
        {
            self.pool.free(buffer.address, length)?;
            return Err(TransferError::Allocation {
                length,
                reason: format!("memory registration failed: {e}"),
            });
        }
        Ok(buffer)
    }

    pub async fn free(&self, address: u64, length: usize) -> Result<(), TransferError> {
        self.pool.free(address, length)?;
        if !self.pool.is_slab_address(address) {
            if let Err(e) = self.engine.unregister_local_memory(address).await {
                warn!("failed to unregister {address:#x}: {e}");
            }
        }
        Ok(())
    }

    pub fn write_bytes(&self, address: u64, data: &[u8], length: usize) -> Result<(), TransferError> {
        let data = data
            .get(..length)
            .ok_or(TransferError::BufferBounds { address, length })?;
        self.pool.write_bytes(address, data)
    }

    pub fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, TransferError> {
        self.pool.read_bytes(address, length)
    }

    /// Pulls `length` bytes from `remote_address` on `remote_endpoint` into the
    /// local buffer at `local_address`. Returns only once the transport has
    /// finished; either every byte arrives or the call fails.
    pub async fn transfer_sync(
        &self,
        remote_endpoint: &str,
        local_address: u64,
        remote_address: u64,
        length: usize,
    ) -> Result<usize, TransferError> {
        self.transfer(Opcode::Read, remote_endpoint, local_address, remote_address, length)
            .await
    }

    /// Pushes the local buffer at `local_address` to `remote_address`.
    pub async fn transfer_sync_write(
        &self,
        remote_endpoint: &str,
        local_address: u64,
        remote_address: u64,
        length: usize,
    ) -> Result<usize, TransferError> {
        self.transfer(Opcode::Write, remote_endpoint, local_address, remote_address, length)
            .await
    }

    async fn transfer(
        &self,
        opcode: Opcode,
        remote_endpoint: &str,
        local_address: u64,
        remote_address: u64,
        length: usize,
    ) -> Result<usize, TransferError> {
        self.ensure_initialized().await?;
        if length == 0 {
            return Err(TransferError::Transport("empty transfer".to_string()));
        }
        // only managed buffers are registered with the engine
        self.pool.check_range(local_address, length)?;

        let target = self.segment_handle(remote_endpoint).await?;
        let batch = self
            .engine
            .submit(TransferRequest {
                opcode,
                source: local_address,
                target,
                target_offset: remote_address,
                length,
            })
            .await?;

        let status = self.wait_for(batch).await;
        if let Err(e) = self.engine.free_batch(batch).await {
            warn!("failed to free batch {batch}: {e}");
        }

        match status? {
            TransferStatus::Completed { transferred } if transferred == length => {
                debug!("{opcode:?} of {length} bytes with {remote_endpoint} completed");
                Ok(transferred)
            }
            TransferStatus::Completed { transferred } => Err(TransferError::Transport(format!(
                "short transfer with {remote_endpoint}: {transferred} of {length} bytes"
            ))),
            _ => Err(TransferError::Transport(format!(
                "{opcode:?} of {length} bytes with {remote_endpoint} failed"
            ))),
        }
    }

    async fn wait_for(&self, batch: BatchId) -> Result<TransferStatus, TransferError> {
        loop {
            match self.engine.status(batch).await? {
                TransferStatus::Waiting | TransferStatus::Pending => {
                    tokio::time::sleep(STATUS_POLL_INTERVAL).await
                }
                done => return Ok(done),
            }
        }
    }

    async fn segment_handle(&self, remote_endpoint: &str) -> Result<SegmentHandle, TransferError> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(remote_endpoint) {
            return Ok(*handle);
        }
        let handle = self.engine.open_segment(remote_endpoint).await?;
        handles.insert(remote_endpoint.to_string(), handle);
        Ok(handle)
    }

    async fn ensure_initialized(&self) -> Result<(), TransferError> {
        if self.identity.lock().await.is_none() {
            return Err(TransferError::NotInitialized);
        }
        Ok(())
    }
}
