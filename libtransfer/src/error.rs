#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed to allocate {length} bytes: {reason}")]
    Allocation { length: usize, reason: String },
    #[error("invalid buffer handle {address:#x} with length {length}")]
    InvalidHandle { address: u64, length: usize },
    #[error("transfer failed: {0}")]
    Transport(String),
    #[error("access of {length} bytes at {address:#x} exceeds buffer bounds")]
    BufferBounds { address: u64, length: usize },
    #[error("transfer client is not initialized")]
    NotInitialized,
    #[error("transfer client already initialized as {0}")]
    AlreadyInitialized(String),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("broker error: {0}")]
    Broker(String),
    #[error("invalid rendezvous payload {0:?}")]
    InvalidPayload(String),
    #[error("rendezvous channel closed before a value arrived")]
    Closed,
}
