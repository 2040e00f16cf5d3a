//! Buffer transfer between hosts.
//!
//! - [`pool::BufferPool`] hands out fixed-size slabs from a registered region.
//! - [`client::TransferClient`] wraps a pool and moves bytes through a
//!   [`transport::TransportEngine`].
//! - [`rendezvous::Rendezvous`] passes a buffer address from a producer to a
//!   consumer through a message broker.
pub mod client;
pub mod error;
pub mod pool;
pub mod rendezvous;
pub mod transport;

pub use client::TransferClient;
pub use error::{RendezvousError, TransferError};
pub use pool::{BufferPool, ManagedBuffer, PoolConfig, PoolStats};
pub use rendezvous::{Broker, Rendezvous};
pub use transport::{LoopbackFabric, LoopbackTransport, TransportEngine};
