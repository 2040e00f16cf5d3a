//! Segment registry and buffer mount protocol.
//!
//! A storage node registers a [`common::Segment`] describing the files it
//! exposes. Consumers mount one of those files over NVMe-oF with
//! [`mount::MountOrchestrator`], which records the local mount path in the
//! segment's per-buffer `local_path_map`. Every registry mutation is a
//! read-modify-write of the whole document guarded by the store's
//! compare-and-swap on the key's mod revision.
pub mod error;
pub mod executor;
pub mod mount;
pub mod registry;
pub mod store;

pub use error::{MountError, MountErrorKind, RegistryError};
pub use executor::{CommandExecutor, CommandOutput, CommandSpec, ScriptedExecutor, SystemExecutor};
pub use mount::{MountOrchestrator, MountReport, MountRequest, MountState, NvmeofTarget};
pub use registry::SegmentRegistry;
pub use store::{EtcdConfig, EtcdStore, KvStore, MemoryStore, Versioned};
