use std::io;
use std::path::PathBuf;

use common::DocumentError;

use crate::mount::MountState;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("segment {0} not found")]
    SegmentNotFound(String),
    #[error("buffer {file_path} not found in segment {segment}")]
    BufferNotFound { segment: String, file_path: String },
    #[error("invalid segment document under {key}: {source}")]
    InvalidDocument {
        key: String,
        #[source]
        source: DocumentError,
    },
    #[error("segment {key} kept changing, gave up after {attempts} attempts")]
    Conflict { key: String, attempts: usize },
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Etcd(#[from] Box<etcd_client::Error>),
}

impl From<etcd_client::Error> for RegistryError {
    fn from(e: etcd_client::Error) -> Self {
        RegistryError::Etcd(Box::new(e))
    }
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::SegmentNotFound(_) | RegistryError::BufferNotFound { .. }
        )
    }
}

/// A mount run halted in `state`. Side effects of earlier states stay in place.
#[derive(Debug, thiserror::Error)]
#[error("mount failed while {state}: {kind}")]
pub struct MountError {
    pub state: MountState,
    #[source]
    pub kind: MountErrorKind,
    /// States entered before halting, ending with [`MountState::Failed`].
    pub visited: Vec<MountState>,
    /// Commands run and their captured output, in order.
    pub diagnostics: Vec<String>,
}

impl MountError {
    pub(crate) fn halted(
        state: MountState,
        kind: MountErrorKind,
        mut visited: Vec<MountState>,
        diagnostics: Vec<String>,
    ) -> Self {
        visited.push(MountState::Failed);
        Self {
            state,
            kind,
            visited,
            diagnostics,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(&self.kind, MountErrorKind::Registry(e) if e.is_not_found())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountErrorKind {
    #[error("`{command}` exited with status {status}: {stderr}")]
    ExternalTool {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("`{command}` did not complete: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("no subsystem NQN configured or discovered at {address}")]
    MissingNqn { address: String },
    #[error("could not create mount point {}: {source}", path.display())]
    MountPoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
