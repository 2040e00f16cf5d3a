//! Mounting a remote segment buffer on a consumer host.
//!
//! DISCOVERING -> CONNECTING -> MOUNTING -> REGISTERING -> DONE, moving to
//! FAILED from whichever state hits the first error. Nothing is rolled back: a failure
//! while REGISTERING leaves the OS mount in place for the operator to clean up.
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::Segment;
use log::{debug, error, info};

use crate::error::{MountError, MountErrorKind, RegistryError};
use crate::executor::{CommandExecutor, CommandOutput, CommandSpec};
use crate::registry::SegmentRegistry;

const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Discovering,
    Connecting,
    Mounting,
    Registering,
    Done,
    Failed,
}

impl MountState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MountState::Done | MountState::Failed)
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountState::Discovering => "DISCOVERING",
            MountState::Connecting => "CONNECTING",
            MountState::Mounting => "MOUNTING",
            MountState::Registering => "REGISTERING",
            MountState::Done => "DONE",
            MountState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Where and how to reach the NVMe-oF subsystem exporting the segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeofTarget {
    pub transport: String,
    /// Defaults to the segment's server name.
    pub address: Option<String>,
    pub service_id: u16,
    /// Taken from the discovery log when unset.
    pub nqn: Option<String>,
}

impl Default for NvmeofTarget {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            address: None,
            service_id: 4420,
            nqn: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountRequest {
    pub segment_name: String,
    pub file_path: String,
    pub consumer_host: String,
    pub local_path: PathBuf,
    pub device: String,
    pub target: NvmeofTarget,
}

#[derive(Debug, Clone)]
pub struct MountReport {
    pub visited: Vec<MountState>,
    /// Each command with its captured output, in order.
    pub transcript: Vec<String>,
    /// The segment as written by the final registry update.
    pub segment: Segment,
}

struct MountRun<'a> {
    request: &'a MountRequest,
    local_path: &'a str,
    address: String,
    nqn: Option<String>,
    transcript: Vec<String>,
    segment: Option<Segment>,
}

pub struct MountOrchestrator {
    registry: SegmentRegistry,
    executor: Arc<dyn CommandExecutor>,
    tool_timeout: Duration,
}

impl MountOrchestrator {
    pub fn new(registry: SegmentRegistry, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            registry,
            executor,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    pub async fn mount(&self, request: &MountRequest) -> Result<MountReport, MountError> {
        let halt_early = |kind: MountErrorKind| {
            MountError::halted(
                MountState::Discovering,
                kind,
                vec![MountState::Discovering],
                Vec::new(),
            )
        };
        // recorded verbatim in the registry
        let local_path = request.local_path.to_str().ok_or_else(|| {
            halt_early(MountErrorKind::MountPoint {
                path: request.local_path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "path is not valid UTF-8"),
            })
        })?;
        let segment = self
            .preflight(request)
            .await
            .map_err(|e| halt_early(e.into()))?;

        let mut run = MountRun {
            request,
            local_path,
            address: request
                .target
                .address
                .clone()
                .unwrap_or_else(|| segment.server_name.clone()),
            nqn: request.target.nqn.clone(),
            transcript: Vec::new(),
            segment: None,
        };
        let mut visited = Vec::new();
        let mut state = MountState::Discovering;

        while !state.is_terminal() {
            visited.push(state);
            debug!("mount of {} entering {state}", request.file_path);
            state = match self.step(state, &mut run).await {
                Ok(next) => next,
                Err(kind) => {
                    error!("mount of {} failed while {state}: {kind}", request.file_path);
                    return Err(MountError::halted(state, kind, visited, run.transcript));
                }
            };
        }

        let Some(segment) = run.segment.take() else {
            let kind = RegistryError::SegmentNotFound(request.segment_name.clone()).into();
            return Err(MountError::halted(
                MountState::Registering,
                kind,
                visited,
                run.transcript,
            ));
        };
        visited.push(MountState::Done);
        info!(
            "mounted {} of {} at {} for {}",
            request.file_path,
            request.segment_name,
            request.local_path.display(),
            request.consumer_host
        );
        Ok(MountReport {
            visited,
            transcript: run.transcript,
            segment,
        })
    }

    async fn preflight(&self, request: &MountRequest) -> Result<Segment, RegistryError> {
        let segment = self
            .registry
            .lookup(&request.segment_name)
            .await?
            .ok_or_else(|| RegistryError::SegmentNotFound(request.segment_name.clone()))?;
        if segment.buffer(&request.file_path).is_none() {
            return Err(RegistryError::BufferNotFound {
                segment: request.segment_name.clone(),
                file_path: request.file_path.clone(),
            });
        }
        Ok(segment)
    }

    async fn step(
        &self,
        state: MountState,
        run: &mut MountRun<'_>,
    ) -> Result<MountState, MountErrorKind> {
        let request = run.request;
        let target = &request.target;
        match state {
            MountState::Discovering => {
                let spec = self.command(
                    "nvme",
                    [
                        "discover".to_string(),
                        "-t".to_string(),
                        target.transport.clone(),
                        "-a".to_string(),
                        run.address.clone(),
                        "-s".to_string(),
                        target.service_id.to_string(),
                    ],
                );
                let output = self.run_tool(&spec, run).await?;
                if run.nqn.is_none() {
                    run.nqn = subsystem_nqn(&output.stdout);
                }
                Ok(MountState::Connecting)
            }
            MountState::Connecting => {
                let nqn = run.nqn.clone().ok_or_else(|| MountErrorKind::MissingNqn {
                    address: run.address.clone(),
                })?;
                let spec = self.command(
                    "nvme",
                    [
                        "connect".to_string(),
                        "-t".to_string(),
                        target.transport.clone(),
                        "-n".to_string(),
                        nqn,
                        "-a".to_string(),
                        run.address.clone(),
                        "-s".to_string(),
                        target.service_id.to_string(),
                    ],
                );
                self.run_tool(&spec, run).await?;
                Ok(MountState::Mounting)
            }
            MountState::Mounting => {
                tokio::fs::create_dir_all(&request.local_path)
                    .await
                    .map_err(|source| MountErrorKind::MountPoint {
                        path: request.local_path.clone(),
                        source,
                    })?;
                let spec = self.command(
                    "mount",
                    [
                        request.device.clone(),
                        run.local_path.to_string(),
                    ],
                );
                self.run_tool(&spec, run).await?;
                Ok(MountState::Registering)
            }
            MountState::Registering => {
                let segment = self
                    .registry
                    .update_buffer_mount(
                        &request.segment_name,
                        &request.file_path,
                        &request.consumer_host,
                        run.local_path,
                    )
                    .await?;
                run.segment = Some(segment);
                Ok(MountState::Done)
            }
            MountState::Done | MountState::Failed => Ok(state),
        }
    }

    fn command<const N: usize>(&self, program: &str, args: [String; N]) -> CommandSpec {
        CommandSpec::new(program, args, self.tool_timeout)
    }

    async fn run_tool(
        &self,
        spec: &CommandSpec,
        run: &mut MountRun<'_>,
    ) -> Result<CommandOutput, MountErrorKind> {
        let command = spec.to_string();
        let output = match self.executor.run(spec).await {
            Ok(output) => output,
            Err(source) => {
                run.transcript.push(format!("$ {command}\n{source}"));
                return Err(MountErrorKind::Spawn { command, source });
            }
        };
        debug!("`{command}` exited with {}", output.status);
        run.transcript.push(format!(
            "$ {command}\n{}{}",
            output.stdout, output.stderr
        ));
        if !output.success() {
            return Err(MountErrorKind::ExternalTool {
                command,
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// First non-discovery subsystem NQN in `nvme discover` output.
fn subsystem_nqn(discovery_log: &str) -> Option<String> {
    discovery_log
        .lines()
        .filter_map(|line| line.trim().strip_prefix("subnqn:"))
        .map(str::trim)
        .find(|nqn| !nqn.is_empty() && *nqn != DISCOVERY_NQN)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use common::{BufferDescriptor, Protocol};

    use super::*;
    use crate::executor::ScriptedExecutor;
    use crate::store::MemoryStore;

    const DISCOVERY_LOG: &str = "\
Discovery Log Number of Records 2, Generation counter 4
=====Discovery Log Entry 0======
trtype:  tcp
subnqn:  nqn.2014-08.org.nvmexpress.discovery
=====Discovery Log Entry 1======
trtype:  tcp
subnqn:  nqn.2024-06.io.mooncake:optane12
";

    async fn setup() -> (SegmentRegistry, Arc<ScriptedExecutor>) {
        let registry = SegmentRegistry::new(Arc::new(MemoryStore::new()), "/mooncake");
        registry
            .register(
                &Segment::new("optane12", Protocol::NvmeOf)
                    .with_buffer(BufferDescriptor::new("/mnt/data/a.bin", 100)),
            )
            .await
            .unwrap();
        (registry, Arc::new(ScriptedExecutor::new()))
    }

    fn request(local_path: PathBuf) -> MountRequest {
        MountRequest {
            segment_name: "optane12".to_string(),
            file_path: "/mnt/data/a.bin".to_string(),
            consumer_host: "nodeB".to_string(),
            local_path,
            device: "/dev/nvme1n1".to_string(),
            target: NvmeofTarget::default(),
        }
    }

    #[tokio::test]
    async fn test_mount_runs_every_state() {
        let dir = tempfile::tempdir().unwrap();
        let mount_point = dir.path().join("x");
        let (registry, exec) = setup().await;
        exec.push_output(CommandOutput::ok(DISCOVERY_LOG));

        let orchestrator = MountOrchestrator::new(registry.clone(), exec.clone());
        let report = orchestrator
            .mount(&request(mount_point.clone()))
            .await
            .unwrap();

        assert_eq!(
            report.visited,
            vec![
                MountState::Discovering,
                MountState::Connecting,
                MountState::Mounting,
                MountState::Registering,
                MountState::Done
            ]
        );
        let commands: Vec<String> = exec.calls().iter().map(ToString::to_string).collect();
        assert_eq!(
            commands,
            vec![
                "nvme discover -t tcp -a optane12 -s 4420".to_string(),
                "nvme connect -t tcp -n nqn.2024-06.io.mooncake:optane12 -a optane12 -s 4420"
                    .to_string(),
                format!("mount /dev/nvme1n1 {}", mount_point.display()),
            ]
        );
        assert_eq!(report.transcript.len(), 3);
        assert!(mount_point.is_dir());

        let stored = registry.lookup("optane12").await.unwrap().unwrap();
        assert_eq!(stored, report.segment);
        assert_eq!(
            stored.buffer("/mnt/data/a.bin").unwrap().local_path_map["nodeB"],
            mount_point.to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_explicit_target_overrides_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, exec) = setup().await;
        let mut req = request(dir.path().join("x"));
        req.target = NvmeofTarget {
            transport: "rdma".to_string(),
            address: Some("10.0.0.12".to_string()),
            service_id: 4421,
            nqn: Some("nqn.test:a".to_string()),
        };
        MountOrchestrator::new(registry, exec.clone())
            .mount(&req)
            .await
            .unwrap();
        let calls = exec.calls();
        assert_eq!(
            calls[1].to_string(),
            "nvme connect -t rdma -n nqn.test:a -a 10.0.0.12 -s 4421"
        );
    }

    #[tokio::test]
    async fn test_discover_failure_halts() {
        let dir = tempfile::tempdir().unwrap();
        let mount_point = dir.path().join("x");
        let (registry, exec) = setup().await;
        exec.push_output(CommandOutput::failed(1, "failed to connect: no route to host\n"));

        let err = MountOrchestrator::new(registry.clone(), exec.clone())
            .mount(&request(mount_point.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.state, MountState::Discovering);
        assert_eq!(
            err.visited,
            vec![MountState::Discovering, MountState::Failed]
        );
        match &err.kind {
            MountErrorKind::ExternalTool { status, stderr, .. } => {
                assert_eq!(*status, 1);
                assert_eq!(stderr, "failed to connect: no route to host");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(err.diagnostics.len(), 1);
        assert!(err.diagnostics[0].contains("no route to host"));
        assert_eq!(exec.calls().len(), 1);
        assert!(!mount_point.exists());
        let stored = registry.lookup("optane12").await.unwrap().unwrap();
        assert_eq!(stored.mount_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_nqn_fails_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, exec) = setup().await;
        exec.push_output(CommandOutput::ok("Discovery Log Number of Records 0\n"));
        let err = MountOrchestrator::new(registry, exec.clone())
            .mount(&request(dir.path().join("x")))
            .await
            .unwrap_err();
        assert_eq!(err.state, MountState::Connecting);
        assert!(matches!(err.kind, MountErrorKind::MissingNqn { .. }));
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_mount_tool_failure_keeps_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, exec) = setup().await;
        exec.push_output(CommandOutput::ok(DISCOVERY_LOG))
            .push_output(CommandOutput::ok("connected"))
            .push_output(CommandOutput::failed(32, "mount: wrong fs type"));
        let err = MountOrchestrator::new(registry, exec)
            .mount(&request(dir.path().join("x")))
            .await
            .unwrap_err();
        assert_eq!(err.state, MountState::Mounting);
        assert_eq!(
            err.visited,
            vec![
                MountState::Discovering,
                MountState::Connecting,
                MountState::Mounting,
                MountState::Failed
            ]
        );
        assert_eq!(err.diagnostics.len(), 3);
        assert!(err.to_string().contains("MOUNTING"));
    }

    #[tokio::test]
    async fn test_tool_timeout_is_state_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, exec) = setup().await;
        exec.push_output(CommandOutput::ok(DISCOVERY_LOG))
            .push_error(io::ErrorKind::TimedOut, "took too long");
        let err = MountOrchestrator::new(registry, exec)
            .mount(&request(dir.path().join("x")))
            .await
            .unwrap_err();
        assert_eq!(err.state, MountState::Connecting);
        assert!(matches!(err.kind, MountErrorKind::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_preflight_rejects_unknown_targets() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, exec) = setup().await;
        let orchestrator = MountOrchestrator::new(registry, exec.clone());

        let mut req = request(dir.path().join("x"));
        req.segment_name = "nobody".to_string();
        let err = orchestrator.mount(&req).await.unwrap_err();
        assert!(err.is_not_found());

        let mut req = request(dir.path().join("x"));
        req.file_path = "/mnt/data/zzz.bin".to_string();
        let err = orchestrator.mount(&req).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(exec.calls().is_empty());
    }

    /// Re-registers the segment without its buffer while the mount runs.
    struct DroppingExecutor {
        registry: SegmentRegistry,
    }

    #[async_trait]
    impl CommandExecutor for DroppingExecutor {
        async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
            if spec.program == "mount" {
                self.registry
                    .register(&Segment::new("optane12", Protocol::NvmeOf))
                    .await
                    .map_err(io::Error::other)?;
                return Ok(CommandOutput::ok(""));
            }
            Ok(CommandOutput::ok(DISCOVERY_LOG))
        }
    }

    #[tokio::test]
    async fn test_buffer_removed_during_mount_fails_registering() {
        let dir = tempfile::tempdir().unwrap();
        let mount_point = dir.path().join("x");
        let (registry, _) = setup().await;
        let exec = Arc::new(DroppingExecutor {
            registry: registry.clone(),
        });
        let err = MountOrchestrator::new(registry.clone(), exec)
            .mount(&request(mount_point.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.state, MountState::Registering);
        assert!(matches!(
            err.kind,
            MountErrorKind::Registry(RegistryError::BufferNotFound { .. })
        ));
        // the mount point is left behind
        assert!(mount_point.is_dir());
        let stored = registry.lookup("optane12").await.unwrap().unwrap();
        assert!(stored.buffers.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_mount_point_rejected_before_any_tool() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let mount_point = dir.path().join(OsStr::from_bytes(b"mnt\xff"));
        let (registry, exec) = setup().await;
        let err = MountOrchestrator::new(registry.clone(), exec.clone())
            .mount(&request(mount_point.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.state, MountState::Discovering);
        assert_eq!(
            err.visited,
            vec![MountState::Discovering, MountState::Failed]
        );
        match &err.kind {
            MountErrorKind::MountPoint { path, source } => {
                assert_eq!(path, &mount_point);
                assert_eq!(source.kind(), io::ErrorKind::InvalidInput);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(exec.calls().is_empty());
        assert!(!mount_point.exists());
        let stored = registry.lookup("optane12").await.unwrap().unwrap();
        assert_eq!(stored.mount_count(), 0);
    }

    #[test]
    fn test_mount_state_terminal() {
        assert!(MountState::Done.is_terminal());
        assert!(MountState::Failed.is_terminal());
        assert!(!MountState::Registering.is_terminal());
    }

    #[test]
    fn test_subsystem_nqn() {
        assert_eq!(
            subsystem_nqn(DISCOVERY_LOG).as_deref(),
            Some("nqn.2024-06.io.mooncake:optane12")
        );
        assert_eq!(subsystem_nqn("subnqn: nqn.2014-08.org.nvmexpress.discovery"), None);
    }
}
