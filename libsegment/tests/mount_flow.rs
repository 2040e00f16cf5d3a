// tests/mount_flow.rs
use std::collections::BTreeMap;
use std::sync::Arc;

use common::{BufferDescriptor, Protocol, Segment};
use libsegment::{
    CommandOutput, MemoryStore, MountOrchestrator, MountRequest, MountState, NvmeofTarget,
    ScriptedExecutor, SegmentRegistry,
};

#[tokio::test]
async fn mount_records_consumer_path_and_nothing_else() {
    let dir = tempfile::tempdir().unwrap();
    let mount_point = dir.path().join("x");
    let local_path = mount_point.to_string_lossy().into_owned();

    let registry = SegmentRegistry::new(Arc::new(MemoryStore::new()), "/mooncake");
    let original = Segment::new("optane12", Protocol::NvmeOf)
        .with_buffer(BufferDescriptor::new("/mnt/data/a.bin", 100));
    registry.register(&original).await.unwrap();

    let exec = Arc::new(ScriptedExecutor::new());
    let orchestrator = MountOrchestrator::new(registry.clone(), exec.clone());
    let report = orchestrator
        .mount(&MountRequest {
            segment_name: "optane12".to_string(),
            file_path: "/mnt/data/a.bin".to_string(),
            consumer_host: "nodeB".to_string(),
            local_path: mount_point.clone(),
            device: "/dev/nvme0n1".to_string(),
            target: NvmeofTarget {
                nqn: Some("nqn.2024-06.io.mooncake:optane12".to_string()),
                ..NvmeofTarget::default()
            },
        })
        .await
        .unwrap();
    assert_eq!(report.visited.last(), Some(&MountState::Done));

    let stored = registry.lookup("optane12").await.unwrap().unwrap();
    let mut expected = original.clone();
    expected.buffers[0].local_path_map = BTreeMap::from([("nodeB".to_string(), local_path)]);
    assert_eq!(stored, expected);
    assert_eq!(stored.buffers[0].length, 100);
    assert_eq!(exec.calls().len(), 3);
}

#[tokio::test]
async fn failed_connect_leaves_registry_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let registry = SegmentRegistry::new(store, "/mooncake");
    let original = Segment::new("optane12", Protocol::NvmeOf)
        .with_buffer(BufferDescriptor::new("/mnt/data/a.bin", 100));
    registry.register(&original).await.unwrap();

    let exec = Arc::new(ScriptedExecutor::new());
    exec.push_output(CommandOutput::ok("subnqn: nqn.2024-06.io.mooncake:optane12\n"))
        .push_output(CommandOutput::failed(
            1,
            "Failed to write to /dev/nvme-fabrics: Connection refused",
        ));
    let err = MountOrchestrator::new(registry.clone(), exec)
        .mount(&MountRequest {
            segment_name: "/mooncake/nvmeof/optane12".to_string(),
            file_path: "/mnt/data/a.bin".to_string(),
            consumer_host: "nodeB".to_string(),
            local_path: dir.path().join("x"),
            device: "/dev/nvme0n1".to_string(),
            target: NvmeofTarget::default(),
        })
        .await
        .unwrap_err();

    assert_eq!(err.state, MountState::Connecting);
    assert_eq!(err.visited.last(), Some(&MountState::Failed));
    assert!(err.diagnostics.join("\n").contains("Connection refused"));
    assert_eq!(registry.lookup("optane12").await.unwrap(), Some(original));
}
