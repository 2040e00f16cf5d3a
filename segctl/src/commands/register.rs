use anyhow::{Context, Result};
use common::{BufferDescriptor, Protocol, Segment};
use libsegment::SegmentRegistry;
use std::path::PathBuf;

/// One buffer per file, sized from the file's current length.
pub async fn build_segment(host_name: &str, files: &[PathBuf]) -> Result<Segment> {
    let mut segment = Segment::new(host_name, Protocol::NvmeOf);
    for file in files {
        let meta = tokio::fs::metadata(file)
            .await
            .with_context(|| format!("Failed to stat {}", file.display()))?;
        segment = segment.with_buffer(BufferDescriptor::new(
            file.to_string_lossy().into_owned(),
            meta.len(),
        ));
    }
    segment.validate()?;
    Ok(segment)
}

pub async fn register(
    registry: &SegmentRegistry,
    segment: &Segment,
    keep_mounts: bool,
) -> Result<(String, Segment)> {
    if keep_mounts {
        Ok(registry.register_preserving_mounts(segment).await?)
    } else {
        let key = registry.register(segment).await?;
        Ok((key, segment.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsegment::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_build_segment_sizes_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, vec![0u8; 100]).unwrap();
        std::fs::write(&b, b"").unwrap();

        let segment = build_segment("optane12", &[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(segment.server_name, "optane12");
        assert_eq!(segment.protocol, Protocol::NvmeOf);
        assert_eq!(segment.buffers.len(), 2);
        assert_eq!(segment.buffer(&a.to_string_lossy()).unwrap().length, 100);
        assert_eq!(segment.buffer(&b.to_string_lossy()).unwrap().length, 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_segment("optane12", &[dir.path().join("missing")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to stat"));
    }

    #[tokio::test]
    async fn test_duplicate_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        std::fs::write(&a, b"x").unwrap();
        assert!(build_segment("optane12", &[a.clone(), a]).await.is_err());
    }

    #[tokio::test]
    async fn test_register_keep_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        std::fs::write(&a, vec![1u8; 10]).unwrap();
        let path = a.to_string_lossy().into_owned();

        let registry = SegmentRegistry::new(Arc::new(MemoryStore::new()), "/mooncake");
        let segment = build_segment("optane12", &[a.clone()]).await.unwrap();
        let (key, _) = register(&registry, &segment, false).await.unwrap();
        assert_eq!(key, "/mooncake/nvmeof/optane12");
        registry
            .update_buffer_mount("optane12", &path, "nodeB", "/mnt/x")
            .await
            .unwrap();

        let (_, stored) = register(&registry, &segment, true).await.unwrap();
        assert_eq!(stored.mount_count(), 1);
        let (_, stored) = register(&registry, &segment, false).await.unwrap();
        assert_eq!(stored.mount_count(), 0);
        assert_eq!(registry.lookup("optane12").await.unwrap(), Some(segment));
    }
}
