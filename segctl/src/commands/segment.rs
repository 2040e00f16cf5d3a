use anyhow::{Result, bail};
use common::Segment;
use libsegment::SegmentRegistry;

pub async fn show(registry: &SegmentRegistry, name: &str) -> Result<Segment> {
    match registry.lookup(name).await? {
        Some(segment) => Ok(segment),
        None => bail!("segment {name} not found under {}", registry.key_for(name)),
    }
}

pub async fn list(registry: &SegmentRegistry) -> Result<Vec<String>> {
    Ok(registry.list().await?)
}

pub async fn remove(registry: &SegmentRegistry, name: &str) -> Result<()> {
    if !registry.remove(name).await? {
        bail!("segment {name} not found under {}", registry.key_for(name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BufferDescriptor, Protocol};
    use libsegment::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_show_list_remove() {
        let registry = SegmentRegistry::new(Arc::new(MemoryStore::new()), "/mooncake");
        let seg = Segment::new("optane12", Protocol::NvmeOf)
            .with_buffer(BufferDescriptor::new("/mnt/data/a.bin", 100));
        registry.register(&seg).await.unwrap();

        assert_eq!(show(&registry, "optane12").await.unwrap(), seg);
        assert_eq!(list(&registry).await.unwrap(), vec!["optane12"]);
        remove(&registry, "optane12").await.unwrap();

        let err = show(&registry, "optane12").await.unwrap_err();
        assert!(err.to_string().contains("/mooncake/nvmeof/optane12"));
        assert!(remove(&registry, "optane12").await.is_err());
        assert!(list(&registry).await.unwrap().is_empty());
    }
}
