use std::sync::Arc;
use std::time::Duration;

use common::{Protocol, Segment, segment_key};
use log::{debug, info, warn};
use rand::Rng;
use tokio::time::sleep;

use crate::error::RegistryError;
use crate::store::KvStore;

/// Consecutive swaps that may fail while the stored revision stays put before
/// giving up with [`RegistryError::Conflict`]. A swap that lost to another
/// writer moves the revision and does not count.
pub const RACE_RETRIES: usize = 10;
/// Upper bound on swaps for one update, however busy the key is.
pub const MAX_SWAP_ATTEMPTS: usize = 1024;
const RETRY_BACKOFF_MS: u64 = 5;
const MAX_BACKOFF_STEPS: usize = 8;

/// Segment documents stored as whole JSON values, one key per server name.
#[derive(Clone)]
pub struct SegmentRegistry {
    store: Arc<dyn KvStore>,
    namespace: String,
    default_protocol: Protocol,
}

impl SegmentRegistry {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            default_protocol: Protocol::NvmeOf,
        }
    }

    /// Protocol family bare segment names resolve under.
    pub fn with_default_protocol(mut self, protocol: Protocol) -> Self {
        self.default_protocol = protocol;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// A name starting with `/` is taken as a full key.
    pub fn key_for(&self, segment_name: &str) -> String {
        if segment_name.starts_with('/') {
            segment_name.to_string()
        } else {
            segment_key(&self.namespace, self.default_protocol, segment_name)
        }
    }

    /// Writes `segment` over whatever is stored under its key and returns the key.
    pub async fn register(&self, segment: &Segment) -> Result<String, RegistryError> {
        segment.validate()?;
        let key = segment.key(&self.namespace);
        if let Some((previous, _)) = self.read(&key).await? {
            let dropped = previous.mount_count();
            if dropped > 0 {
                warn!("replacing segment {key} discards {dropped} mount entries");
            }
        }
        self.store.put(&key, segment.to_json()?).await?;
        info!(
            "registered segment {key} with {} buffers",
            segment.buffers.len()
        );
        Ok(key)
    }

    /// Like [`register`](Self::register) but keeps mount entries of buffers
    /// whose `file_path` and `length` are unchanged. Returns the key and the
    /// document as stored.
    pub async fn register_preserving_mounts(
        &self,
        segment: &Segment,
    ) -> Result<(String, Segment), RegistryError> {
        segment.validate()?;
        let key = segment.key(&self.namespace);
        let mut retry = SwapRetry::default();
        loop {
            let current = self.read(&key).await?;
            retry.begin(&key, current.as_ref().map_or(0, |(_, rev)| *rev))?;
            let mut merged = segment.clone();
            let expected_revision = match &current {
                Some((previous, rev)) => {
                    carry_mounts(previous, &mut merged);
                    if previous == &merged {
                        debug!("segment {key} already up to date");
                        return Ok((key, merged));
                    }
                    *rev
                }
                None => 0,
            };
            if self
                .store
                .compare_and_put(&key, merged.to_json()?, expected_revision)
                .await?
            {
                info!(
                    "registered segment {key} with {} buffers, {} mount entries kept",
                    merged.buffers.len(),
                    merged.mount_count()
                );
                return Ok((key, merged));
            }
            retry.backoff(&key).await;
        }
    }

    /// A miss is `Ok(None)`.
    pub async fn lookup(&self, segment_name: &str) -> Result<Option<Segment>, RegistryError> {
        let key = self.key_for(segment_name);
        Ok(self.read(&key).await?.map(|(segment, _)| segment))
    }

    /// Sets `consumer_host -> local_path` on the buffer named `file_path` and
    /// returns the document as written. The whole document is swapped on the
    /// revision it was read at, so concurrent updates for other hosts are
    /// never lost.
    pub async fn update_buffer_mount(
        &self,
        segment_name: &str,
        file_path: &str,
        consumer_host: &str,
        local_path: &str,
    ) -> Result<Segment, RegistryError> {
        let key = self.key_for(segment_name);
        let mut retry = SwapRetry::default();
        loop {
            let (mut segment, rev) = self
                .read(&key)
                .await?
                .ok_or_else(|| RegistryError::SegmentNotFound(segment_name.to_string()))?;
            retry.begin(&key, rev)?;
            let buffer =
                segment
                    .buffer_mut(file_path)
                    .ok_or_else(|| RegistryError::BufferNotFound {
                        segment: segment_name.to_string(),
                        file_path: file_path.to_string(),
                    })?;
            if buffer.local_path_map.get(consumer_host).map(String::as_str) == Some(local_path) {
                debug!("{consumer_host} already maps {file_path} of {key} to {local_path}");
                return Ok(segment);
            }
            buffer
                .local_path_map
                .insert(consumer_host.to_string(), local_path.to_string());

            if self
                .store
                .compare_and_put(&key, segment.to_json()?, rev)
                .await?
            {
                info!("mapped {file_path} of {key} to {consumer_host}:{local_path}");
                return Ok(segment);
            }
            retry.backoff(&key).await;
        }
    }

    /// Deletes the document; returns whether one existed.
    pub async fn remove(&self, segment_name: &str) -> Result<bool, RegistryError> {
        let key = self.key_for(segment_name);
        let removed = self.store.delete(&key).await?;
        if removed {
            info!("removed segment {key}");
        }
        Ok(removed)
    }

    /// Server names registered under the default protocol family.
    pub async fn list(&self) -> Result<Vec<String>, RegistryError> {
        let prefix = format!("{}/", self.key_for("").trim_end_matches('/'));
        let entries = self.store.list_prefix(&prefix).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| {
                let rest = key.strip_prefix(&prefix)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    async fn read(&self, key: &str) -> Result<Option<(Segment, i64)>, RegistryError> {
        let Some(versioned) = self.store.get(key).await? else {
            return Ok(None);
        };
        let segment = Segment::from_json(key, &versioned.value).map_err(|source| {
            RegistryError::InvalidDocument {
                key: key.to_string(),
                source,
            }
        })?;
        Ok(Some((segment, versioned.mod_revision)))
    }
}

fn carry_mounts(previous: &Segment, next: &mut Segment) {
    for buffer in &mut next.buffers {
        if let Some(old) = previous.buffer(&buffer.file_path) {
            if old.length == buffer.length {
                for (host, path) in &old.local_path_map {
                    buffer
                        .local_path_map
                        .entry(host.clone())
                        .or_insert_with(|| path.clone());
                }
            }
        }
    }
}

/// Bookkeeping for one read-modify-write loop. A failed swap means some other
/// swap landed, so the loop runs on while the revision it reads keeps moving.
#[derive(Default)]
struct SwapRetry {
    attempts: usize,
    stalled: usize,
    last_revision: Option<i64>,
}

impl SwapRetry {
    /// Records the revision an attempt is based on.
    fn begin(&mut self, key: &str, revision: i64) -> Result<(), RegistryError> {
        if self.last_revision == Some(revision) {
            self.stalled += 1;
        } else {
            self.stalled = 0;
        }
        self.last_revision = Some(revision);
        if self.stalled >= RACE_RETRIES || self.attempts >= MAX_SWAP_ATTEMPTS {
            return Err(RegistryError::Conflict {
                key: key.to_string(),
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        Ok(())
    }

    /// Sleeps a random slice of a window that grows with the attempt count,
    /// so writers that collided once spread out.
    async fn backoff(&self, key: &str) {
        let window = RETRY_BACKOFF_MS * self.attempts.min(MAX_BACKOFF_STEPS) as u64;
        let delay = rand::rng().random_range(1..=window.max(1));
        debug!(
            "segment {key} changed underneath us, retry {} in {delay}ms",
            self.attempts + 1
        );
        sleep(Duration::from_millis(delay)).await;
    }
}
