//! In-process broker: one FIFO queue per channel, each message consumed once.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Notify;

use super::{Broker, Subscription};
use crate::error::RendezvousError;

#[derive(Default)]
struct ChannelQueue {
    messages: Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

impl ChannelQueue {
    fn messages(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, Arc<ChannelQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, channel: &str) -> Arc<ChannelQueue> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    /// Messages published but not yet consumed.
    pub fn pending(&self, channel: &str) -> usize {
        self.queue(channel).messages().len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RendezvousError> {
        let queue = self.queue(channel);
        queue.messages().push_back(payload);
        queue.notify.notify_one();
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, RendezvousError> {
        let queue = self.queue(channel);
        Ok(futures::stream::unfold(queue, |queue| async move {
            loop {
                let next = queue.messages().pop_front();
                if let Some(payload) = next {
                    return Some((payload, queue));
                }
                queue.notify.notified().await;
            }
        })
        .boxed())
    }
}
