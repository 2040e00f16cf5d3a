//! Hands a buffer address from a producer process to a consumer process.
//!
//! The payload is the decimal text of a single `u64`. A consumer's receive is
//! a one-shot: the listener task takes the first message off its
//! subscription, resolves the pending value with it and stops listening, so
//! readiness and the value are observed together.
pub mod memory;
pub mod nats;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::debug;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::RendezvousError;

pub use memory::MemoryBroker;
pub use nats::{NatsBroker, NatsBrokerConfig};

pub type Subscription = BoxStream<'static, Bytes>;

/// Point-to-point message broker with at-least-once delivery.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RendezvousError>;

    /// Messages published to `channel`, including ones published before the
    /// subscription was made and not yet consumed.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, RendezvousError>;
}

pub struct Rendezvous {
    broker: Arc<dyn Broker>,
    channel: String,
}

impl Rendezvous {
    pub fn new(broker: Arc<dyn Broker>, channel: impl Into<String>) -> Self {
        Self {
            broker,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, value: u64) -> Result<(), RendezvousError> {
        debug!("rendezvous {}: publishing {value}", self.channel);
        self.broker
            .publish(&self.channel, Bytes::from(value.to_string()))
            .await
    }

    /// Subscribes now and returns the value that will arrive.
    ///
    /// There is no timeout: awaiting a channel nobody publishes to never
    /// resolves. Dropping the pending value stops the listener.
    pub async fn listen(&self) -> Result<PendingValue, RendezvousError> {
        let mut subscription = self.broker.subscribe(&self.channel).await?;
        let (tx, rx) = oneshot::channel();
        let channel = self.channel.clone();
        let listener = tokio::spawn(async move {
            let result = match subscription.next().await {
                Some(payload) => parse_value(&payload),
                None => Err(RendezvousError::Closed),
            };
            debug!("rendezvous {channel}: received {result:?}");
            let _ = tx.send(result);
        });
        Ok(PendingValue { rx, listener })
    }

    pub async fn receive(&self) -> Result<u64, RendezvousError> {
        self.listen().await?.await
    }
}

pub struct PendingValue {
    rx: oneshot::Receiver<Result<u64, RendezvousError>>,
    listener: JoinHandle<()>,
}

impl Future for PendingValue {
    type Output = Result<u64, RendezvousError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RendezvousError::Closed)))
    }
}

impl Drop for PendingValue {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn parse_value(payload: &[u8]) -> Result<u64, RendezvousError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| RendezvousError::InvalidPayload(String::from_utf8_lossy(payload).into_owned()))?;
    text.trim()
        .parse()
        .map_err(|_| RendezvousError::InvalidPayload(text.to_string()))
}
