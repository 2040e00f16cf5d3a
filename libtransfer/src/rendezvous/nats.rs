//! NATS JetStream broker.
//!
//! Channels map to subjects `<subject_prefix>.<channel>` inside one work-queue
//! stream, so a value published before the consumer subscribes is kept until
//! it is consumed. Each channel gets a durable pull consumer; messages are
//! acknowledged when handed to the subscriber.
use async_nats::jetstream::{self, consumer::PullConsumer, stream::RetentionPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::{info, warn};

use super::{Broker, Subscription};
use crate::error::RendezvousError;

#[derive(Debug, Clone)]
pub struct NatsBrokerConfig {
    /// e.g. "nats://localhost:4222"
    pub server_url: String,
    pub stream: String,
    pub subject_prefix: String,
}

impl NatsBrokerConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            stream: "mooncake-rendezvous".to_string(),
            subject_prefix: "rendezvous".to_string(),
        }
    }

    fn subject(&self, channel: &str) -> String {
        format!("{}.{}", self.subject_prefix, channel)
    }
}

pub struct NatsBroker {
    js: jetstream::Context,
    config: NatsBrokerConfig,
}

impl NatsBroker {
    pub async fn connect(config: NatsBrokerConfig) -> Result<Self, RendezvousError> {
        let client = async_nats::connect(config.server_url.as_str())
            .await
            .map_err(broker_error)?;
        let js = jetstream::new(client);
        js.get_or_create_stream(jetstream::stream::Config {
            name: config.stream.clone(),
            subjects: vec![format!("{}.>", config.subject_prefix)],
            retention: RetentionPolicy::WorkQueue,
            ..Default::default()
        })
        .await
        .map_err(broker_error)?;
        info!(
            "connected to {} (stream {})",
            config.server_url, config.stream
        );
        Ok(Self { js, config })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), RendezvousError> {
        self.js
            .publish(self.config.subject(channel), payload)
            .await
            .map_err(broker_error)?
            .await
            .map_err(broker_error)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, RendezvousError> {
        let stream = self
            .js
            .get_stream(&self.config.stream)
            .await
            .map_err(broker_error)?;
        let durable = consumer_name(channel);
        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &durable,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: self.config.subject(channel),
                    ..Default::default()
                },
            )
            .await
            .map_err(broker_error)?;
        let messages = consumer.messages().await.map_err(broker_error)?;

        Ok(messages
            .filter_map(|message| async move {
                match message {
                    Ok(message) => {
                        if let Err(e) = message.ack().await {
                            warn!("failed to ack rendezvous message: {e}");
                        }
                        Some(message.payload.clone())
                    }
                    Err(e) => {
                        warn!("rendezvous consumer error: {e}");
                        None
                    }
                }
            })
            .boxed())
    }
}

/// Durable names allow only a restricted alphabet; hex keeps distinct
/// channels distinct.
fn consumer_name(channel: &str) -> String {
    format!("rendezvous-{}", hex::encode(channel))
}

fn broker_error(e: impl std::fmt::Display) -> RendezvousError {
    RendezvousError::Broker(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::Rendezvous;
    use std::sync::Arc;

    #[test]
    fn test_subject_and_consumer_names() {
        let cfg = NatsBrokerConfig::new("nats://127.0.0.1:4222");
        assert_eq!(cfg.subject("ptr"), "rendezvous.ptr");
        assert_eq!(consumer_name("ptr"), "rendezvous-707472");
        assert_eq!(consumer_name("job.7"), "rendezvous-6a6f622e37");
    }

    #[test]
    fn test_consumer_names_do_not_collide() {
        let names: std::collections::HashSet<String> = ["a.b", "a_b", "a/b", "a-b", "ab"]
            .into_iter()
            .map(consumer_name)
            .collect();
        assert_eq!(names.len(), 5);
        assert!(names.iter().all(|n| n
            .trim_start_matches("rendezvous-")
            .chars()
            .all(|c| c.is_ascii_hexdigit())));
    }

    #[tokio::test]
    #[ignore = "requires a NATS server with JetStream on 127.0.0.1:4222"]
    async fn test_nats_round_trip() {
        let broker = NatsBroker::connect(NatsBrokerConfig::new("nats://127.0.0.1:4222"))
            .await
            .expect("failed to connect nats");
        let broker: Arc<dyn Broker> = Arc::new(broker);
        let channel = format!("it-{}", std::process::id());
        Rendezvous::new(broker.clone(), channel.as_str())
            .publish(123456)
            .await
            .unwrap();
        let value = Rendezvous::new(broker, channel.as_str())
            .receive()
            .await
            .unwrap();
        assert_eq!(value, 123456);
    }
}
