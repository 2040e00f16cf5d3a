use anyhow::{Context, Result};
use libtransfer::Rendezvous;
use log::info;

pub async fn publish(rendezvous: &Rendezvous, value: u64) -> Result<()> {
    rendezvous
        .publish(value)
        .await
        .with_context(|| format!("Failed to publish on {}", rendezvous.channel()))?;
    info!("published {value} on {}", rendezvous.channel());
    Ok(())
}

/// Blocks until a value arrives; there is no timeout.
pub async fn receive(rendezvous: &Rendezvous) -> Result<u64> {
    let value = rendezvous
        .receive()
        .await
        .with_context(|| format!("Failed to receive on {}", rendezvous.channel()))?;
    Ok(value)
}
