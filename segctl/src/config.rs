use anyhow::{Context, Result};
use libsegment::EtcdConfig;
use libtransfer::rendezvous::NatsBrokerConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_ENV: &str = "SEGCTL_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub nvmeof: NvmeofConfig,
    /// Overrides the OS host name used as this node's server name
    pub host_name: Option<String>,
}

impl Config {
    pub fn host_name(&self) -> String {
        self.host_name
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            stream: default_stream(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

impl BrokerConfig {
    pub fn nats(&self) -> NatsBrokerConfig {
        NatsBrokerConfig {
            server_url: self.url.clone(),
            stream: self.stream.clone(),
            subject_prefix: self.subject_prefix.clone(),
        }
    }
}

fn default_broker_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_stream() -> String {
    "mooncake-rendezvous".to_string()
}

fn default_subject_prefix() -> String {
    "rendezvous".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NvmeofConfig {
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_service_id")]
    pub service_id: u16,
    pub nqn: Option<String>,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for NvmeofConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            service_id: default_service_id(),
            nqn: None,
            device: default_device(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

impl NvmeofConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_service_id() -> u16 {
    4420
}

fn default_device() -> String {
    "/dev/nvme0n1".to_string()
}

fn default_tool_timeout_secs() -> u64 {
    60
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

/// `--config` first, then `$SEGCTL_CONFIG`, else built-in defaults.
pub fn resolve_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => Some(p.to_string_lossy().into_owned()),
        None => std::env::var(CONFIG_ENV).ok().filter(|p| !p.is_empty()),
    };
    match path {
        Some(p) => load_config(&p),
        None => Ok(Config::default()),
    }
}
