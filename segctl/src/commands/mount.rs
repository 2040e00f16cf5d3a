use std::path::PathBuf;

use anyhow::Result;
use libsegment::{MountOrchestrator, MountReport, MountRequest, NvmeofTarget};
use log::error;

use crate::config::NvmeofConfig;

/// Flags given on the command line; unset ones fall back to the config.
#[derive(Debug, Default)]
pub struct MountOverrides {
    pub host: Option<String>,
    pub nqn: Option<String>,
    pub device: Option<String>,
    pub transport: Option<String>,
    pub service_id: Option<u16>,
    pub address: Option<String>,
}

pub fn build_request(
    segment: String,
    file_path: String,
    local_path: PathBuf,
    default_host: String,
    nvmeof: &NvmeofConfig,
    overrides: MountOverrides,
) -> MountRequest {
    MountRequest {
        segment_name: segment,
        file_path,
        consumer_host: overrides.host.unwrap_or(default_host),
        local_path,
        device: overrides.device.unwrap_or_else(|| nvmeof.device.clone()),
        target: NvmeofTarget {
            transport: overrides
                .transport
                .unwrap_or_else(|| nvmeof.transport.clone()),
            address: overrides.address,
            service_id: overrides.service_id.unwrap_or(nvmeof.service_id),
            nqn: overrides.nqn.or_else(|| nvmeof.nqn.clone()),
        },
    }
}

pub async fn mount(
    orchestrator: &MountOrchestrator,
    request: &MountRequest,
) -> Result<MountReport> {
    match orchestrator.mount(request).await {
        Ok(report) => Ok(report),
        Err(e) => {
            for line in &e.diagnostics {
                error!("{line}");
            }
            Err(e.into())
        }
    }
}
