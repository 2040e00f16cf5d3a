mod cli;
mod commands;
mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, RendezvousAction};
use commands::mount::MountOverrides;
use config::{Config, resolve_config};
use libsegment::{EtcdStore, MountOrchestrator, SegmentRegistry, SystemExecutor};
use libtransfer::Rendezvous;
use libtransfer::rendezvous::NatsBroker;
use log::error;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Register { files, keep_mounts } => {
            let segment = commands::register::build_segment(&cfg.host_name(), &files).await?;
            let registry = connect_registry(&cfg).await?;
            let (key, stored) = commands::register::register(&registry, &segment, keep_mounts).await?;
            println!("{key}");
            println!("{}", serde_json::to_string(&stored)?);
        }
        Commands::Mount {
            segment,
            file_path,
            local_path,
            host,
            nqn,
            device,
            transport,
            service_id,
            address,
        } => {
            let request = commands::mount::build_request(
                segment,
                file_path,
                local_path,
                cfg.host_name(),
                &cfg.nvmeof,
                MountOverrides {
                    host,
                    nqn,
                    device,
                    transport,
                    service_id,
                    address,
                },
            );
            let registry = connect_registry(&cfg).await?;
            let orchestrator = MountOrchestrator::new(registry, Arc::new(SystemExecutor::default()))
                .with_tool_timeout(cfg.nvmeof.tool_timeout());
            let report = commands::mount::mount(&orchestrator, &request).await?;
            for line in &report.transcript {
                println!("{line}");
            }
            println!("{}", serde_json::to_string(&report.segment)?);
        }
        Commands::Show { segment } => {
            let registry = connect_registry(&cfg).await?;
            let doc = commands::segment::show(&registry, &segment).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::List => {
            let registry = connect_registry(&cfg).await?;
            for name in commands::segment::list(&registry).await? {
                println!("{name}");
            }
        }
        Commands::Remove { segment } => {
            let registry = connect_registry(&cfg).await?;
            commands::segment::remove(&registry, &segment).await?;
            println!("removed {}", registry.key_for(&segment));
        }
        Commands::Rendezvous { action } => {
            let broker = Arc::new(
                NatsBroker::connect(cfg.broker.nats())
                    .await
                    .with_context(|| format!("Failed to connect to broker {}", cfg.broker.url))?,
            );
            match action {
                RendezvousAction::Publish { channel, value } => {
                    let rendezvous = Rendezvous::new(broker, channel);
                    commands::rendezvous::publish(&rendezvous, value).await?;
                }
                RendezvousAction::Receive { channel } => {
                    let rendezvous = Rendezvous::new(broker, channel);
                    let value = commands::rendezvous::receive(&rendezvous).await?;
                    println!("{value}");
                }
            }
        }
    }

    Ok(())
}

async fn connect_registry(cfg: &Config) -> Result<SegmentRegistry> {
    let store = EtcdStore::connect(&cfg.etcd)
        .await
        .with_context(|| format!("Failed to connect to etcd at {:?}", cfg.etcd.endpoints))?;
    Ok(SegmentRegistry::new(Arc::new(store), cfg.etcd.namespace.clone()))
}
