use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "segctl", version, about = "Segment registry and buffer mount CLI")]
pub struct Cli {
    /// YAML config file; defaults apply when omitted
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register the given files as this host's segment
    Register {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Keep existing mount entries of unchanged buffers
        #[arg(long)]
        keep_mounts: bool,
    },
    /// Mount a buffer of a remote segment and record the mapping
    Mount {
        segment: String,
        file_path: String,
        local_path: PathBuf,
        /// Consumer host name recorded in the segment
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        nqn: Option<String>,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        transport: Option<String>,
        #[arg(long)]
        service_id: Option<u16>,
        /// Target address; defaults to the segment's server name
        #[arg(long)]
        address: Option<String>,
    },
    /// Print a segment document
    Show { segment: String },
    /// List registered segments
    List,
    /// Delete a segment document
    Remove { segment: String },
    /// Pass a buffer address through the message broker
    Rendezvous {
        #[command(subcommand)]
        action: RendezvousAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum RendezvousAction {
    Publish { channel: String, value: u64 },
    Receive { channel: String },
}
