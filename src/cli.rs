use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "ziprelay")]
#[command(version)]
#[command(about = "Streaming ZIP extraction relay with live progress", long_about = None)]
#[command(after_help = "Examples:\n  \
  ziprelay --listen 0.0.0.0:8080 --storage-url http://storage:9000 --bucket media\n  \
  ziprelay                       local run against the in-memory backend\n  \
  RUST_LOG=ziprelay=debug ziprelay   verbose pipeline logging")]
pub struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Object storage base URL (omit to use the in-memory backend)
    #[arg(long)]
    pub storage_url: Option<String>,

    /// Storage bucket name
    #[arg(long, default_value = "ziprelay")]
    pub bucket: String,

    /// Object prefix for client-staged archives
    #[arg(long, default_value = "incoming")]
    pub incoming_prefix: String,

    /// Object prefix for extracted members
    #[arg(long, default_value = "unzipped")]
    pub dest_prefix: String,

    /// Upload grant validity in seconds
    #[arg(long, default_value_t = 900)]
    pub grant_ttl_secs: u64,

    /// Maximum concurrent member uploads per archive
    #[arg(long, default_value_t = 16)]
    pub max_in_flight: usize,

    /// How long a finished session's event log is kept, in seconds
    #[arg(long, default_value_t = 600)]
    pub session_retention_secs: u64,
}

impl Cli {
    pub fn grant_ttl(&self) -> Duration {
        Duration::from_secs(self.grant_ttl_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }
}
