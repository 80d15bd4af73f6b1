//! Tandem collaboration server binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;
use tandem_collab::config::ServerConfig;
use tandem_collab::server::CollabServer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time collaborative editing server", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "TANDEM_BIND_ADDR", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents and sessions stay in memory when unset
    #[arg(long, env = "TANDEM_STORAGE_PATH", value_name = "DIR")]
    storage_path: Option<PathBuf>,

    /// WebSocket ping interval in seconds (0 disables)
    #[arg(long, env = "TANDEM_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Frames buffered per connection before it is dropped as unreachable
    #[arg(long, env = "TANDEM_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Only persist documents when their last connection leaves
    #[arg(long, env = "TANDEM_NO_PERSIST_ON_UPDATE")]
    no_persist_on_update: bool,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            outbound_capacity: self.outbound_capacity,
            heartbeat_interval_secs: self.heartbeat_secs,
            storage_path: self.storage_path,
            persist_on_update: !self.no_persist_on_update,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => info!("No storage path configured, documents are kept in memory"),
    }

    let server = CollabServer::new(config).context("failed to open document storage")?;
    server
        .run()
        .await
        .context("collaboration server stopped")?;
    Ok(())
}
