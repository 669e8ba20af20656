//! Room note relay
//!
//! Stateless WebSocket relay for shared room notes. Routes updates
//! between editors of the same file and announces final saves; keeps
//! no document content.

use std::time::Duration;

use clap::Parser;
use log::info;

use roomnote_collab::server::{ServerConfig, ServerError, SyncServer};

/// Room note relay - routes CRDT updates between editors
#[derive(Parser, Debug)]
#[command(name = "roomnote-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090", env = "ROOMNOTE_BIND")]
    bind: String,

    /// Seconds between sweeps of dead connections
    #[arg(long, default_value = "60", env = "ROOMNOTE_SWEEP_SECS")]
    sweep_secs: u64,

    /// Frames buffered per connection
    #[arg(long, default_value = "256", env = "ROOMNOTE_OUTBOUND_CAPACITY")]
    outbound_capacity: usize,

    /// Milliseconds a full connection queue may stall delivery before that connection is dropped
    #[arg(long, default_value = "2000", env = "ROOMNOTE_SEND_TIMEOUT_MS")]
    send_timeout_ms: u64,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            outbound_capacity: self.outbound_capacity.max(1),
            sweep_interval: Duration::from_secs(self.sweep_secs.max(1)),
            send_timeout: Duration::from_millis(self.send_timeout_ms.max(1)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("Starting room note relay on {}", args.bind);
    info!("Sweep interval {}s, outbound capacity {}", args.sweep_secs, args.outbound_capacity);

    let server = SyncServer::new(args.server_config());
    server.run().await
}
