use clap::Parser;
use log::{error, info};
use server::network::{CanvasServer, ServerCommand, ServerConfig};
use server::persistence::{FileStore, SnapshotStore};
use server::replication::{LocalBus, ReplicationBridge};
use server::zones;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, loads the board, then runs the server
/// until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Board width in pixels
        #[clap(long, default_value_t = shared::DEFAULT_BOARD_WIDTH)]
        width: u32,
        /// Board height in pixels
        #[clap(long, default_value_t = shared::DEFAULT_BOARD_HEIGHT)]
        height: u32,
        /// Local snapshot cache file
        #[clap(long, default_value = "board.dat")]
        cache: PathBuf,
        /// Optional remote snapshot store (file-backed stand-in)
        #[clap(long)]
        remote: Option<PathBuf>,
        /// Protected-zone list (JSON)
        #[clap(long, default_value = "zones.json")]
        zones: PathBuf,
        /// Seconds between snapshot flushes
        #[clap(long, default_value = "10")]
        flush_interval: u64,
        /// Rows per snapshot chunk when streaming to a new client
        #[clap(long, default_value_t = shared::DEFAULT_CHUNK_ROWS)]
        chunk_rows: u32,
        /// Milliseconds between snapshot chunks
        #[clap(long, default_value_t = shared::DEFAULT_CHUNK_DELAY_MS)]
        chunk_delay: u64,
        /// Maximum concurrent connections
        #[clap(long, default_value = "256")]
        max_clients: usize,
    }

    env_logger::init();
    let args = Args::parse();

    let zones = zones::load_zones(&args.zones);

    let remote: Option<Arc<dyn SnapshotStore>> = args
        .remote
        .map(|path| Arc::new(FileStore::new(path)) as Arc<dyn SnapshotStore>);

    let bus = LocalBus::new(1024);
    let bridge = ReplicationBridge::new(bus.handle());

    let config = ServerConfig {
        addr: format!("{}:{}", args.host, args.port),
        width: args.width,
        height: args.height,
        cache_path: args.cache,
        flush_interval: Duration::from_secs(args.flush_interval),
        chunk_rows: args.chunk_rows,
        chunk_delay: Duration::from_millis(args.chunk_delay),
        max_clients: args.max_clients,
    };

    let mut server = CanvasServer::new(config, zones, remote, Some(bridge)).await?;
    let shutdown = server.command_sender();

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = shutdown.send(ServerCommand::Shutdown);
        }
    }

    Ok(())
}
