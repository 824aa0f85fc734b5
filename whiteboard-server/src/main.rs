//! Whiteboard session server.
//!
//! Hosts one shared whiteboard over WebSocket. Set `RUST_LOG` to control
//! log output (defaults to `info`).

use clap::Parser;
use log::{error, info};
use whiteboard_collab::{ServerConfig, SessionServer};

const SHUTDOWN_REASON: &str = "Server is shutting down gracefully.";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(default_value_t = 3000)]
    port: u16,

    /// Interface to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Events buffered per client before deliveries start waiting
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// Upper bound on a single delivery to one client, in milliseconds
    #[arg(long, default_value_t = 5_000)]
    delivery_timeout_ms: u64,

    /// Consecutive failed deliveries before a client is dropped (0 = never)
    #[arg(long, default_value_t = 3)]
    max_delivery_failures: u32,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            client_queue_capacity: self.queue_capacity,
            delivery_timeout_ms: self.delivery_timeout_ms,
            max_consecutive_failures: self.max_delivery_failures,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    info!("Starting whiteboard server on {}", config.bind_addr);
    let server = SessionServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {e}");
            }
            server.shutdown(SHUTDOWN_REASON).await;
            // Let the connection tasks flush the shutdown notice.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }
    info!("Server stopped");
}
