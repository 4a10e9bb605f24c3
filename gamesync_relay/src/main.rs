// CLI entry point for the gamesync relay.
//
// Starts a standalone relay that game clients connect to, and runs until
// Ctrl+C. Log verbosity follows `RUST_LOG` (default `info`). See `server.rs`
// for the networking architecture.

use clap::Parser;
use gamesync_relay::{RelayConfig, start_relay};
use tracing_subscriber::EnvFilter;

/// Relay server for session-synchronized multiplayer games.
#[derive(Parser, Debug)]
#[command(name = "relay", version)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port (0 picks a free one).
    #[arg(long, default_value_t = 7878)]
    port: u16,

    /// Seconds of silence before a connection counts as dropped.
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,

    /// Largest room capacity accepted.
    #[arg(long, default_value_t = 8)]
    max_players: u32,
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            idle_timeout_secs: args.idle_timeout,
            max_players: args.max_players,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = RelayConfig::from(Args::parse());
    let (handle, addr) = match start_relay(config).await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    println!("Relay listening on {addr}");
    println!("Press Ctrl+C to stop.");

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Cannot wait for Ctrl+C: {e}");
    }

    println!("\nShutting down...");
    handle.stop().await;
}
