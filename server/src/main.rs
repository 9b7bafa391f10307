use clap::Parser;
use log::info;
use server::network::{BoxError, Server, ServerConfig};
use server::rate_limit::RateLimit;
use server::StoreLimits;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "7777")]
    port: u16,

    /// Maximum concurrently connected peers
    #[arg(long, default_value = "64")]
    max_peers: usize,

    /// Maximum players per lobby
    #[arg(long, default_value = "16")]
    max_players: usize,

    /// Maximum keys in a lobby data bag or player record
    #[arg(long, default_value = "64")]
    max_keys: usize,

    /// Requests each peer may make per rate window (0 disables limiting)
    #[arg(short, long, default_value = "10")]
    rate_limit: u32,

    /// Length of the rate window in milliseconds
    #[arg(long, default_value = "1000")]
    rate_window_ms: u64,

    /// Seconds of silence before a peer is dropped from its lobbies
    #[arg(long, default_value = "30")]
    idle_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let rate_limit = (args.rate_limit > 0).then(|| RateLimit {
        max_requests: args.rate_limit,
        window: Duration::from_millis(args.rate_window_ms),
    });

    let config = ServerConfig {
        max_clients: args.max_peers,
        idle_timeout: Duration::from_secs(args.idle_timeout),
        limits: StoreLimits {
            max_keys: args.max_keys,
            max_players: args.max_players,
        },
        rate_limit,
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
