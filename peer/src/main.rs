use clap::Parser;
use log::{info, warn};
use peer::accessor::{BackoffPolicy, RateLimitedAccessor};
use peer::remote::RemoteDocumentService;
use peer::replicator::{Replicator, ReplicatorConfig, SendOutcome};
use peer::session::{LobbySession, PollSource};
use shared::{patch_of, LobbyMembership, StaticIdentity, SystemClock, NAME_KEY};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Lobby server address
    #[arg(short = 's', long, default_value = "127.0.0.1:7777")]
    server: String,

    /// Lobby to create or join
    #[arg(short = 'l', long, default_value = "lobby")]
    lobby: String,

    /// Peer id (random when omitted)
    #[arg(short = 'p', long)]
    peer: Option<String>,

    /// Display name shown next to messages (defaults to the peer id)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Create the lobby and act as its host instead of joining
    #[arg(long)]
    host: bool,

    /// Number of chat slots
    #[arg(short = 'c', long, default_value = "10")]
    capacity: usize,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "1500")]
    poll_ms: u64,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let peer_id = args
        .peer
        .unwrap_or_else(|| format!("peer-{:04x}", rand::random::<u16>()));
    let name = args.name.unwrap_or_else(|| peer_id.clone());

    let service = Arc::new(
        RemoteDocumentService::connect(
            &args.server,
            peer_id.clone(),
            Duration::from_millis(args.timeout_ms),
        )
        .await?,
    );

    let doc = if args.host {
        service
            .create_lobby(&args.lobby, patch_of(NAME_KEY, name.clone()))
            .await?
    } else {
        service
            .join_lobby(&args.lobby, patch_of(NAME_KEY, name.clone()))
            .await?
    };
    info!(
        "{} in lobby {} with {} players, host is {}",
        peer_id,
        doc.lobby_id,
        doc.players.len(),
        doc.host_id
    );

    let config = ReplicatorConfig {
        capacity: args.capacity,
        poll_interval: Duration::from_millis(args.poll_ms),
        ..ReplicatorConfig::lobby_chat()
    };
    let accessor = RateLimitedAccessor::new(service.clone(), BackoffPolicy::default());
    let replicator = Arc::new(Replicator::new(
        args.lobby.clone(),
        &StaticIdentity::new(peer_id.clone()),
        name,
        accessor,
        Arc::new(SystemClock),
        config,
    ));

    let session = LobbySession::attach(replicator, PollSource::Timer);
    let mut updates = session.subscribe().await;
    tokio::spawn(async move {
        while let Some(view) = updates.recv().await {
            println!("----");
            for line in view {
                println!("{}", line);
            }
        }
    });

    println!("Type a message and press enter, /quit to leave");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim() == "/quit" {
                    break;
                }
                match session.send_chat(&line).await {
                    SendOutcome::Committed | SendOutcome::Queued => {}
                    SendOutcome::RejectedEmpty => {}
                    SendOutcome::RejectedCooldown => eprintln!("Slow down, message not sent"),
                    SendOutcome::RejectedPending => {
                        eprintln!("Previous message still waiting for the host, not sent")
                    }
                    SendOutcome::Failed(e) => eprintln!("Message not sent: {}", e),
                    SendOutcome::Detached => break,
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving lobby");
                break;
            }
        }
    }

    if let Err(e) = session.detach().await {
        warn!("Feed loop ended abnormally: {}", e);
    }
    if let Err(e) = service.leave_lobby(&args.lobby).await {
        warn!("Could not leave lobby {}: {}", args.lobby, e);
    }
    if let Err(e) = service.goodbye().await {
        warn!("Could not say goodbye: {}", e);
    }

    Ok(())
}
