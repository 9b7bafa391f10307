//! # Lobby Chat Peer
//!
//! This library is one peer's side of lobby chat. There is no direct channel
//! between peers: all they share is the lobby document held by the server,
//! which only the host may write and which can only be read by polling at a
//! rate the server limits. Chat is layered on top of that document.
//!
//! ## How Messages Move
//!
//! ### Client Submission
//! A non-host peer writes `timestamp:text` into its own player record's
//! pending slot and shows the message locally as "sending" straight away.
//! Until a later read shows that slot drained, further messages are refused
//! with `SendOutcome::RejectedPending` rather than overwriting it.
//!
//! ### Host Arbitration
//! The host drains every pending slot into the chat slots of the lobby data,
//! remembers the drained message ids in a bounded dedup ledger so that a
//! re-presented slot is never applied twice, and clears the pending slots
//! once the chat slots are written. If a chat write fails after it may have
//! landed, the next merge counts those messages as applied when their lines
//! already sit in the chat slots.
//!
//! ### Change Detection
//! Every peer polls the document and fingerprints the decoded chat slots.
//! Subscribers hear about the chat only when the fingerprint moves.
//!
//! ## Module Organization
//!
//! ### Accessor Module (`accessor`)
//! Every document call goes through `RateLimitedAccessor`, which retries
//! rate-limited calls with a growing delay.
//!
//! ### Ledger Module (`ledger`)
//! The host's record of already-applied message ids.
//!
//! ### Mirror Module (`mirror`)
//! The local copy of the chat slots, its fingerprint, and optimistic
//! placeholders for messages still on their way.
//!
//! ### Replicator Module (`replicator`)
//! The per-peer state machine that ties the above together.
//!
//! ### Session and Poller Modules (`session`, `poller`)
//! Background loops feeding documents to replicators, either one poll timer
//! per replicator or one shared read fanned out to many.
//!
//! ### Remote Module (`remote`)
//! `DocumentService` implementation that talks UDP to the lobby server.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use peer::accessor::{BackoffPolicy, RateLimitedAccessor};
//! use peer::remote::{RemoteDocumentService, DEFAULT_REQUEST_TIMEOUT};
//! use peer::replicator::{Replicator, ReplicatorConfig};
//! use peer::session::{LobbySession, PollSource};
//! use shared::{patch_of, LobbyMembership, StaticIdentity, SystemClock, NAME_KEY};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let service = Arc::new(
//!         RemoteDocumentService::connect("127.0.0.1:7777", "alice", DEFAULT_REQUEST_TIMEOUT).await?,
//!     );
//!     service.join_lobby("lobby", patch_of(NAME_KEY, "Alice")).await?;
//!
//!     let accessor = RateLimitedAccessor::new(service, BackoffPolicy::default());
//!     let replicator = Replicator::new(
//!         "lobby",
//!         &StaticIdentity::new("alice"),
//!         "Alice",
//!         accessor,
//!         Arc::new(SystemClock),
//!         ReplicatorConfig::lobby_chat(),
//!     );
//!
//!     let session = LobbySession::attach(Arc::new(replicator), PollSource::Timer);
//!     let mut updates = session.subscribe().await;
//!     session.send_chat("hello").await;
//!     if let Some(view) = updates.recv().await {
//!         println!("{:?}", view);
//!     }
//!     Ok(())
//! }
//! ```

pub mod accessor;
pub mod ledger;
pub mod mirror;
pub mod poller;
pub mod remote;
pub mod replicator;
pub mod session;

pub use accessor::{BackoffPolicy, RateLimitedAccessor};
pub use ledger::DedupLedger;
pub use mirror::{Fingerprint, LocalMirror};
pub use poller::SharedPoller;
pub use remote::RemoteDocumentService;
pub use replicator::{PollOutcome, Replicator, ReplicatorConfig, SendOutcome};
pub use session::{LobbySession, PollSource};
