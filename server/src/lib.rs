//! # Lobby Document Server
//!
//! This library provides the shared lobby document that peers coordinate
//! through. A lobby is a bounded key/value bag that only its host may write,
//! plus one data record per player that the player (or the host) may write.
//! Peers never talk to each other directly: everything they know about one
//! another they read from here, at a rate the server is free to limit.
//!
//! ## Core Responsibilities
//!
//! ### Lobby Lifecycle
//! Creating lobbies, admitting players up to a capacity, and promoting the
//! longest-standing player to host when the host leaves or goes silent.
//!
//! ### Write Permissions
//! Lobby data (where the chat slots live) is host-only. Player records are
//! writable by their owner, and by the host so that it can clear drained
//! pending chat slots. Violations surface as `Forbidden`.
//!
//! ### Rate Limiting
//! Each peer gets a fixed number of calls per window; excess calls fail with
//! `RateLimited`, which is what drives the peers' backoff behaviour.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! The lobby documents themselves and the permission and size checks applied
//! to every patch.
//!
//! ### Rate Limit Module (`rate_limit`)
//! Fixed-window per-peer request limiter.
//!
//! ### Memory Module (`memory`)
//! `LobbyBackend`, which couples the store and the limiter, and
//! `MemoryDocumentService`, an in-process `DocumentService` used by tests and
//! local simulations.
//!
//! ### Client Manager Module (`client_manager`)
//! Tracks which UDP address speaks for which peer and drops idle peers.
//!
//! ### Network Module (`network`)
//! The UDP server loop answering `shared::protocol` requests.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut server = Server::new("127.0.0.1:7777", ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod memory;
pub mod network;
pub mod rate_limit;
pub mod store;

pub use memory::{LobbyBackend, MemoryDocumentService};
pub use store::StoreLimits;
