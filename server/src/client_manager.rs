//! Connection tracking for peers talking to the lobby server
//!
//! This module handles the server-side bookkeeping of connected peers:
//! - Associating each UDP address with the peer identity it claims
//! - Refreshing activity on every request
//! - Idle timeout detection so silent peers can be dropped from their lobbies
//! - Capacity management for concurrently connected peers
//!
//! Peer identities are opaque strings supplied by the peers themselves; the
//! server does not authenticate them.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A peer currently talking to the server
#[derive(Debug, Clone)]
pub struct Client {
    /// Identity the peer presented in its requests
    pub peer_id: String,
    /// Network address responses are sent to
    pub addr: SocketAddr,
    /// Last time we received any packet from this peer
    pub last_seen: Instant,
    /// Requests handled for this peer
    pub requests: u64,
}

impl Client {
    pub fn new(peer_id: &str, addr: SocketAddr) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            addr,
            last_seen: Instant::now(),
            requests: 0,
        }
    }

    /// Marks the peer active and counts one request
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.requests += 1;
    }

    /// Checks if the peer has exceeded the idle timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Outcome of registering activity from an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First request from this address
    Connected,
    /// Known address, same peer
    Refreshed,
    /// Known address now presenting a different peer id; the old identity
    /// should be dropped from its lobbies
    Replaced { previous: String },
    /// Server is at capacity
    Full,
}

/// Manages all connected peers
///
/// Peers are keyed by address. A peer that restarts on the same address with
/// a new identity replaces the old entry.
pub struct ClientManager {
    clients: HashMap<SocketAddr, Client>,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
            timeout,
        }
    }

    /// Registers a request from `peer_id` at `addr`
    pub fn admit(&mut self, peer_id: &str, addr: SocketAddr) -> Admission {
        if let Some(client) = self.clients.get_mut(&addr) {
            client.touch();
            if client.peer_id == peer_id {
                return Admission::Refreshed;
            }
            let previous = std::mem::replace(&mut client.peer_id, peer_id.to_string());
            info!("{} replaced {} at {}", peer_id, previous, addr);
            return Admission::Replaced { previous };
        }

        if self.clients.len() >= self.max_clients {
            return Admission::Full;
        }

        let mut client = Client::new(peer_id, addr);
        client.touch();
        info!("Peer {} connected from {}", peer_id, addr);
        self.clients.insert(addr, client);
        Admission::Connected
    }

    /// Removes the peer at `addr`, returning its identity
    pub fn remove_client(&mut self, addr: &SocketAddr) -> Option<String> {
        self.clients.remove(addr).map(|client| {
            info!("Peer {} disconnected", client.peer_id);
            client.peer_id
        })
    }

    /// Removes every address presenting `peer_id`
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        let before = self.clients.len();
        self.clients.retain(|_, client| client.peer_id != peer_id);
        before != self.clients.len()
    }

    pub fn find_peer_by_addr(&self, addr: SocketAddr) -> Option<&str> {
        self.clients.get(&addr).map(|client| client.peer_id.as_str())
    }

    /// Checks for and removes idle peers
    ///
    /// Returns the removed peers so the caller can drop them from their
    /// lobbies.
    pub fn check_timeouts(&mut self) -> Vec<Client> {
        let timed_out: Vec<SocketAddr> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(self.timeout))
            .map(|(addr, _)| *addr)
            .collect();

        timed_out
            .iter()
            .filter_map(|addr| self.clients.remove(addr))
            .inspect(|client| info!("Peer {} timed out", client.peer_id))
            .collect()
    }

    /// Returns the number of currently connected peers
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no peers are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
