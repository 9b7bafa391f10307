//! Shared lobby document model and the service contracts peers consume

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Key/value patch applied to a lobby or player data bag. An empty value
/// removes the key.
pub type Patch = BTreeMap<String, String>;

/// One participant's record inside a lobby document
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub data: BTreeMap<String, String>,
}

impl PeerRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: BTreeMap::new(),
        }
    }

    /// Display name stored in the player record, falling back to the peer id
    pub fn display_name(&self) -> &str {
        self.data
            .get(crate::NAME_KEY)
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.id)
    }
}

/// Snapshot of a lobby as returned by the document service
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Document {
    pub lobby_id: String,
    pub host_id: String,
    pub data: BTreeMap<String, String>,
    pub players: Vec<PeerRecord>,
}

impl Document {
    pub fn new(lobby_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        Self {
            lobby_id: lobby_id.into(),
            host_id: host_id.into(),
            data: BTreeMap::new(),
            players: Vec::new(),
        }
    }

    pub fn is_host(&self, peer_id: &str) -> bool {
        self.host_id == peer_id
    }

    pub fn player(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.players.iter().find(|p| p.id == peer_id)
    }
}

/// Applies a patch to a data bag, removing keys whose new value is empty
pub fn apply_patch(target: &mut BTreeMap<String, String>, patch: &Patch) {
    for (key, value) in patch {
        if value.is_empty() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Number of non-empty keys `target` would hold after `patch` is applied
pub fn patched_len(target: &BTreeMap<String, String>, patch: &Patch) -> usize {
    let mut len = target.len();
    for (key, value) in patch {
        match (target.contains_key(key), value.is_empty()) {
            (true, true) => len -= 1,
            (false, false) => len += 1,
            _ => {}
        }
    }
    len
}

/// How a caller should react to a failed service call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry after a backoff delay
    RateLimited,
    /// The caller lacks permission; never retried
    Forbidden,
    /// Network or backend hiccup; indistinguishable from overload for the caller
    Transient,
}

/// Failure reported by the lobby document service
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("rate limited by the document service")]
    RateLimited,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("lobby {0} not found")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::RateLimited => ErrorClass::RateLimited,
            ServiceError::Forbidden(_) | ServiceError::NotFound(_) => ErrorClass::Forbidden,
            ServiceError::Transient(_) => ErrorClass::Transient,
        }
    }
}

/// Read/write access to a lobby's shared document
///
/// Implementations are bound to the calling peer's identity: `update` only
/// succeeds for the lobby host and `update_peer_data` only for the caller's
/// own record (or any record when the caller is host).
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn get(&self, lobby_id: &str) -> Result<Document, ServiceError>;

    async fn update(&self, lobby_id: &str, patch: Patch) -> Result<Document, ServiceError>;

    async fn update_peer_data(
        &self,
        lobby_id: &str,
        peer_id: &str,
        patch: Patch,
    ) -> Result<(), ServiceError>;
}

/// Lobby lifecycle operations for the calling peer
#[async_trait]
pub trait LobbyMembership: Send + Sync {
    /// Creates a lobby with the caller as host
    async fn create_lobby(&self, lobby_id: &str, peer_data: Patch)
        -> Result<Document, ServiceError>;

    async fn join_lobby(&self, lobby_id: &str, peer_data: Patch) -> Result<Document, ServiceError>;

    async fn leave_lobby(&self, lobby_id: &str) -> Result<(), ServiceError>;
}

/// Source of the local peer's opaque identifier
pub trait IdentityService: Send + Sync {
    fn current_peer_id(&self) -> String;
}

/// Identity fixed at construction, stable for the lobby session
#[derive(Debug, Clone)]
pub struct StaticIdentity(String);

impl StaticIdentity {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self(peer_id.into())
    }
}

impl IdentityService for StaticIdentity {
    fn current_peer_id(&self) -> String {
        self.0.clone()
    }
}
