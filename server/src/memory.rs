//! Lobby backend shared by the UDP server and in-process peers

use async_trait::async_trait;
use log::debug;
use shared::{
    Document, DocumentService, LobbyMembership, Operation, Patch, Reply, ServiceError,
};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::rate_limit::{RateLimit, RateLimiter};
use crate::store::{LobbyStore, StoreLimits};

/// Lobby store plus rate limiter; every operation from every peer goes
/// through [`LobbyBackend::execute`]
#[derive(Clone)]
pub struct LobbyBackend {
    store: Arc<RwLock<LobbyStore>>,
    limiter: Arc<RwLock<RateLimiter>>,
}

impl LobbyBackend {
    pub fn new(limits: StoreLimits, rate_limit: Option<RateLimit>) -> Self {
        let limiter = match rate_limit {
            Some(limit) => RateLimiter::new(limit),
            None => RateLimiter::unlimited(),
        };
        Self {
            store: Arc::new(RwLock::new(LobbyStore::new(limits))),
            limiter: Arc::new(RwLock::new(limiter)),
        }
    }

    /// Backend without rate limiting, as used by tests and local simulations
    pub fn unlimited() -> Self {
        Self::new(StoreLimits::default(), None)
    }

    /// Runs one operation on behalf of `peer_id`
    pub async fn execute(&self, peer_id: &str, op: Operation) -> Reply {
        if let Err(e) = self.limiter.write().await.check(peer_id) {
            return Reply::Failed(e);
        }

        debug!("{} -> {}", peer_id, op.name());
        let mut store = self.store.write().await;
        match op {
            Operation::CreateLobby {
                lobby_id,
                peer_data,
            } => store.create_lobby(&lobby_id, peer_id, &peer_data).into(),
            Operation::JoinLobby {
                lobby_id,
                peer_data,
            } => store.join_lobby(&lobby_id, peer_id, &peer_data).into(),
            Operation::LeaveLobby { lobby_id } => store.leave_lobby(&lobby_id, peer_id).into(),
            Operation::Get { lobby_id } => store.get(&lobby_id, peer_id).into(),
            Operation::Update { lobby_id, patch } => {
                store.update(&lobby_id, peer_id, &patch).into()
            }
            Operation::UpdatePeerData {
                lobby_id,
                peer_id: target,
                patch,
            } => store
                .update_peer_data(&lobby_id, peer_id, &target, &patch)
                .into(),
        }
    }

    /// Removes a departed peer from every lobby
    pub async fn remove_peer(&self, peer_id: &str) -> Vec<String> {
        self.limiter.write().await.forget(peer_id);
        self.store.write().await.remove_peer(peer_id)
    }

    /// Reads a lobby bypassing permissions and rate limits
    pub async fn inspect(&self, lobby_id: &str) -> Option<Document> {
        let store = self.store.read().await;
        let host = store.host_of(lobby_id)?;
        store.get(lobby_id, &host).ok()
    }

    pub async fn lobby_count(&self) -> usize {
        self.store.read().await.lobby_count()
    }

    /// Document service handle acting as `peer_id`
    pub fn service_for(&self, peer_id: &str) -> MemoryDocumentService {
        MemoryDocumentService {
            backend: self.clone(),
            caller: peer_id.to_string(),
        }
    }
}

/// In-process [`DocumentService`] bound to one caller identity
#[derive(Clone)]
pub struct MemoryDocumentService {
    backend: LobbyBackend,
    caller: String,
}

impl MemoryDocumentService {
    pub fn caller(&self) -> &str {
        &self.caller
    }
}

#[async_trait]
impl DocumentService for MemoryDocumentService {
    async fn get(&self, lobby_id: &str) -> Result<Document, ServiceError> {
        let op = Operation::Get {
            lobby_id: lobby_id.to_string(),
        };
        self.backend.execute(&self.caller, op).await.into_document()
    }

    async fn update(&self, lobby_id: &str, patch: Patch) -> Result<Document, ServiceError> {
        let op = Operation::Update {
            lobby_id: lobby_id.to_string(),
            patch,
        };
        self.backend.execute(&self.caller, op).await.into_document()
    }

    async fn update_peer_data(
        &self,
        lobby_id: &str,
        peer_id: &str,
        patch: Patch,
    ) -> Result<(), ServiceError> {
        let op = Operation::UpdatePeerData {
            lobby_id: lobby_id.to_string(),
            peer_id: peer_id.to_string(),
            patch,
        };
        self.backend.execute(&self.caller, op).await.into_done()
    }
}

#[async_trait]
impl LobbyMembership for MemoryDocumentService {
    async fn create_lobby(
        &self,
        lobby_id: &str,
        peer_data: Patch,
    ) -> Result<Document, ServiceError> {
        let op = Operation::CreateLobby {
            lobby_id: lobby_id.to_string(),
            peer_data,
        };
        self.backend.execute(&self.caller, op).await.into_document()
    }

    async fn join_lobby(&self, lobby_id: &str, peer_data: Patch) -> Result<Document, ServiceError> {
        let op = Operation::JoinLobby {
            lobby_id: lobby_id.to_string(),
            peer_data,
        };
        self.backend.execute(&self.caller, op).await.into_document()
    }

    async fn leave_lobby(&self, lobby_id: &str) -> Result<(), ServiceError> {
        let op = Operation::LeaveLobby {
            lobby_id: lobby_id.to_string(),
        };
        self.backend.execute(&self.caller, op).await.into_done()
    }
}
