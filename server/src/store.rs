//! In-memory lobby documents with host/peer write permissions
//!
//! Each lobby holds a size-limited data bag that only the host may patch,
//! plus one data record per player that its owner (or the host) may patch.
//! When the host leaves, the longest-standing remaining player is promoted.

use log::{debug, info};
use shared::document::{apply_patch, patched_len};
use shared::{Document, Patch, PeerRecord, ServiceError};
use std::collections::HashMap;

/// Limits applied to every lobby in a store
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    /// Maximum non-empty keys in the lobby data bag and in each player record
    pub max_keys: usize,
    /// Maximum players per lobby
    pub max_players: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_keys: 64,
            max_players: 16,
        }
    }
}

pub struct LobbyStore {
    lobbies: HashMap<String, Document>,
    limits: StoreLimits,
}

impl LobbyStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            lobbies: HashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Creates a lobby with `host_id` as its host and first player
    pub fn create_lobby(
        &mut self,
        lobby_id: &str,
        host_id: &str,
        peer_data: &Patch,
    ) -> Result<Document, ServiceError> {
        if self.lobbies.contains_key(lobby_id) {
            return Err(ServiceError::Forbidden(format!(
                "lobby {} already exists",
                lobby_id
            )));
        }
        self.check_record_size(&Default::default(), peer_data)?;

        let mut document = Document::new(lobby_id, host_id);
        let mut host = PeerRecord::new(host_id);
        apply_patch(&mut host.data, peer_data);
        document.players.push(host);

        info!("Lobby {} created by {}", lobby_id, host_id);
        self.lobbies.insert(lobby_id.to_string(), document.clone());
        Ok(document)
    }

    /// Adds `peer_id` to a lobby. Joining a lobby the peer is already in
    /// refreshes its player data instead.
    pub fn join_lobby(
        &mut self,
        lobby_id: &str,
        peer_id: &str,
        peer_data: &Patch,
    ) -> Result<Document, ServiceError> {
        let limits = self.limits;
        let lobby = self.lobby_mut(lobby_id)?;

        if let Some(existing) = lobby.players.iter_mut().find(|p| p.id == peer_id) {
            if patched_len(&existing.data, peer_data) > limits.max_keys {
                return Err(ServiceError::Transient("player record full".to_string()));
            }
            apply_patch(&mut existing.data, peer_data);
            return Ok(lobby.clone());
        }

        if lobby.players.len() >= limits.max_players {
            return Err(ServiceError::Forbidden(format!("lobby {} is full", lobby_id)));
        }

        let mut record = PeerRecord::new(peer_id);
        if patched_len(&record.data, peer_data) > limits.max_keys {
            return Err(ServiceError::Transient("player record full".to_string()));
        }
        apply_patch(&mut record.data, peer_data);
        lobby.players.push(record);

        info!("{} joined lobby {}", peer_id, lobby_id);
        Ok(lobby.clone())
    }

    /// Removes `peer_id` from a lobby, promoting a new host or closing the
    /// lobby as needed
    pub fn leave_lobby(&mut self, lobby_id: &str, peer_id: &str) -> Result<(), ServiceError> {
        let lobby = self.lobby_mut(lobby_id)?;

        let before = lobby.players.len();
        lobby.players.retain(|p| p.id != peer_id);
        if lobby.players.len() == before {
            return Err(ServiceError::Forbidden(format!(
                "{} is not in lobby {}",
                peer_id, lobby_id
            )));
        }
        info!("{} left lobby {}", peer_id, lobby_id);

        if lobby.players.is_empty() {
            info!("Lobby {} closed", lobby_id);
            self.lobbies.remove(lobby_id);
        } else if lobby.host_id == peer_id {
            lobby.host_id = lobby.players[0].id.clone();
            info!("{} is now host of lobby {}", lobby.host_id, lobby_id);
        }

        Ok(())
    }

    /// Removes `peer_id` from every lobby it belongs to, returning the lobby ids
    pub fn remove_peer(&mut self, peer_id: &str) -> Vec<String> {
        let lobby_ids: Vec<String> = self
            .lobbies
            .iter()
            .filter(|(_, lobby)| lobby.player(peer_id).is_some())
            .map(|(id, _)| id.clone())
            .collect();

        for lobby_id in &lobby_ids {
            // Membership was checked above, so this cannot fail
            let _ = self.leave_lobby(lobby_id, peer_id);
        }

        lobby_ids
    }

    /// Reads a lobby; only members may read it
    pub fn get(&self, lobby_id: &str, caller: &str) -> Result<Document, ServiceError> {
        let lobby = self
            .lobbies
            .get(lobby_id)
            .ok_or_else(|| ServiceError::NotFound(lobby_id.to_string()))?;

        if lobby.player(caller).is_none() {
            return Err(ServiceError::Forbidden(format!(
                "{} is not in lobby {}",
                caller, lobby_id
            )));
        }

        Ok(lobby.clone())
    }

    /// Patches the lobby data bag; host only
    pub fn update(
        &mut self,
        lobby_id: &str,
        caller: &str,
        patch: &Patch,
    ) -> Result<Document, ServiceError> {
        let max_keys = self.limits.max_keys;
        let lobby = self.lobby_mut(lobby_id)?;

        if !lobby.is_host(caller) {
            return Err(ServiceError::Forbidden(format!(
                "only the host may update lobby {}",
                lobby_id
            )));
        }
        if patched_len(&lobby.data, patch) > max_keys {
            return Err(ServiceError::Transient("document full".to_string()));
        }

        apply_patch(&mut lobby.data, patch);
        debug!("Lobby {} updated {} keys", lobby_id, patch.len());
        Ok(lobby.clone())
    }

    /// Patches one player's record; allowed for the owner and for the host
    pub fn update_peer_data(
        &mut self,
        lobby_id: &str,
        caller: &str,
        peer_id: &str,
        patch: &Patch,
    ) -> Result<(), ServiceError> {
        let max_keys = self.limits.max_keys;
        let lobby = self.lobby_mut(lobby_id)?;

        if caller != peer_id && !lobby.is_host(caller) {
            return Err(ServiceError::Forbidden(format!(
                "{} may not write the record of {}",
                caller, peer_id
            )));
        }

        let record = lobby
            .players
            .iter_mut()
            .find(|p| p.id == peer_id)
            .ok_or_else(|| {
                ServiceError::Forbidden(format!("{} is not in lobby {}", peer_id, lobby_id))
            })?;

        if patched_len(&record.data, patch) > max_keys {
            return Err(ServiceError::Transient("player record full".to_string()));
        }

        apply_patch(&mut record.data, patch);
        Ok(())
    }

    pub fn host_of(&self, lobby_id: &str) -> Option<String> {
        self.lobbies.get(lobby_id).map(|lobby| lobby.host_id.clone())
    }

    pub fn lobby_count(&self) -> usize {
        self.lobbies.len()
    }

    fn lobby_mut(&mut self, lobby_id: &str) -> Result<&mut Document, ServiceError> {
        self.lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| ServiceError::NotFound(lobby_id.to_string()))
    }

    fn check_record_size(
        &self,
        current: &std::collections::BTreeMap<String, String>,
        patch: &Patch,
    ) -> Result<(), ServiceError> {
        if patched_len(current, patch) > self.limits.max_keys {
            return Err(ServiceError::Transient("player record full".to_string()));
        }
        Ok(())
    }
}
