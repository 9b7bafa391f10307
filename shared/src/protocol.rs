//! Wire protocol between peers and the UDP lobby document server

use serde::{Deserialize, Serialize};

use crate::document::{Document, Patch, ServiceError};

/// Largest datagram either side will send or accept
pub const MAX_DATAGRAM: usize = 65_507;

/// Operation a peer asks the server to perform on its behalf
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateLobby {
        lobby_id: String,
        peer_data: Patch,
    },
    JoinLobby {
        lobby_id: String,
        peer_data: Patch,
    },
    LeaveLobby {
        lobby_id: String,
    },
    Get {
        lobby_id: String,
    },
    Update {
        lobby_id: String,
        patch: Patch,
    },
    UpdatePeerData {
        lobby_id: String,
        peer_id: String,
        patch: Patch,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateLobby { .. } => "create_lobby",
            Operation::JoinLobby { .. } => "join_lobby",
            Operation::LeaveLobby { .. } => "leave_lobby",
            Operation::Get { .. } => "get",
            Operation::Update { .. } => "update",
            Operation::UpdatePeerData { .. } => "update_peer_data",
        }
    }
}

/// Outcome of an [`Operation`]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Reply {
    Document(Document),
    Done,
    Failed(ServiceError),
}

impl Reply {
    pub fn into_document(self) -> Result<Document, ServiceError> {
        match self {
            Reply::Document(document) => Ok(document),
            Reply::Failed(e) => Err(e),
            Reply::Done => Err(ServiceError::Transient(
                "expected a document in reply".to_string(),
            )),
        }
    }

    pub fn into_done(self) -> Result<(), ServiceError> {
        match self {
            Reply::Document(_) | Reply::Done => Ok(()),
            Reply::Failed(e) => Err(e),
        }
    }
}

impl From<Result<Document, ServiceError>> for Reply {
    fn from(result: Result<Document, ServiceError>) -> Self {
        match result {
            Ok(document) => Reply::Document(document),
            Err(e) => Reply::Failed(e),
        }
    }
}

impl From<Result<(), ServiceError>> for Reply {
    fn from(result: Result<(), ServiceError>) -> Self {
        match result {
            Ok(()) => Reply::Done,
            Err(e) => Reply::Failed(e),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Request {
        request_id: u64,
        peer_id: String,
        op: Operation,
    },
    Response {
        request_id: u64,
        reply: Reply,
    },
    /// Sent by a peer that is shutting down so the server can drop it from
    /// every lobby without waiting for the idle timeout
    Goodbye {
        peer_id: String,
    },
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(packet)
}

pub fn decode(bytes: &[u8]) -> Result<Packet, bincode::Error> {
    bincode::deserialize(bytes)
}
