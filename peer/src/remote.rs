//! Document service reached over UDP
//!
//! [`RemoteDocumentService`] speaks the request/response protocol from
//! `shared::protocol` to a lobby server. One request is in flight at a time;
//! responses are matched by request id and anything else is dropped. A
//! request that sees no reply before the timeout fails as a transient error,
//! which the accessor treats like any other backend hiccup.

use async_trait::async_trait;
use log::{debug, info, warn};
use shared::protocol::{self, MAX_DATAGRAM};
use shared::{
    Document, DocumentService, LobbyMembership, Operation, Packet, Patch, Reply, ServiceError,
};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

/// Default time to wait for a server reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("could not resolve server address {0}")]
    Unresolved(String),
}

impl From<RemoteError> for ServiceError {
    fn from(e: RemoteError) -> Self {
        ServiceError::Transient(e.to_string())
    }
}

pub struct RemoteDocumentService {
    socket: UdpSocket,
    server_addr: SocketAddr,
    peer_id: String,
    request_timeout: Duration,
    in_flight: Mutex<()>,
}

impl RemoteDocumentService {
    /// Binds an ephemeral socket and points it at `server`
    pub async fn connect(
        server: &str,
        peer_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let server_addr = lookup_host(server)
            .await?
            .next()
            .ok_or_else(|| RemoteError::Unresolved(server.to_string()))?;

        let bind_addr = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server_addr).await?;

        let peer_id = peer_id.into();
        info!("{} talking to lobby server at {}", peer_id, server_addr);

        Ok(Self {
            socket,
            server_addr,
            peer_id,
            request_timeout,
            in_flight: Mutex::new(()),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Tells the server this peer is gone. Best effort, no reply expected.
    pub async fn goodbye(&self) -> Result<(), RemoteError> {
        let packet = Packet::Goodbye {
            peer_id: self.peer_id.clone(),
        };
        self.socket.send(&protocol::encode(&packet)?).await?;
        Ok(())
    }

    async fn request(&self, op: Operation) -> Result<Reply, RemoteError> {
        let _turn = self.in_flight.lock().await;

        let request_id = rand::random::<u64>();
        let name = op.name();
        let packet = Packet::Request {
            request_id,
            peer_id: self.peer_id.clone(),
            op,
        };
        self.socket.send(&protocol::encode(&packet)?).await?;

        let deadline = Instant::now() + self.request_timeout;
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = timeout_at(deadline, self.socket.recv(&mut buffer))
                .await
                .map_err(|_| RemoteError::Timeout(self.request_timeout))??;

            match protocol::decode(&buffer[..len]) {
                Ok(Packet::Response {
                    request_id: id,
                    reply,
                }) if id == request_id => return Ok(reply),
                Ok(Packet::Response { request_id: id, .. }) => {
                    debug!("Dropping stale reply {} while waiting on {}", id, name);
                }
                Ok(_) => warn!("Unexpected packet from {}", self.server_addr),
                Err(e) => warn!("Undecodable datagram from {}: {}", self.server_addr, e),
            }
        }
    }

    async fn call(&self, op: Operation) -> Result<Reply, ServiceError> {
        Ok(self.request(op).await?)
    }
}

#[async_trait]
impl DocumentService for RemoteDocumentService {
    async fn get(&self, lobby_id: &str) -> Result<Document, ServiceError> {
        let op = Operation::Get {
            lobby_id: lobby_id.to_string(),
        };
        self.call(op).await?.into_document()
    }

    async fn update(&self, lobby_id: &str, patch: Patch) -> Result<Document, ServiceError> {
        let op = Operation::Update {
            lobby_id: lobby_id.to_string(),
            patch,
        };
        self.call(op).await?.into_document()
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
        self.call(op).await?.into_done()
    }
}

#[async_trait]
impl LobbyMembership for RemoteDocumentService {
    async fn create_lobby(
        &self,
        lobby_id: &str,
        peer_data: Patch,
    ) -> Result<Document, ServiceError> {
        let op = Operation::CreateLobby {
            lobby_id: lobby_id.to_string(),
            peer_data,
        };
        self.call(op).await?.into_document()
    }

    async fn join_lobby(&self, lobby_id: &str, peer_data: Patch) -> Result<Document, ServiceError> {
        let op = Operation::JoinLobby {
            lobby_id: lobby_id.to_string(),
            peer_data,
        };
        self.call(op).await?.into_document()
    }

    async fn leave_lobby(&self, lobby_id: &str) -> Result<(), ServiceError> {
        let op = Operation::LeaveLobby {
            lobby_id: lobby_id.to_string(),
        };
        self.call(op).await?.into_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use server::network::{Server, ServerConfig};
    use shared::{patch_of, NAME_KEY, PENDING_KEY};

    async fn spawn_server() -> (SocketAddr, server::network::ShutdownHandle) {
        let config = ServerConfig {
            rate_limit: None,
            ..ServerConfig::default()
        };
        let mut server = Server::new("127.0.0.1:0", config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, shutdown)
    }

    #[test]
    fn test_remote_errors_are_transient() {
        let error: ServiceError = RemoteError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(error, ServiceError::Transient(_)));
    }

    #[tokio::test]
    async fn test_lobby_round_trip_over_udp() {
        let (addr, shutdown) = spawn_server().await;
        let host = RemoteDocumentService::connect(&addr.to_string(), "host", DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();
        let guest = RemoteDocumentService::connect(&addr.to_string(), "guest", DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();

        host.create_lobby("lobby", patch_of(NAME_KEY, "Host")).await.unwrap();
        let doc = guest.join_lobby("lobby", patch_of(NAME_KEY, "Guest")).await.unwrap();
        assert_eq!(doc.host_id, "host");
        assert_eq!(doc.players.len(), 2);

        guest
            .update_peer_data("lobby", "guest", patch_of(PENDING_KEY, "1:hi"))
            .await
            .unwrap();
        let doc = host.get("lobby").await.unwrap();
        assert_eq!(
            doc.player("guest").unwrap().data.get(PENDING_KEY),
            Some(&"1:hi".to_string())
        );

        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_server_errors_come_back_typed() {
        let (addr, shutdown) = spawn_server().await;
        let guest = RemoteDocumentService::connect(&addr.to_string(), "guest", DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();

        let result = guest.get("missing").await;
        assert_eq!(result, Err(ServiceError::NotFound("missing".to_string())));

        shutdown.shutdown();
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        // Bound but never read, so every request goes unanswered
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let service = RemoteDocumentService::connect(&addr.to_string(), "peer", Duration::from_millis(50))
            .await
            .unwrap();

        match service.get("lobby").await {
            Err(ServiceError::Transient(_)) => {}
            other => panic!("Unexpected result {:?}", other),
        }
    }
}
