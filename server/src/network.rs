//! Server network layer handling UDP communications for the lobby document service

use crate::client_manager::{Admission, ClientManager};
use crate::memory::LobbyBackend;
use crate::rate_limit::RateLimit;
use crate::store::StoreLimits;
use log::{debug, error, info, warn};
use shared::protocol::{self, MAX_DATAGRAM};
use shared::{Packet, Reply, ServiceError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { peer_id: String },
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    pub idle_timeout: Duration,
    pub limits: StoreLimits,
    pub rate_limit: Option<RateLimit>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 64,
            idle_timeout: Duration::from_secs(30),
            limits: StoreLimits::default(),
            rate_limit: Some(RateLimit::default()),
        }
    }
}

/// Handle that stops a running [`Server`]
#[derive(Clone)]
pub struct ShutdownHandle(mpsc::UnboundedSender<ServerMessage>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.0.send(ServerMessage::Shutdown).is_err() {
            debug!("Server already stopped");
        }
    }
}

/// Lobby document server answering peer requests over UDP
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    backend: LobbyBackend,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    pub async fn new(addr: &str, config: ServerConfig) -> Result<Self, BoxError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Lobby server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.idle_timeout,
            ))),
            backend: LobbyBackend::new(config.limits, config.rate_limit),
            server_tx,
            server_rx,
            out_tx,
            out_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn backend(&self) -> &LobbyBackend {
        &self.backend
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.server_tx.clone())
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = protocol::decode(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut out_rx = std::mem::replace(&mut self.out_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors idle peers
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout {
                        peer_id: client.peer_id,
                    }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let data = protocol::encode(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.out_tx.send(OutboundMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Processes one incoming packet and queues the reply
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Request {
                request_id,
                peer_id,
                op,
            } => {
                let admission = {
                    let mut clients = self.clients.write().await;
                    clients.admit(&peer_id, addr)
                };

                let reply = match admission {
                    Admission::Full => {
                        warn!("Rejecting {} from {}: server full", peer_id, addr);
                        Reply::Failed(ServiceError::Transient("server full".to_string()))
                    }
                    Admission::Replaced { previous } => {
                        self.backend.remove_peer(&previous).await;
                        self.backend.execute(&peer_id, op).await
                    }
                    Admission::Connected | Admission::Refreshed => {
                        self.backend.execute(&peer_id, op).await
                    }
                };

                self.send_packet(Packet::Response { request_id, reply }, addr);
            }

            Packet::Goodbye { peer_id } => {
                {
                    let mut clients = self.clients.write().await;
                    clients.remove_peer(&peer_id);
                }
                let lobbies = self.backend.remove_peer(&peer_id).await;
                info!("{} said goodbye, left {} lobbies", peer_id, lobbies.len());
            }

            Packet::Response { .. } => {
                warn!("Unexpected response packet from {}", addr);
            }
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> Result<(), BoxError> {
        // Initialize concurrent tasks
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut stats_interval = interval(Duration::from_secs(60));

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { peer_id }) => {
                            let lobbies = self.backend.remove_peer(&peer_id).await;
                            debug!("Dropped idle peer {} from {} lobbies", peer_id, lobbies.len());
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = stats_interval.tick() => {
                    let client_count = self.clients.read().await.len();
                    let lobby_count = self.backend.lobby_count().await;
                    debug!("{} peers connected, {} lobbies open", client_count, lobby_count);
                },
            }
        }

        Ok(())
    }
}
