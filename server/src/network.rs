//! Server network layer handling UDP communications and the session update loop

use crate::config::ServerConfig;
use crate::connection::DisconnectReason;
use crate::handlers::server_router;
use crate::plugin::PluginSet;
use crate::session::ServerSession;
use crate::world_state::Outgoing;
use log::{debug, error, info, warn};
use shared::protocol::{decode_packet, encode_packet, MAX_DATAGRAM_SIZE};
use shared::readiness::POLL_INTERVAL;
use shared::router::MessageRouter;
use shared::{ConnectionId, Envelope, MessageKind, Packet, ResultCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    /// A send to this address failed at the socket level
    SendFailed {
        addr: SocketAddr,
        error: String,
    },
    Shutdown,
}

/// Messages sent from the update loop to the network sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

/// Main server coordinating networking and the session state
pub struct Server {
    socket: Arc<UdpSocket>,
    router: MessageRouter<ServerSession>,
    session: ServerSession,
    tick_duration: Duration,
    client_timeout: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_plugins(config, PluginSet::new()).await
    }

    pub async fn with_plugins(
        config: ServerConfig,
        plugins: PluginSet,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let session = ServerSession::new(&config, plugins, Instant::now())?;
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            router: server_router(),
            session,
            tick_duration: config.tick_duration(),
            client_timeout: config.client_timeout,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    /// Address actually bound, useful when binding to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Handle for stopping the loop from outside.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ServerSession {
        &mut self.session
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match decode_packet(&buffer[..len]) {
                        Ok(packet) => {
                            if server_tx
                                .send(ServerMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                debug!("Update loop gone, receiver stopping");
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to deserialize packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(GameMessage::SendPacket { packet, addr }) = game_rx.recv().await {
                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                    let _ = server_tx.send(ServerMessage::SendFailed {
                        addr,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = encode_packet(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn send_all(&self, datagrams: Vec<(SocketAddr, Packet)>) {
        for (addr, packet) in datagrams {
            self.send_packet(packet, addr);
        }
    }

    /// Sends everything the session queued since the last flush
    fn flush(&mut self) {
        let datagrams = self.session.flush(Instant::now());
        self.send_all(datagrams);
    }

    /// Processes incoming packets and updates session state
    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let now = Instant::now();

        if let Packet::Connect { client_version } = packet {
            info!("Client connecting from {} (version: {})", addr, client_version);
            let replies = self.session.handle_connect(addr, client_version, now);
            self.send_all(replies);
            return;
        }

        let id = match self.session.supervisor.find_by_addr(addr) {
            Some(id) => id,
            None => {
                debug!("Ignoring {:?} from unknown peer {}", packet, addr);
                return;
            }
        };
        self.session.supervisor.touch(id, now);

        match packet {
            Packet::Heartbeat => {}

            Packet::Reliable { sequence, envelope } => {
                let (delivered, ack) = match self.session.supervisor.get_mut(id) {
                    Some(connection) => connection.channel.receive(sequence, envelope),
                    None => return,
                };
                self.send_packet(ack, addr);
                for envelope in delivered {
                    self.dispatch(id, envelope);
                }
            }

            Packet::Unreliable { envelope } => self.dispatch(id, envelope),

            Packet::Ack { sequence } => {
                if let Some(connection) = self.session.supervisor.get_mut(id) {
                    connection.channel.on_ack(sequence);
                }
            }

            Packet::Disconnect => {
                self.session
                    .handle_disconnect(id, DisconnectReason::Requested, None);
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }

        self.flush();
    }

    fn dispatch(&mut self, id: ConnectionId, envelope: Envelope) {
        if let MessageKind::Response { .. } = envelope.kind {
            warn!("Dropping response {} from {}: server sends no requests", envelope.opcode, id);
            return;
        }

        match self.router.dispatch(&mut self.session, id, &envelope) {
            Ok(Some(response)) => self.session.push(Outgoing::to(id, response)),
            Ok(None) => {}
            Err(e) => warn!("Dropping message from {}: {}", id, e),
        }
    }

    /// Kicks a connection: the `Kick` datagram is queued before the
    /// connection record is dropped.
    pub fn kick(&mut self, id: ConnectionId, reason: ResultCode) -> bool {
        match self.session.kick(id, reason) {
            Some((addr, packet)) => {
                self.send_packet(packet, addr);
                true
            }
            None => false,
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut readiness_interval = interval(POLL_INTERVAL);
        let mut timeout_interval = interval(Duration::from_secs(1));
        let mut last_tick = Instant::now();
        let mut tick: u64 = 0;

        info!("Server started successfully");

        loop {
            let gate_closed = !self.session.scene.is_server_ready_to_instantiate_objects();
            let spawning = self.session.scene.is_spawning();

            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr);
                        },
                        Some(ServerMessage::SendFailed { addr, error }) => {
                            if let Some(id) = self.session.supervisor.find_by_addr(addr) {
                                self.session.handle_disconnect(id, DisconnectReason::SocketError, Some(&error));
                            }
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                // Handle server tick events
                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;
                    tick += 1;

                    self.session.tick(now, dt);
                    self.flush();

                    if tick % 600 == 0 {
                        debug!("Tick {}: {} connections, {} online characters",
                               tick, self.session.supervisor.len(), self.session.broadcaster.online_count());
                    }
                },

                // Poll the server readiness gate while it is closed
                _ = readiness_interval.tick(), if gate_closed => {
                    if let Err(e) = self.session.poll_readiness(Instant::now()) {
                        error!("{}", e);
                        return Err(e.into());
                    }
                },

                // Spawn one entity, then give the network a turn
                _ = tokio::task::yield_now(), if spawning => {
                    self.session.step_spawn();
                    self.flush();
                },

                _ = timeout_interval.tick() => {
                    let expired = self.session.expire_connections(Instant::now(), self.client_timeout);
                    if !expired.is_empty() {
                        self.flush();
                    }
                },
            }
        }

        Ok(())
    }
}
