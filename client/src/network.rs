//! Client network layer: the UDP loop and the session handshakes
//!
//! [`Client`] keeps its handshake state synchronous and queues outgoing
//! packets; `run` only moves datagrams between the socket and that state.

use crate::config::ClientConfig;
use crate::session::{client_router, ClientSession, SERVER_PEER};
use log::{debug, error, info, warn};
use serde::Serialize;
use shared::channel::ReliableChannel;
use shared::correlation::{PendingRequests, RequestError};
use shared::messages::{
    ChatChannel, ChatMessage, ClientReadyRequest, EnterGameRequest, EnterGameResponse,
    SafeDisconnectRequest,
};
use shared::protocol::{decode_packet, encode_packet, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use shared::readiness::{ReadinessGate, ReadinessScope, POLL_INTERVAL};
use shared::router::{self, decode_payload, MessageRouter};
use shared::{ConnectionId, Envelope, MessageKind, Opcode, Packet, ResultCode};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// Silence from the server for this long ends the session.
pub const CONNECTION_LOST_AFTER: Duration = Duration::from_secs(5);
pub const MAP_INFO_KEY: &str = "map_info_received";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Connecting,
    EnteringGame,
    AwaitingReadiness,
    SendingReady,
    InGame,
    Disconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOutcome {
    /// Left on our own, through the safe-disconnect handshake or before
    /// the server answered the connect.
    Completed,
    Rejected(ResultCode),
    Kicked(ResultCode),
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestToken {
    EnterGame,
    ClientReady,
    SafeDisconnect,
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    config: ClientConfig,

    phase: ClientPhase,
    connection_id: Option<ConnectionId>,
    outcome: Option<ClientOutcome>,

    router: MessageRouter<ClientSession>,
    session: ClientSession,
    channel: ReliableChannel,
    pending: PendingRequests<RequestToken>,
    gate: Option<ReadinessGate>,

    last_received: Instant,
    next_enter_attempt: Option<Instant>,
    in_game_since: Option<Instant>,
    outbox: Vec<Packet>,

    shutdown_tx: mpsc::UnboundedSender<()>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
}

impl Client {
    pub async fn new(config: ClientConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = config.server_addr.parse()?;
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        Ok(Client {
            socket,
            server_addr,
            config,
            phase: ClientPhase::Connecting,
            connection_id: None,
            outcome: None,
            router: client_router(),
            session: ClientSession::new(),
            channel: ReliableChannel::new(),
            pending: PendingRequests::new(),
            gate: None,
            last_received: Instant::now(),
            next_enter_attempt: None,
            in_game_since: None,
            outbox: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn outcome(&self) -> Option<ClientOutcome> {
        self.outcome
    }

    /// Sending on the handle starts the safe-disconnect handshake.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<()> {
        self.shutdown_tx.clone()
    }

    pub async fn run(&mut self) -> Result<ClientOutcome, Box<dyn std::error::Error>> {
        info!("Connecting to {}...", self.server_addr);
        self.start(Instant::now());
        self.flush().await;

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately and the connect is already out.
        heartbeat.tick().await;
        let mut poll = interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        while self.phase != ClientPhase::Closed {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) => self.handle_datagram(&buffer[..len], from, Instant::now()),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat.tick() => self.on_heartbeat(),

                _ = poll.tick() => self.on_poll(Instant::now()),

                Some(()) = self.shutdown_rx.recv() => self.begin_safe_disconnect(Instant::now()),
            }

            self.flush().await;
        }

        Ok(self.outcome.unwrap_or(ClientOutcome::Completed))
    }

    async fn flush(&mut self) {
        for packet in std::mem::take(&mut self.outbox) {
            match encode_packet(&packet) {
                Ok(data) => {
                    if let Err(e) = self.socket.send_to(&data, self.server_addr).await {
                        error!("Failed to send packet: {}", e);
                    }
                }
                Err(e) => error!("Failed to serialize packet: {}", e),
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        if from != self.server_addr {
            debug!("Ignoring datagram from {}", from);
            return;
        }
        match decode_packet(data) {
            Ok(packet) => self.handle_packet(packet, now),
            Err(e) => warn!("Dropping malformed datagram: {}", e),
        }
    }

    fn start(&mut self, now: Instant) {
        self.phase = ClientPhase::Connecting;
        self.last_received = now;
        self.outbox.push(Packet::Connect {
            client_version: PROTOCOL_VERSION,
        });
    }

    fn on_heartbeat(&mut self) {
        match self.phase {
            // Connect travels unreliably; repeat it until answered.
            ClientPhase::Connecting => self.outbox.push(Packet::Connect {
                client_version: PROTOCOL_VERSION,
            }),
            ClientPhase::Closed => {}
            _ => self.outbox.push(Packet::Heartbeat),
        }
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) {
        if self.phase == ClientPhase::Closed {
            return;
        }
        self.last_received = now;

        match packet {
            Packet::Connected { connection_id } => {
                if self.phase != ClientPhase::Connecting {
                    debug!("Ignoring repeated connect confirmation");
                    return;
                }
                info!("Connected! Connection ID: {}", connection_id);
                self.connection_id = Some(connection_id);
                self.phase = ClientPhase::EnteringGame;
                self.send_enter_game(now);
            }

            Packet::Kick { reason } => {
                let code = ResultCode::from_u16(reason);
                warn!("Kicked by server: {}", code);
                self.finish(ClientOutcome::Kicked(code));
            }

            Packet::Reliable { sequence, envelope } => {
                let (delivered, ack) = self.channel.receive(sequence, envelope);
                self.outbox.push(ack);
                for envelope in delivered {
                    if self.phase == ClientPhase::Closed {
                        break;
                    }
                    self.handle_envelope(envelope, now);
                }
            }

            Packet::Unreliable { envelope } => self.handle_envelope(envelope, now),

            Packet::Ack { sequence } => self.channel.on_ack(sequence),

            Packet::Heartbeat => {}

            Packet::Disconnect => {
                warn!("Server closed the connection");
                self.finish(ClientOutcome::ConnectionLost);
            }

            Packet::Connect { .. } => {
                warn!("Unexpected packet type");
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope, now: Instant) {
        match envelope.kind {
            MessageKind::Response {
                correlation_id,
                result,
            } => match self.pending.fulfill(correlation_id) {
                Some((_, token)) => self.handle_response(token, result, &envelope, now),
                None => debug!(
                    "Dropping {} response {} without a pending request",
                    envelope.opcode, correlation_id
                ),
            },
            MessageKind::Notification => {
                if let Err(e) = self.router.dispatch(&mut self.session, SERVER_PEER, &envelope) {
                    warn!("Failed to handle {}: {}", envelope.opcode, e);
                }
            }
            MessageKind::Request { .. } => {
                warn!("Server sent an unexpected {} request", envelope.opcode);
            }
        }
    }

    fn handle_response(
        &mut self,
        token: RequestToken,
        result: ResultCode,
        envelope: &Envelope,
        now: Instant,
    ) {
        if self.phase == ClientPhase::Disconnecting && token != RequestToken::SafeDisconnect {
            debug!("Ignoring {:?} response while disconnecting", token);
            return;
        }

        match token {
            RequestToken::EnterGame => {
                if result == ResultCode::ServerNotReady {
                    if let Some(retry) = self.config.enter_retry {
                        info!("Server not ready, retrying in {:?}", retry);
                        self.next_enter_attempt = Some(now + retry);
                        return;
                    }
                }
                if !result.is_success() {
                    self.reject(result);
                    return;
                }

                match decode_payload::<EnterGameResponse>(envelope) {
                    Ok(response) => {
                        self.session.apply_enter_game(&response);
                        self.begin_readiness(now);
                    }
                    Err(e) => {
                        error!("Malformed enter game response: {}", e);
                        self.reject(ResultCode::MalformedMessage);
                    }
                }
            }

            RequestToken::ClientReady => {
                if !result.is_success() {
                    self.reject(result);
                    return;
                }
                info!("In game as {}", self.config.character_id);
                self.phase = ClientPhase::InGame;
                self.in_game_since = Some(now);
                if let Some(text) = self.config.chat.clone() {
                    self.send_chat(text, now);
                }
            }

            RequestToken::SafeDisconnect => {
                if !result.is_success() {
                    warn!("Safe disconnect answered with {}", result);
                }
                self.close_connection();
                self.finish(ClientOutcome::Completed);
            }
        }
    }

    fn begin_readiness(&mut self, now: Instant) {
        let mut gate = ReadinessGate::with_minimum_delay(
            ReadinessScope::ClientObjects,
            now,
            self.config.readiness_delay,
        );
        let received = self.session.map_info_flag();
        gate.register_criterion(MAP_INFO_KEY, move |_: Duration| {
            received.load(Ordering::SeqCst)
        });

        self.gate = Some(gate);
        self.phase = ClientPhase::AwaitingReadiness;
    }

    fn on_poll(&mut self, now: Instant) {
        if self.phase == ClientPhase::Closed {
            return;
        }

        if now.saturating_duration_since(self.last_received) >= CONNECTION_LOST_AFTER {
            for (opcode, token) in self.pending.fail_all() {
                warn!(
                    "{} request ({:?}) failed: {}",
                    opcode,
                    token,
                    RequestError::ConnectionLost
                );
            }
            warn!("No traffic from server for {:?}", CONNECTION_LOST_AFTER);
            self.finish(ClientOutcome::ConnectionLost);
            return;
        }

        for (opcode, token) in self.pending.expire(now) {
            warn!("{} request failed: {}", opcode, RequestError::Timeout);
            if token == RequestToken::SafeDisconnect {
                self.close_connection();
                self.finish(ClientOutcome::Completed);
            } else {
                self.reject(ResultCode::Timeout);
            }
            return;
        }

        if self.phase == ClientPhase::EnteringGame {
            if let Some(at) = self.next_enter_attempt {
                if now >= at {
                    self.send_enter_game(now);
                }
            }
        }

        if self.phase == ClientPhase::AwaitingReadiness {
            let opened = self.gate.as_mut().map_or(false, |gate| gate.poll(now));
            if opened {
                self.phase = ClientPhase::SendingReady;
                let deadline = now + self.config.request_timeout;
                self.send_request(
                    Opcode::CLIENT_READY,
                    RequestToken::ClientReady,
                    &ClientReadyRequest,
                    deadline,
                    now,
                );
            }
        }

        if self.phase == ClientPhase::InGame {
            if let (Some(stay), Some(since)) = (self.config.stay_in_game, self.in_game_since) {
                if now.saturating_duration_since(since) >= stay {
                    self.begin_safe_disconnect(now);
                }
            }
        }

        let resends = self.channel.resend_due(now);
        self.outbox.extend(resends);
    }

    fn begin_safe_disconnect(&mut self, now: Instant) {
        match self.phase {
            ClientPhase::Connecting => self.finish(ClientOutcome::Completed),
            ClientPhase::EnteringGame
            | ClientPhase::AwaitingReadiness
            | ClientPhase::SendingReady
            | ClientPhase::InGame => {
                info!("Leaving the game safely");
                self.phase = ClientPhase::Disconnecting;
                let deadline = now + self.config.safe_disconnect_timeout;
                self.send_request(
                    Opcode::SAFE_DISCONNECT,
                    RequestToken::SafeDisconnect,
                    &SafeDisconnectRequest,
                    deadline,
                    now,
                );
            }
            ClientPhase::Disconnecting | ClientPhase::Closed => {}
        }
    }

    fn send_enter_game(&mut self, now: Instant) {
        self.next_enter_attempt = None;
        let request = EnterGameRequest {
            user_id: self.config.user_id.clone(),
            character_id: self.config.character_id.clone(),
        };
        let deadline = now + self.config.request_timeout;
        self.send_request(
            Opcode::ENTER_GAME,
            RequestToken::EnterGame,
            &request,
            deadline,
            now,
        );
    }

    fn send_request<T: Serialize>(
        &mut self,
        opcode: Opcode,
        token: RequestToken,
        message: &T,
        deadline: Instant,
        now: Instant,
    ) {
        let correlation_id = self.pending.insert(opcode, token, deadline);
        match router::request(opcode, correlation_id, message) {
            Ok(envelope) => {
                let packet = self.channel.send(envelope, now);
                self.outbox.push(packet);
            }
            Err(e) => {
                error!("Failed to encode {} request: {}", opcode, e);
                self.pending.fulfill(correlation_id);
                self.reject(ResultCode::MalformedMessage);
            }
        }
    }

    fn send_chat(&mut self, text: String, now: Instant) {
        let message = ChatMessage {
            channel: ChatChannel::Local,
            sender_id: self.config.character_id.clone(),
            sender_name: self.config.character_id.clone(),
            guild_id: 0,
            guild_name: String::new(),
            text,
            sent_by_server: false,
        };
        match router::notification(Opcode::CHAT, &message) {
            Ok(envelope) => {
                let packet = self.channel.send(envelope, now);
                self.outbox.push(packet);
            }
            Err(e) => error!("Failed to encode chat message: {}", e),
        }
    }

    fn reject(&mut self, code: ResultCode) {
        warn!("Session rejected: {}", code);
        self.close_connection();
        self.finish(ClientOutcome::Rejected(code));
    }

    fn close_connection(&mut self) {
        if self.connection_id.is_some() {
            self.outbox.push(Packet::Disconnect);
        }
    }

    fn finish(&mut self, outcome: ClientOutcome) {
        if self.phase == ClientPhase::Closed {
            return;
        }
        for (opcode, token) in self.pending.fail_all() {
            debug!("Abandoning pending {} request ({:?})", opcode, token);
        }
        self.phase = ClientPhase::Closed;
        self.outcome = Some(outcome);
        info!("Session closed: {:?}", outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::map_info::{BasicMapInfo, MapInfo};
    use shared::messages::{MapInfoSnapshot, ServerInfo};

    fn test_config() -> ClientConfig {
        ClientConfig {
            readiness_delay: Duration::from_millis(50),
            enter_retry: Some(Duration::from_millis(100)),
            ..Default::default()
        }
    }

    async fn connected_client(config: ClientConfig, now: Instant) -> Client {
        let mut client = Client::new(config).await.unwrap();
        client.start(now);
        client.handle_packet(
            Packet::Connected {
                connection_id: ConnectionId(4),
            },
            now,
        );
        client
    }

    fn request_id(packets: &[Packet], opcode: Opcode) -> u32 {
        packets
            .iter()
            .find_map(|packet| match packet {
                Packet::Reliable { envelope, .. } if envelope.opcode == opcode => {
                    envelope.correlation_id()
                }
                _ => None,
            })
            .unwrap_or_else(|| panic!("No {} request in {:?}", opcode, packets))
    }

    fn response(
        server: &mut ReliableChannel,
        opcode: Opcode,
        correlation_id: u32,
        result: ResultCode,
        payload: Vec<u8>,
        now: Instant,
    ) -> Packet {
        let envelope = Envelope {
            opcode,
            kind: MessageKind::Response {
                correlation_id,
                result,
            },
            payload,
        };
        server.send(envelope, now)
    }

    fn enter_payload() -> Vec<u8> {
        bincode::serialize(&EnterGameResponse {
            server_info: ServerInfo {
                channel_id: "ch1".into(),
                title: "Channel 1".into(),
                description: String::new(),
            },
            map_info: BasicMapInfo::new("Town01").snapshot().unwrap(),
            time_of_day: 8.0,
        })
        .unwrap()
    }

    async fn in_game_client(now: Instant) -> (Client, ReliableChannel) {
        let mut server = ReliableChannel::new();
        let mut client = connected_client(test_config(), now).await;

        let packets = std::mem::take(&mut client.outbox);
        let enter = request_id(&packets, Opcode::ENTER_GAME);
        let packet = response(&mut server, Opcode::ENTER_GAME, enter, ResultCode::None, enter_payload(), now);
        client.handle_packet(packet, now);

        client.on_poll(now + Duration::from_millis(50));
        let packets = std::mem::take(&mut client.outbox);
        let ready = request_id(&packets, Opcode::CLIENT_READY);
        let packet = response(&mut server, Opcode::CLIENT_READY, ready, ResultCode::None, Vec::new(), now);
        client.handle_packet(packet, now + Duration::from_millis(60));
        client.outbox.clear();

        (client, server)
    }

    #[test]
    fn test_bad_server_address_is_rejected() {
        let config = ClientConfig {
            server_addr: "not an address".into(),
            ..test_config()
        };
        assert!(tokio_test::block_on(Client::new(config)).is_err());
    }

    #[tokio::test]
    async fn test_connect_then_enter_game_request() {
        let now = Instant::now();
        let mut client = Client::new(test_config()).await.unwrap();
        client.start(now);

        assert_eq!(
            client.outbox,
            vec![Packet::Connect {
                client_version: PROTOCOL_VERSION
            }]
        );
        client.outbox.clear();

        client.handle_packet(
            Packet::Connected {
                connection_id: ConnectionId(4),
            },
            now,
        );

        assert_eq!(client.phase(), ClientPhase::EnteringGame);
        assert_eq!(client.connection_id(), Some(ConnectionId(4)));
        request_id(&client.outbox, Opcode::ENTER_GAME);
    }

    #[tokio::test]
    async fn test_full_handshake_reaches_in_game() {
        let now = Instant::now();
        let (client, _) = in_game_client(now).await;

        assert_eq!(client.phase(), ClientPhase::InGame);
        assert_eq!(client.session().map_info.current().map_id, "Town01");
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn test_readiness_waits_for_minimum_delay() {
        let now = Instant::now();
        let mut server = ReliableChannel::new();
        let mut client = connected_client(test_config(), now).await;
        let enter = request_id(&client.outbox, Opcode::ENTER_GAME);
        client.outbox.clear();

        let packet = response(&mut server, Opcode::ENTER_GAME, enter, ResultCode::None, enter_payload(), now);
        client.handle_packet(packet, now);
        assert_eq!(client.phase(), ClientPhase::AwaitingReadiness);

        client.on_poll(now + Duration::from_millis(10));
        assert_eq!(client.phase(), ClientPhase::AwaitingReadiness);

        client.on_poll(now + Duration::from_millis(60));
        assert_eq!(client.phase(), ClientPhase::SendingReady);
    }

    #[tokio::test]
    async fn test_foreign_map_info_does_not_stall_readiness() {
        let now = Instant::now();
        let mut server = ReliableChannel::new();
        let mut client = connected_client(test_config(), now).await;
        let enter = request_id(&client.outbox, Opcode::ENTER_GAME);
        client.outbox.clear();

        let payload = bincode::serialize(&EnterGameResponse {
            server_info: ServerInfo {
                channel_id: "ch1".into(),
                title: "Channel 1".into(),
                description: String::new(),
            },
            map_info: MapInfoSnapshot {
                map_id: "Dungeon02".into(),
                type_name: "DungeonMapInfo".into(),
                payload: vec![1, 2, 3],
            },
            time_of_day: 8.0,
        })
        .unwrap();
        let packet = response(&mut server, Opcode::ENTER_GAME, enter, ResultCode::None, payload, now);
        client.handle_packet(packet, now);
        assert_eq!(client.phase(), ClientPhase::AwaitingReadiness);

        client.on_poll(now + Duration::from_millis(60));
        assert_eq!(client.phase(), ClientPhase::SendingReady);
        assert_eq!(client.session().map_info.current(), BasicMapInfo::default());
        request_id(&client.outbox, Opcode::CLIENT_READY);
    }

    #[tokio::test]
    async fn test_datagrams_from_other_hosts_are_ignored() {
        let now = Instant::now();
        let mut client = connected_client(test_config(), now).await;
        let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let kick = encode_packet(&Packet::kick(ResultCode::ServerClose)).unwrap();

        client.handle_datagram(&kick, stranger, now);
        assert_eq!(client.phase(), ClientPhase::EnteringGame);
        assert_eq!(client.outcome(), None);

        let server_addr = client.server_addr;
        client.handle_datagram(&kick, server_addr, now);
        assert_eq!(client.outcome(), Some(ClientOutcome::Kicked(ResultCode::ServerClose)));
    }

    #[tokio::test]
    async fn test_server_not_ready_is_retried() {
        let now = Instant::now();
        let mut server = ReliableChannel::new();
        let mut client = connected_client(test_config(), now).await;
        let first = request_id(&client.outbox, Opcode::ENTER_GAME);
        client.outbox.clear();

        let packet = response(&mut server, Opcode::ENTER_GAME, first, ResultCode::ServerNotReady, Vec::new(), now);
        client.handle_packet(packet, now);
        assert_eq!(client.phase(), ClientPhase::EnteringGame);

        client.outbox.clear();
        client.on_poll(now + Duration::from_millis(50));
        assert!(!client
            .outbox
            .iter()
            .any(|packet| matches!(packet, Packet::Reliable { envelope, .. } if envelope.opcode == Opcode::ENTER_GAME)));

        client.on_poll(now + Duration::from_millis(100));
        let second = request_id(&client.outbox, Opcode::ENTER_GAME);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_rejection_ends_session() {
        let now = Instant::now();
        let mut server = ReliableChannel::new();
        let mut client = connected_client(test_config(), now).await;
        let enter = request_id(&client.outbox, Opcode::ENTER_GAME);
        client.outbox.clear();

        let packet = response(&mut server, Opcode::ENTER_GAME, enter, ResultCode::AlreadyEnteredGame, Vec::new(), now);
        client.handle_packet(packet, now);

        assert_eq!(client.phase(), ClientPhase::Closed);
        assert_eq!(
            client.outcome(),
            Some(ClientOutcome::Rejected(ResultCode::AlreadyEnteredGame))
        );
        assert!(client.outbox.contains(&Packet::Disconnect));
    }

    #[tokio::test]
    async fn test_duplicate_response_is_dropped() {
        let now = Instant::now();
        let mut server = ReliableChannel::new();
        let mut client = connected_client(test_config(), now).await;
        let enter = request_id(&client.outbox, Opcode::ENTER_GAME);

        let packet = response(&mut server, Opcode::ENTER_GAME, enter, ResultCode::None, enter_payload(), now);
        client.handle_packet(packet, now);
        let duplicate = response(&mut server, Opcode::ENTER_GAME, enter, ResultCode::InternalError, Vec::new(), now);
        client.handle_packet(duplicate, now);

        assert_eq!(client.phase(), ClientPhase::AwaitingReadiness);
        assert_eq!(client.outcome(), None);
    }

    #[tokio::test]
    async fn test_kick_reports_code() {
        let now = Instant::now();
        let mut client = Client::new(test_config()).await.unwrap();
        client.start(now);

        client.handle_packet(Packet::kick(ResultCode::ServerClose), now);

        assert_eq!(client.phase(), ClientPhase::Closed);
        assert_eq!(
            client.outcome(),
            Some(ClientOutcome::Kicked(ResultCode::ServerClose))
        );
    }

    #[tokio::test]
    async fn test_silence_means_connection_lost() {
        let now = Instant::now();
        let mut client = connected_client(test_config(), now).await;
        assert_eq!(client.pending.len(), 1);

        client.on_poll(now + CONNECTION_LOST_AFTER);

        assert_eq!(client.outcome(), Some(ClientOutcome::ConnectionLost));
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn test_request_timeout_rejects() {
        let now = Instant::now();
        let config = ClientConfig {
            request_timeout: Duration::from_millis(500),
            ..test_config()
        };
        let mut client = connected_client(config, now).await;

        // Traffic keeps the connection alive; only the request expires.
        client.handle_packet(Packet::Heartbeat, now + Duration::from_millis(400));
        client.on_poll(now + Duration::from_millis(500));

        assert_eq!(
            client.outcome(),
            Some(ClientOutcome::Rejected(ResultCode::Timeout))
        );
    }

    #[tokio::test]
    async fn test_safe_disconnect_acknowledged() {
        let now = Instant::now();
        let (mut client, mut server) = in_game_client(now).await;

        client.begin_safe_disconnect(now);
        assert_eq!(client.phase(), ClientPhase::Disconnecting);
        let id = request_id(&client.outbox, Opcode::SAFE_DISCONNECT);
        client.outbox.clear();

        let packet = response(&mut server, Opcode::SAFE_DISCONNECT, id, ResultCode::None, Vec::new(), now);
        client.handle_packet(packet, now);

        assert_eq!(client.outcome(), Some(ClientOutcome::Completed));
        assert!(client.outbox.contains(&Packet::Disconnect));
    }

    #[tokio::test]
    async fn test_safe_disconnect_times_out() {
        let now = Instant::now();
        let (mut client, _) = in_game_client(now).await;

        client.begin_safe_disconnect(now);
        client.outbox.clear();
        client.on_poll(now + Duration::from_secs(1));
        assert_eq!(client.phase(), ClientPhase::Disconnecting);

        client.handle_packet(Packet::Heartbeat, now + Duration::from_secs(1));
        client.on_poll(now + client.config.safe_disconnect_timeout);

        assert_eq!(client.outcome(), Some(ClientOutcome::Completed));
        assert!(client.outbox.contains(&Packet::Disconnect));
    }

    #[tokio::test]
    async fn test_chat_is_sent_once_in_game() {
        let now = Instant::now();
        let mut server = ReliableChannel::new();
        let config = ClientConfig {
            chat: Some("hello".into()),
            ..test_config()
        };
        let mut client = connected_client(config, now).await;
        let enter = request_id(&client.outbox, Opcode::ENTER_GAME);
        let packet = response(&mut server, Opcode::ENTER_GAME, enter, ResultCode::None, enter_payload(), now);
        client.handle_packet(packet, now);
        client.on_poll(now + Duration::from_millis(50));
        let ready = request_id(&client.outbox, Opcode::CLIENT_READY);
        client.outbox.clear();

        let packet = response(&mut server, Opcode::CLIENT_READY, ready, ResultCode::None, Vec::new(), now);
        client.handle_packet(packet, now);

        let chat = client.outbox.iter().find_map(|packet| match packet {
            Packet::Reliable { envelope, .. } if envelope.opcode == Opcode::CHAT => {
                Some(decode_payload::<ChatMessage>(envelope).unwrap())
            }
            _ => None,
        });
        assert_eq!(chat.unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_heartbeat_repeats_connect_until_answered() {
        let now = Instant::now();
        let mut client = Client::new(test_config()).await.unwrap();
        client.start(now);
        client.outbox.clear();

        client.on_heartbeat();
        assert!(matches!(client.outbox.as_slice(), [Packet::Connect { .. }]));

        client.outbox.clear();
        client.handle_packet(
            Packet::Connected {
                connection_id: ConnectionId(1),
            },
            now,
        );
        client.outbox.clear();
        client.on_heartbeat();
        assert_eq!(client.outbox, vec![Packet::Heartbeat]);
    }
}
