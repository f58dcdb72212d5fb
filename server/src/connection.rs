//! Connection admission, per-connection state and teardown
//!
//! This module handles the server-side bookkeeping of connected peers, including:
//! - Admission control (temporarily closed server, capacity limit)
//! - Association of a connection with its user and character
//! - Client readiness and party/guild membership used by world broadcasts
//! - The disconnect cascade, which runs exactly once per connection
//!
//! Every piece of connection-scoped state lives in one [`ConnectionState`]
//! record that is created on admission and dropped as a whole on disconnect.

use log::info;
use shared::channel::ReliableChannel;
use shared::{ConnectionId, Packet, ResultCode};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the server knows about one connected peer.
#[derive(Debug)]
pub struct ConnectionState {
    /// Unique connection identifier assigned by the server
    pub id: ConnectionId,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this peer
    pub last_seen: Instant,
    /// Set once the enter-game request succeeded
    pub user_id: Option<String>,
    pub character_id: Option<String>,
    /// Set once the client reported its own world objects ready
    pub client_ready: bool,
    /// Set by the safe-disconnect handshake
    pub safe_disconnecting: bool,
    pub party_id: Option<u32>,
    pub guild_id: Option<u32>,
    pub guild_name: String,
    /// Storages (bank, guild chest, ...) this connection currently holds open
    pub open_storages: Vec<String>,
    /// Reliable-ordered channel towards and from this peer
    pub channel: ReliableChannel,
}

impl ConnectionState {
    pub fn new(id: ConnectionId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
            user_id: None,
            character_id: None,
            client_ready: false,
            safe_disconnecting: false,
            party_id: None,
            guild_id: None,
            guild_name: String::new(),
            open_storages: Vec::new(),
            channel: ReliableChannel::new(),
        }
    }

    pub fn is_in_game(&self) -> bool {
        self.character_id.is_some()
    }

    /// Returns true if nothing has been received within the timeout
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted(ConnectionId),
    Rejected(ResultCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a plain disconnect.
    Requested,
    /// The peer completed the safe-disconnect handshake first.
    SafeDisconnect,
    Timeout,
    Kicked(ResultCode),
    /// The same address connected again.
    Replaced,
    /// Datagrams to the peer can no longer be sent.
    SocketError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Kicked(code) => write!(f, "kicked: {}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Result of the disconnect cascade: the removed record plus what was
/// released on its behalf.
#[derive(Debug)]
pub struct DisconnectedPeer {
    pub state: ConnectionState,
    pub reason: DisconnectReason,
    pub closed_storages: Vec<String>,
}

pub struct ConnectionSupervisor {
    /// Connected peers indexed by their unique ID
    connections: HashMap<ConnectionId, ConnectionState>,
    /// Next available id for new connections
    next_connection_id: u32,
    /// Maximum number of concurrent connections allowed
    max_clients: usize,
    /// While set, every new peer is kicked with `ServerClose`
    temporarily_closed: bool,
}

impl ConnectionSupervisor {
    /// Ids start from 1 and increment for each new connection.
    pub fn new(max_clients: usize, temporarily_closed: bool) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_clients,
            temporarily_closed,
        }
    }

    pub fn set_temporarily_closed(&mut self, closed: bool) {
        self.temporarily_closed = closed;
    }

    pub fn is_temporarily_closed(&self) -> bool {
        self.temporarily_closed
    }

    /// Admits or rejects a new peer. A rejected peer gets no state at all.
    pub fn on_peer_connected(&mut self, addr: SocketAddr, now: Instant) -> Admission {
        if self.temporarily_closed {
            info!("Rejecting {}: server temporarily closed", addr);
            return Admission::Rejected(ResultCode::ServerClose);
        }
        if self.connections.len() >= self.max_clients {
            info!("Rejecting {}: server full", addr);
            return Admission::Rejected(ResultCode::ServerFull);
        }

        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;

        info!("Connection {} admitted from {}", id, addr);
        self.connections
            .insert(id, ConnectionState::new(id, addr, now));
        Admission::Accepted(id)
    }

    /// Runs the unregistration cascade. Only the first call for a connection
    /// returns the removed peer; later calls return `None`, so unregister
    /// events can never fire twice.
    pub fn on_peer_disconnected(
        &mut self,
        id: ConnectionId,
        reason: DisconnectReason,
        socket_error: Option<&str>,
    ) -> Option<DisconnectedPeer> {
        let mut state = self.connections.remove(&id)?;
        let closed_storages = std::mem::take(&mut state.open_storages);

        match socket_error {
            Some(error) => info!("Connection {} closed ({}), socket error: {}", id, reason, error),
            None => info!("Connection {} closed ({})", id, reason),
        }

        Some(DisconnectedPeer {
            state,
            reason,
            closed_storages,
        })
    }

    /// Builds the kick datagram and tears the connection down. The caller
    /// sends the returned packet to the returned address before forgetting it.
    pub fn kick(
        &mut self,
        id: ConnectionId,
        reason: ResultCode,
    ) -> Option<(SocketAddr, Packet, DisconnectedPeer)> {
        let peer = self.on_peer_disconnected(id, DisconnectReason::Kicked(reason), None)?;
        Some((peer.state.addr, Packet::kick(reason), peer))
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionState> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionState> {
        self.connections.get_mut(&id)
    }

    /// Used to associate incoming datagrams with existing connections.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|connection| connection.addr == addr)
            .map(|connection| connection.id)
    }

    pub fn touch(&mut self, id: ConnectionId, now: Instant) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.last_seen = now;
        }
    }

    pub fn register_user(&mut self, id: ConnectionId, user_id: &str) -> Result<(), ResultCode> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(ResultCode::InternalError)?;
        connection.user_id = Some(user_id.to_string());
        Ok(())
    }

    /// Associates a character with the connection. A connection enters the
    /// game once, and a character can only be in game on one connection.
    pub fn register_character(
        &mut self,
        id: ConnectionId,
        character_id: &str,
    ) -> Result<(), ResultCode> {
        if self.find_by_character(character_id).is_some() {
            return Err(ResultCode::AlreadyEnteredGame);
        }

        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(ResultCode::InternalError)?;
        if connection.character_id.is_some() {
            return Err(ResultCode::AlreadyEnteredGame);
        }
        connection.character_id = Some(character_id.to_string());
        Ok(())
    }

    pub fn find_by_character(&self, character_id: &str) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|connection| connection.character_id.as_deref() == Some(character_id))
            .map(|connection| connection.id)
    }

    pub fn mark_client_ready(&mut self, id: ConnectionId) -> Result<(), ResultCode> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(ResultCode::InternalError)?;
        if !connection.is_in_game() {
            return Err(ResultCode::NotEnteredGame);
        }
        connection.client_ready = true;
        Ok(())
    }

    pub fn set_membership(
        &mut self,
        id: ConnectionId,
        party_id: Option<u32>,
        guild: Option<(u32, String)>,
    ) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) => {
                connection.party_id = party_id;
                match guild {
                    Some((guild_id, guild_name)) => {
                        connection.guild_id = Some(guild_id);
                        connection.guild_name = guild_name;
                    }
                    None => {
                        connection.guild_id = None;
                        connection.guild_name.clear();
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn open_storage(&mut self, id: ConnectionId, storage_id: &str) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) => {
                if !connection.open_storages.iter().any(|s| s == storage_id) {
                    connection.open_storages.push(storage_id.to_string());
                }
                true
            }
            None => false,
        }
    }

    /// Closes every storage held by the connection and returns their ids.
    pub fn close_storages(&mut self, id: ConnectionId) -> Vec<String> {
        self.connections
            .get_mut(&id)
            .map(|connection| std::mem::take(&mut connection.open_storages))
            .unwrap_or_default()
    }

    /// Connections silent for longer than `timeout`. They are not removed
    /// here; the caller runs the normal disconnect cascade for each.
    pub fn check_timeouts(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|connection| connection.is_timed_out(now, timeout))
            .map(|connection| connection.id)
            .collect()
    }

    /// Connections whose client reported ready, the audience of party/guild
    /// refreshes.
    pub fn client_ready_connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| connection.client_ready)
            .map(|connection| connection.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn in_game_connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| connection.is_in_game())
            .map(|connection| connection.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionState> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionState> {
        self.connections.values_mut()
    }

    /// Returns the number of currently connected peers
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
