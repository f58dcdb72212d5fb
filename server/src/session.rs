//! The server's dispatch context.
//!
//! `ServerSession` bundles every piece of mutable server state and is handed
//! to request and notification handlers explicitly by the router. It has no
//! socket: connection lifecycle events and handler results are turned into
//! addressed datagrams by [`ServerSession::flush`], which the network layer
//! then sends.

use crate::config::{MapDefinition, ServerConfig};
use crate::connection::{Admission, ConnectionSupervisor, DisconnectReason, DisconnectedPeer};
use crate::plugin::PluginSet;
use crate::scene::SceneState;
use crate::spawn::SpawnStep;
use crate::world::SceneWorld;
use crate::world_state::{Outgoing, Target, WorldStateBroadcaster};
use log::{info, warn};
use shared::map_info::{MapInfo, MapInfoError};
use shared::physics_sync::PhysicsSyncScheduler;
use shared::protocol::PROTOCOL_VERSION;
use shared::time_of_day::TimeOfDayClock;
use shared::{timestamp_ms, ConnectionId, DeliveryClass, Envelope, Packet, ResultCode};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Readiness criterion satisfied once the world catalog is loaded.
pub const WORLD_LOADED_KEY: &str = "world_loaded";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("scene {scene} never became ready to spawn objects")]
    ReadinessTimeout { scene: String },
    #[error(transparent)]
    MapInfo(#[from] MapInfoError),
}

pub struct ServerSession {
    pub supervisor: ConnectionSupervisor,
    pub broadcaster: WorldStateBroadcaster,
    pub scene: SceneState,
    pub world: SceneWorld,
    pub physics: PhysicsSyncScheduler,
    pub plugins: PluginSet,
    outbox: Vec<Outgoing>,
}

impl ServerSession {
    pub fn new(config: &ServerConfig, plugins: PluginSet, now: Instant) -> Result<Self, SessionError> {
        let map_snapshot = config.map.info.snapshot()?;
        let broadcaster = WorldStateBroadcaster::new(
            config.server_info.clone(),
            map_snapshot,
            TimeOfDayClock::new(config.time_of_day_start, config.time_of_day_speed),
            now,
        )
        .with_intervals(config.liveness_interval, config.time_broadcast_interval);

        let scene = SceneState::new(
            config.map.info.map_id.clone(),
            config.map.spawns.clone(),
            config.headless,
            config.readiness_delay,
            config.readiness_timeout,
            now,
        );

        let mut session = Self {
            supervisor: ConnectionSupervisor::new(config.max_clients, config.temporarily_closed),
            broadcaster,
            scene,
            world: SceneWorld::new(),
            physics: PhysicsSyncScheduler::new(config.physics_min_interval),
            plugins,
            outbox: Vec::new(),
        };
        session.activate_scene();
        session.world.load_catalog(config.map.assets.iter().cloned());
        Ok(session)
    }

    /// Registers the criteria every scene activation starts with.
    fn activate_scene(&mut self) {
        let loaded = self.world.loaded_flag();
        self.scene
            .gate_mut()
            .register_criterion(WORLD_LOADED_KEY, move |_: Duration| loaded.load(Ordering::SeqCst));
        self.plugins.register_criteria(self.scene.gate_mut());
    }

    /// Handles a `Connect` datagram. Returns the datagrams to send back.
    pub fn handle_connect(
        &mut self,
        addr: SocketAddr,
        client_version: u32,
        now: Instant,
    ) -> Vec<(SocketAddr, Packet)> {
        if client_version != PROTOCOL_VERSION {
            warn!(
                "Client at {} speaks protocol {} (expected {})",
                addr, client_version, PROTOCOL_VERSION
            );
            return vec![(addr, Packet::kick(ResultCode::VersionMismatch))];
        }

        // A reconnect from the same address replaces the old connection.
        if let Some(existing) = self.supervisor.find_by_addr(addr) {
            info!("Replacing connection {} from {}", existing, addr);
            self.handle_disconnect(existing, DisconnectReason::Replaced, None);
        }

        match self.supervisor.on_peer_connected(addr, now) {
            Admission::Accepted(connection_id) => {
                self.plugins.on_peer_connected(connection_id);
                vec![(addr, Packet::Connected { connection_id })]
            }
            Admission::Rejected(code) => vec![(addr, Packet::kick(code))],
        }
    }

    /// Runs the disconnect cascade once. Safe to call for unknown ids.
    pub fn handle_disconnect(
        &mut self,
        id: ConnectionId,
        reason: DisconnectReason,
        socket_error: Option<&str>,
    ) -> bool {
        let reason = match (reason, self.supervisor.get(id)) {
            (DisconnectReason::Requested, Some(state)) if state.safe_disconnecting => {
                DisconnectReason::SafeDisconnect
            }
            _ => reason,
        };

        let peer = match self.supervisor.on_peer_disconnected(id, reason, socket_error) {
            Some(peer) => peer,
            None => return false,
        };
        self.finish_disconnect(peer, socket_error);
        true
    }

    /// Sends `Kick { reason }` to the connection, then tears it down.
    pub fn kick(&mut self, id: ConnectionId, reason: ResultCode) -> Option<(SocketAddr, Packet)> {
        let (addr, packet, peer) = self.supervisor.kick(id, reason)?;
        self.finish_disconnect(peer, None);
        Some((addr, packet))
    }

    fn finish_disconnect(&mut self, peer: DisconnectedPeer, socket_error: Option<&str>) {
        let id = peer.state.id;
        if !peer.closed_storages.is_empty() {
            info!("Closed storages {:?} held by {}", peer.closed_storages, id);
        }
        if let Some(character_id) = &peer.state.character_id {
            self.broadcaster.unregister_online(character_id);
            self.plugins.on_character_unregistered(id, character_id);
        }
        self.broadcaster.forget_connection(id);
        self.plugins.on_peer_disconnected(id, peer.reason, socket_error);
    }

    /// Polls the server gate. An expired open timeout is fatal.
    pub fn poll_readiness(&mut self, now: Instant) -> Result<bool, SessionError> {
        let started = self.scene.poll_readiness(now);
        if self.scene.readiness_timed_out() {
            return Err(SessionError::ReadinessTimeout {
                scene: self.scene.name().to_string(),
            });
        }
        Ok(started)
    }

    /// Spawns at most one entity. Returns false once nothing is left to do.
    pub fn step_spawn(&mut self) -> bool {
        match self.scene.step_spawn(&mut self.world) {
            SpawnStep::Idle => false,
            SpawnStep::Spawned { .. } => true,
            SpawnStep::StageComplete(progress) => {
                self.plugins.on_spawn_progress(&progress);
                if let Some(outgoing) = self.broadcaster.spawn_progress(&progress) {
                    self.outbox.push(outgoing);
                }
                true
            }
            SpawnStep::Finished(report) => {
                if report.failed > 0 {
                    warn!("{} entities failed to spawn in {}", report.failed, self.scene.name());
                }
                let scene_name = self.scene.name().to_string();
                self.plugins.on_players_ready(&scene_name);
                false
            }
        }
    }

    /// Per-tick work: physics sync, world broadcasts and entity replication.
    pub fn tick(&mut self, now: Instant, dt: f32) {
        self.physics.maybe_sync(&mut self.world, now);

        let outgoing = self.broadcaster.tick(now, dt, &self.supervisor);
        self.outbox.extend(outgoing);

        for snapshot in self.world.take_entity_updates(timestamp_ms()) {
            if let Some(outgoing) = self.broadcaster.entity_state(&snapshot) {
                self.outbox.push(outgoing);
            }
        }
    }

    /// Switches maps. Clients in game receive the new map info right away.
    pub fn change_scene(&mut self, map: &MapDefinition, now: Instant) -> Result<(), SessionError> {
        if let Some(outgoing) = self.broadcaster.change_map(&map.info)? {
            self.outbox.push(outgoing);
        }
        self.world.clear();
        self.scene
            .change_scene(map.info.map_id.clone(), map.spawns.clone(), false, now);
        self.activate_scene();
        self.world.load_catalog(map.assets.iter().cloned());
        Ok(())
    }

    pub fn set_membership(&mut self, id: ConnectionId, party_id: Option<u32>, guild: Option<(u32, String)>) -> bool {
        self.supervisor.set_membership(id, party_id, guild)
    }

    /// Recomputes party/guild rosters immediately instead of waiting for the
    /// next liveness refresh.
    pub fn refresh_membership(&mut self, now: Instant) {
        self.broadcaster.refresh_liveness(now, &self.supervisor);
        let updates = self.broadcaster.membership_updates(&self.supervisor);
        self.outbox.extend(updates);
    }

    pub fn push(&mut self, outgoing: Outgoing) {
        self.outbox.push(outgoing);
    }

    pub fn push_to(&mut self, id: ConnectionId, envelope: Envelope) {
        self.outbox.push(Outgoing::to(id, envelope));
    }

    pub fn pending_outgoing(&self) -> usize {
        self.outbox.len()
    }

    /// Resolves queued messages into datagrams. Reliable envelopes go
    /// through each recipient's channel; messages for connections that are
    /// already gone are dropped.
    pub fn flush(&mut self, now: Instant) -> Vec<(SocketAddr, Packet)> {
        let mut datagrams = Vec::new();

        for outgoing in std::mem::take(&mut self.outbox) {
            let recipients = match outgoing.target {
                Target::Connection(id) => vec![id],
                Target::AllInGame => self.supervisor.in_game_connections(),
                Target::AllReady => self.supervisor.client_ready_connections(),
                Target::AllConnected => self.supervisor.connection_ids(),
            };

            for id in recipients {
                let connection = match self.supervisor.get_mut(id) {
                    Some(connection) => connection,
                    None => continue,
                };
                let packet = match outgoing.envelope.delivery() {
                    DeliveryClass::ReliableOrdered => {
                        connection.channel.send(outgoing.envelope.clone(), now)
                    }
                    DeliveryClass::Unreliable => Packet::unreliable(outgoing.envelope.clone()),
                };
                datagrams.push((connection.addr, packet));
            }
        }

        for connection in self.supervisor.iter_mut() {
            let addr = connection.addr;
            datagrams.extend(
                connection
                    .channel
                    .resend_due(now)
                    .into_iter()
                    .map(|packet| (addr, packet)),
            );
        }

        datagrams
    }

    /// Connections silent for longer than `timeout` are torn down.
    pub fn expire_connections(&mut self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        let expired = self.supervisor.check_timeouts(now, timeout);
        for id in &expired {
            info!("Connection {} timed out", id);
            self.handle_disconnect(*id, DisconnectReason::Timeout, None);
        }
        expired
    }
}
