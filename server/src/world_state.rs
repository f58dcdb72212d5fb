//! World state pushed from the server to connected clients.
//!
//! The broadcaster owns the data every client needs once in game (server
//! info, map info, time of day) and the online-character registry behind
//! party and guild rosters. It never touches sockets: every method returns
//! [`Outgoing`] messages that the session addresses and sends.

use crate::connection::ConnectionSupervisor;
use log::{debug, warn};
use serde::Serialize;
use shared::map_info::{MapInfo, MapInfoError};
use shared::messages::{
    ChatChannel, ChatMessage, EnterGameResponse, EntityStateSnapshot, MapInfoSnapshot, MemberEntry,
    MemberUpdate, ServerInfo, SpawnProgressUpdate, TimeOfDayUpdate,
};
use shared::router;
use shared::time_of_day::TimeOfDayClock;
use shared::{timestamp_ms, ConnectionId, Envelope, Opcode};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TIME_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);
/// Online entries not refreshed for this long are considered offline.
pub const ONLINE_EXPIRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Connection(ConnectionId),
    /// Every connection with a character in game
    AllInGame,
    /// Every client-ready connection
    AllReady,
    /// Every admitted connection, in game or not
    AllConnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub target: Target,
    pub envelope: Envelope,
}

impl Outgoing {
    pub fn to(id: ConnectionId, envelope: Envelope) -> Self {
        Self {
            target: Target::Connection(id),
            envelope,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GroupKind {
    Party,
    Guild,
}

impl GroupKind {
    fn opcode(self) -> Opcode {
        match self {
            GroupKind::Party => Opcode::PARTY_MEMBERS,
            GroupKind::Guild => Opcode::GUILD_MEMBERS,
        }
    }
}

#[derive(Debug, Clone)]
struct OnlineCharacter {
    connection: ConnectionId,
    last_seen: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Membership {
    party_id: Option<u32>,
    guild_id: Option<u32>,
}

pub struct WorldStateBroadcaster {
    server_info: ServerInfo,
    map_snapshot: MapInfoSnapshot,
    clock: TimeOfDayClock,
    online: HashMap<String, OnlineCharacter>,
    /// Known memberships, kept after a character goes offline while someone
    /// online still shares a group with it, so rosters can show it offline.
    memberships: BTreeMap<String, Membership>,
    notified: HashMap<(ConnectionId, GroupKind), MemberUpdate>,
    liveness_interval: Duration,
    time_interval: Duration,
    last_liveness: Instant,
    last_time_broadcast: Instant,
}

impl WorldStateBroadcaster {
    pub fn new(
        server_info: ServerInfo,
        map_snapshot: MapInfoSnapshot,
        clock: TimeOfDayClock,
        now: Instant,
    ) -> Self {
        Self {
            server_info,
            map_snapshot,
            clock,
            online: HashMap::new(),
            memberships: BTreeMap::new(),
            notified: HashMap::new(),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            time_interval: DEFAULT_TIME_BROADCAST_INTERVAL,
            last_liveness: now,
            last_time_broadcast: now,
        }
    }

    pub fn with_intervals(mut self, liveness: Duration, time_of_day: Duration) -> Self {
        self.liveness_interval = liveness;
        self.time_interval = time_of_day;
        self
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn map_snapshot(&self) -> &MapInfoSnapshot {
        &self.map_snapshot
    }

    pub fn time_of_day(&self) -> f32 {
        self.clock.hours()
    }

    /// Advances the clock and runs whichever periodic jobs are due.
    pub fn tick(&mut self, now: Instant, dt: f32, supervisor: &ConnectionSupervisor) -> Vec<Outgoing> {
        self.clock.advance(dt);
        let mut outgoing = Vec::new();

        if now.saturating_duration_since(self.last_liveness) >= self.liveness_interval {
            self.last_liveness = now;
            self.refresh_liveness(now, supervisor);
            outgoing.extend(self.membership_updates(supervisor));
        }

        if now.saturating_duration_since(self.last_time_broadcast) >= self.time_interval {
            self.last_time_broadcast = now;
            outgoing.extend(self.time_of_day_update());
        }

        outgoing
    }

    /// The data a client needs to enter the game.
    pub fn enter_game_payload(&self) -> EnterGameResponse {
        EnterGameResponse {
            server_info: self.server_info.clone(),
            map_info: self.map_snapshot.clone(),
            time_of_day: self.clock.hours(),
        }
    }

    pub fn register_online(&mut self, connection: ConnectionId, character_id: &str, now: Instant) {
        self.online.insert(
            character_id.to_string(),
            OnlineCharacter {
                connection,
                last_seen: now,
            },
        );
        self.memberships.entry(character_id.to_string()).or_default();
    }

    pub fn unregister_online(&mut self, character_id: &str) {
        self.online.remove(character_id);
    }

    /// Drops per-connection notification bookkeeping.
    pub fn forget_connection(&mut self, id: ConnectionId) {
        self.notified.retain(|(connection, _), _| *connection != id);
    }

    pub fn is_online(&self, character_id: &str) -> bool {
        self.online.contains_key(character_id)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Refreshes online entries from live connections and expires the rest.
    pub fn refresh_liveness(&mut self, now: Instant, supervisor: &ConnectionSupervisor) {
        for connection in supervisor.iter() {
            let character_id = match &connection.character_id {
                Some(character_id) => character_id,
                None => continue,
            };
            let entry = self
                .online
                .entry(character_id.clone())
                .or_insert_with(|| OnlineCharacter {
                    connection: connection.id,
                    last_seen: connection.last_seen,
                });
            entry.connection = connection.id;
            entry.last_seen = connection.last_seen;
            self.memberships.insert(
                character_id.clone(),
                Membership {
                    party_id: connection.party_id,
                    guild_id: connection.guild_id,
                },
            );
        }

        let before = self.online.len();
        self.online.retain(|character_id, entry| {
            let live = supervisor
                .get(entry.connection)
                .map_or(false, |connection| connection.character_id.as_deref() == Some(character_id.as_str()));
            live && now.saturating_duration_since(entry.last_seen) < ONLINE_EXPIRY
        });
        if self.online.len() != before {
            debug!("{} characters went offline", before - self.online.len());
        }

        self.prune_memberships();
    }

    /// Forgets offline characters that share no group with anyone online.
    fn prune_memberships(&mut self) {
        let mut parties = HashSet::new();
        let mut guilds = HashSet::new();
        for (character_id, membership) in &self.memberships {
            if self.online.contains_key(character_id) {
                parties.extend(membership.party_id);
                guilds.extend(membership.guild_id);
            }
        }

        let online = &self.online;
        self.memberships.retain(|character_id, membership| {
            online.contains_key(character_id)
                || membership.party_id.map_or(false, |id| parties.contains(&id))
                || membership.guild_id.map_or(false, |id| guilds.contains(&id))
        });
    }

    /// Roster updates for every client-ready connection whose membership or
    /// group roster differs from what it was last sent.
    pub fn membership_updates(&mut self, supervisor: &ConnectionSupervisor) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();

        for id in supervisor.client_ready_connections() {
            let connection = match supervisor.get(id) {
                Some(connection) => connection,
                None => continue,
            };

            for (kind, group_id) in [
                (GroupKind::Party, connection.party_id),
                (GroupKind::Guild, connection.guild_id),
            ] {
                let update = self.roster(kind, group_id);
                let key = (id, kind);
                let unchanged = match self.notified.get(&key) {
                    Some(previous) => *previous == update,
                    // Nothing to clear for a connection never told about a group.
                    None => update.group_id == 0,
                };
                if unchanged {
                    continue;
                }

                if let Some(envelope) = encode(kind.opcode(), &update) {
                    outgoing.push(Outgoing::to(id, envelope));
                }
                self.notified.insert(key, update);
            }
        }

        outgoing
    }

    fn roster(&self, kind: GroupKind, group_id: Option<u32>) -> MemberUpdate {
        let group_id = match group_id {
            Some(group_id) => group_id,
            None => {
                return MemberUpdate {
                    group_id: 0,
                    members: Vec::new(),
                }
            }
        };

        let members = self
            .memberships
            .iter()
            .filter(|(_, membership)| match kind {
                GroupKind::Party => membership.party_id == Some(group_id),
                GroupKind::Guild => membership.guild_id == Some(group_id),
            })
            .map(|(character_id, _)| MemberEntry {
                character_id: character_id.clone(),
                online: self.online.contains_key(character_id),
            })
            .collect();

        MemberUpdate { group_id, members }
    }

    pub fn time_of_day_update(&self) -> Option<Outgoing> {
        let update = TimeOfDayUpdate {
            time_of_day: self.clock.hours(),
            server_time_ms: timestamp_ms(),
        };
        encode(Opcode::TIME_OF_DAY, &update).map(|envelope| Outgoing {
            target: Target::AllReady,
            envelope,
        })
    }

    /// Replaces the map info and announces it to everyone in game.
    pub fn change_map<M: MapInfo>(&mut self, info: &M) -> Result<Option<Outgoing>, MapInfoError> {
        self.map_snapshot = info.snapshot()?;
        Ok(encode(Opcode::MAP_INFO, &self.map_snapshot).map(|envelope| Outgoing {
            target: Target::AllInGame,
            envelope,
        }))
    }

    pub fn set_server_info(&mut self, server_info: ServerInfo) -> Option<Outgoing> {
        self.server_info = server_info;
        self.server_info_update()
    }

    pub fn server_info_update(&self) -> Option<Outgoing> {
        encode(Opcode::SERVER_INFO, &self.server_info).map(|envelope| Outgoing {
            target: Target::AllInGame,
            envelope,
        })
    }

    /// Routes a chat message: system and local reach everyone in game,
    /// party and guild only the sender's group.
    pub fn chat(&self, message: &ChatMessage, from: Option<ConnectionId>, supervisor: &ConnectionSupervisor) -> Vec<Outgoing> {
        let envelope = match encode(Opcode::CHAT, message) {
            Some(envelope) => envelope,
            None => return Vec::new(),
        };

        let sender = from.and_then(|id| supervisor.get(id));
        let recipients: Vec<ConnectionId> = match message.channel {
            ChatChannel::System | ChatChannel::Local => {
                return vec![Outgoing {
                    target: Target::AllInGame,
                    envelope,
                }]
            }
            ChatChannel::Party => match sender.and_then(|s| s.party_id) {
                Some(party_id) => supervisor
                    .iter()
                    .filter(|c| c.is_in_game() && c.party_id == Some(party_id))
                    .map(|c| c.id)
                    .collect(),
                None => Vec::new(),
            },
            ChatChannel::Guild => match sender.and_then(|s| s.guild_id) {
                Some(guild_id) => supervisor
                    .iter()
                    .filter(|c| c.is_in_game() && c.guild_id == Some(guild_id))
                    .map(|c| c.id)
                    .collect(),
                None => Vec::new(),
            },
        };

        let mut recipients = recipients;
        recipients.sort();
        recipients
            .into_iter()
            .map(|id| Outgoing::to(id, envelope.clone()))
            .collect()
    }

    pub fn entity_state(&self, snapshot: &EntityStateSnapshot) -> Option<Outgoing> {
        encode(Opcode::ENTITY_STATE, snapshot).map(|envelope| Outgoing {
            target: Target::AllReady,
            envelope,
        })
    }

    pub fn spawn_progress(&self, progress: &SpawnProgressUpdate) -> Option<Outgoing> {
        encode(Opcode::SPAWN_PROGRESS, progress).map(|envelope| Outgoing {
            target: Target::AllConnected,
            envelope,
        })
    }
}

fn encode<T: Serialize>(opcode: Opcode, message: &T) -> Option<Envelope> {
    match router::notification(opcode, message) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("Dropping broadcast: {}", e);
            None
        }
    }
}
