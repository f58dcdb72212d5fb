//! Client-side view of the session, updated by server notifications.

use log::{debug, info};
use shared::map_info::{BasicMapInfo, MapInfoStore};
use shared::messages::{
    ChatMessage, EnterGameResponse, EntityStateSnapshot, MapInfoSnapshot, MemberUpdate, ServerInfo,
    SpawnProgressUpdate, TimeOfDayUpdate,
};
use shared::router::MessageRouter;
use shared::time_of_day::TimeOfDayState;
use shared::{ConnectionId, Opcode};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Peer id used when dispatching messages that came from the server.
pub const SERVER_PEER: ConnectionId = ConnectionId(0);
pub const CHAT_LOG_CAPACITY: usize = 100;

pub struct ClientSession {
    pub server_info: Option<ServerInfo>,
    pub map_info: MapInfoStore<BasicMapInfo>,
    map_info_received: Arc<AtomicBool>,
    pub time_of_day: TimeOfDayState,
    pub chat_log: VecDeque<ChatMessage>,
    /// Latest snapshot per replicated object
    pub entities: HashMap<u32, EntityStateSnapshot>,
    pub party: Option<MemberUpdate>,
    pub guild: Option<MemberUpdate>,
    pub spawn_progress: Option<SpawnProgressUpdate>,
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSession {
    pub fn new() -> Self {
        Self {
            server_info: None,
            map_info: MapInfoStore::new(),
            map_info_received: Arc::new(AtomicBool::new(false)),
            time_of_day: TimeOfDayState::default(),
            chat_log: VecDeque::new(),
            entities: HashMap::new(),
            party: None,
            guild: None,
            spawn_progress: None,
        }
    }

    /// Flag readable from a readiness criterion; set once any map info has
    /// been processed, including one rejected in favour of the blank default.
    pub fn map_info_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.map_info_received)
    }

    pub fn apply_enter_game(&mut self, response: &EnterGameResponse) {
        info!(
            "Entered {} ({}) on map {}",
            response.server_info.title, response.server_info.channel_id, response.map_info.map_id
        );
        self.server_info = Some(response.server_info.clone());
        self.apply_map_info(&response.map_info);
        self.time_of_day.seed(response.time_of_day);
    }

    /// Returns whether the snapshot was accepted. A rejected one leaves the
    /// previous value (or the blank default) in place and still counts as
    /// received.
    pub fn apply_map_info(&mut self, snapshot: &MapInfoSnapshot) -> bool {
        let valid = self.map_info.apply(snapshot).is_ok();
        self.map_info_received.store(true, Ordering::SeqCst);
        valid
    }

    pub fn apply_time_of_day(&mut self, update: &TimeOfDayUpdate) -> bool {
        self.time_of_day.apply(update)
    }

    pub fn push_chat(&mut self, message: ChatMessage) {
        info!("[{:?}] {}: {}", message.channel, message.sender_name, message.text);
        if self.chat_log.len() == CHAT_LOG_CAPACITY {
            self.chat_log.pop_front();
        }
        self.chat_log.push_back(message);
    }

    /// Keeps the newest snapshot per object; older ones arriving late are
    /// dropped.
    pub fn apply_entity_state(&mut self, snapshot: EntityStateSnapshot) -> bool {
        match self.entities.get(&snapshot.object_id) {
            Some(current) if current.server_time_ms > snapshot.server_time_ms => false,
            _ => {
                self.entities.insert(snapshot.object_id, snapshot);
                true
            }
        }
    }

    fn set_group(slot: &mut Option<MemberUpdate>, update: MemberUpdate) {
        *slot = if update.group_id == 0 { None } else { Some(update) };
    }
}

/// Router with every notification the client understands.
pub fn client_router() -> MessageRouter<ClientSession> {
    let mut router = MessageRouter::new();

    router.register_notification(Opcode::TIME_OF_DAY, |session: &mut ClientSession, _, update: TimeOfDayUpdate| {
        if !session.apply_time_of_day(&update) {
            debug!("Ignoring stale time of day update");
        }
    });
    router.register_notification(Opcode::MAP_INFO, |session: &mut ClientSession, _, snapshot: MapInfoSnapshot| {
        session.apply_map_info(&snapshot);
    });
    router.register_notification(Opcode::SERVER_INFO, |session: &mut ClientSession, _, info: ServerInfo| {
        session.server_info = Some(info);
    });
    router.register_notification(Opcode::CHAT, |session: &mut ClientSession, _, message: ChatMessage| {
        session.push_chat(message);
    });
    router.register_notification(
        Opcode::ENTITY_STATE,
        |session: &mut ClientSession, _, snapshot: EntityStateSnapshot| {
            session.apply_entity_state(snapshot);
        },
    );
    router.register_notification(Opcode::PARTY_MEMBERS, |session: &mut ClientSession, _, update: MemberUpdate| {
        ClientSession::set_group(&mut session.party, update);
    });
    router.register_notification(Opcode::GUILD_MEMBERS, |session: &mut ClientSession, _, update: MemberUpdate| {
        ClientSession::set_group(&mut session.guild, update);
    });
    router.register_notification(
        Opcode::SPAWN_PROGRESS,
        |session: &mut ClientSession, _, progress: SpawnProgressUpdate| {
            debug!("Server spawning {}: {:.2}", progress.scene_name, progress.fraction);
            session.spawn_progress = Some(progress);
        },
    );

    router
}
