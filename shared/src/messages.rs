//! Typed payloads carried inside envelopes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub channel_id: String,
    pub title: String,
    pub description: String,
}

/// Replicated map description. `type_name` names the concrete map-info type
/// so the receiver can refuse payloads meant for a different type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapInfoSnapshot {
    pub map_id: String,
    pub type_name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnterGameRequest {
    pub user_id: String,
    pub character_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterGameResponse {
    pub server_info: ServerInfo,
    pub map_info: MapInfoSnapshot,
    pub time_of_day: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientReadyRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientReadyResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafeDisconnectRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SafeDisconnectResponse;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeOfDayUpdate {
    pub time_of_day: f32,
    pub server_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatChannel {
    System,
    Local,
    Party,
    Guild,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub channel: ChatChannel,
    pub sender_id: String,
    pub sender_name: String,
    pub guild_id: u32,
    pub guild_name: String,
    pub text: String,
    pub sent_by_server: bool,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            channel: ChatChannel::System,
            sender_id: String::new(),
            sender_name: String::new(),
            guild_id: 0,
            guild_name: String::new(),
            text: text.into(),
            sent_by_server: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStateSnapshot {
    pub object_id: u32,
    pub server_time_ms: u64,
    pub delta: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub character_id: String,
    pub online: bool,
}

/// Full roster of one party or guild, sent whenever the recipient's
/// membership or the roster itself changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    /// `0` means the recipient no longer belongs to any group of this kind.
    pub group_id: u32,
    pub members: Vec<MemberEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnProgressUpdate {
    pub scene_name: String,
    pub is_server_side: bool,
    pub is_remote_scene: bool,
    pub fraction: f32,
}
