//! Request and notification handlers registered on the server router.

use crate::session::ServerSession;
use log::{info, warn};
use shared::messages::{
    ChatChannel, ChatMessage, ClientReadyRequest, ClientReadyResponse, EnterGameRequest,
    EnterGameResponse, SafeDisconnectRequest, SafeDisconnectResponse,
};
use shared::router::MessageRouter;
use shared::{ConnectionId, Opcode, ResultCode};
use std::time::Instant;

pub fn register_handlers(router: &mut MessageRouter<ServerSession>) {
    router.register_request(Opcode::ENTER_GAME, handle_enter_game);
    router.register_request(Opcode::CLIENT_READY, handle_client_ready);
    router.register_request(Opcode::SAFE_DISCONNECT, handle_safe_disconnect);
    router.register_notification(Opcode::CHAT, handle_chat);
}

pub fn server_router() -> MessageRouter<ServerSession> {
    let mut router = MessageRouter::new();
    register_handlers(&mut router);
    router
}

fn handle_enter_game(
    session: &mut ServerSession,
    from: ConnectionId,
    request: EnterGameRequest,
) -> Result<EnterGameResponse, ResultCode> {
    if !session.scene.ready_to_instantiate_players() {
        return Err(ResultCode::ServerNotReady);
    }
    if request.user_id.is_empty() || request.character_id.is_empty() {
        warn!("Enter game from {} without user or character id", from);
        return Err(ResultCode::InvalidCharacter);
    }

    session.supervisor.register_character(from, &request.character_id)?;
    session.supervisor.register_user(from, &request.user_id)?;
    session
        .broadcaster
        .register_online(from, &request.character_id, Instant::now());
    session.plugins.on_enter_game(from, &request.character_id);

    info!(
        "User {} entered the game as {} on {}",
        request.user_id, request.character_id, from
    );
    Ok(session.broadcaster.enter_game_payload())
}

fn handle_client_ready(
    session: &mut ServerSession,
    from: ConnectionId,
    _request: ClientReadyRequest,
) -> Result<ClientReadyResponse, ResultCode> {
    session.supervisor.mark_client_ready(from)?;
    session.plugins.on_client_ready(from);
    session.refresh_membership(Instant::now());
    Ok(ClientReadyResponse)
}

fn handle_safe_disconnect(
    session: &mut ServerSession,
    from: ConnectionId,
    _request: SafeDisconnectRequest,
) -> Result<SafeDisconnectResponse, ResultCode> {
    let closed = session.supervisor.close_storages(from);
    let connection = session
        .supervisor
        .get_mut(from)
        .ok_or(ResultCode::InternalError)?;
    connection.safe_disconnecting = true;

    info!("{} is leaving safely, closed storages: {:?}", from, closed);
    Ok(SafeDisconnectResponse)
}

fn handle_chat(session: &mut ServerSession, from: ConnectionId, mut message: ChatMessage) {
    let sender = match session.supervisor.get(from) {
        Some(sender) => sender,
        None => return,
    };
    let character_id = match &sender.character_id {
        Some(character_id) => character_id.clone(),
        None => {
            warn!("Chat from {} before entering the game", from);
            return;
        }
    };
    if message.channel == ChatChannel::System {
        warn!("Client {} tried to send a system message", from);
        return;
    }

    message.sender_id = character_id.clone();
    message.sender_name = character_id;
    message.guild_id = sender.guild_id.unwrap_or(0);
    message.guild_name = sender.guild_name.clone();
    message.sent_by_server = false;

    let outgoing = session.broadcaster.chat(&message, Some(from), &session.supervisor);
    for message in outgoing {
        session.push(message);
    }
}
