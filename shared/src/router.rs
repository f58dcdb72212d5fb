//! Typed registration and dispatch of notifications and request/response
//! exchanges.
//!
//! The router holds no gameplay state. Handlers receive the session value
//! `C` explicitly, so a process may host as many isolated routers and sessions
//! as it likes (tests do exactly that).

use crate::protocol::{ConnectionId, Envelope, MessageKind, Opcode, ResultCode};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no handler registered for {0}")]
    UnknownOpcode(Opcode),
    #[error("failed to decode payload of {opcode}: {source}")]
    Decode {
        opcode: Opcode,
        #[source]
        source: bincode::Error,
    },
    #[error("failed to encode payload of {opcode}: {source}")]
    Encode {
        opcode: Opcode,
        #[source]
        source: bincode::Error,
    },
    #[error("{0} carries a response; responses are matched against pending requests")]
    UnexpectedResponse(Opcode),
}

type NotificationHandler<C> =
    Box<dyn Fn(&mut C, ConnectionId, &[u8]) -> Result<(), bincode::Error> + Send + Sync>;
type RequestHandler<C> = Box<dyn Fn(&mut C, ConnectionId, &[u8]) -> (ResultCode, Vec<u8>) + Send + Sync>;

pub struct MessageRouter<C> {
    notifications: HashMap<Opcode, NotificationHandler<C>>,
    requests: HashMap<Opcode, RequestHandler<C>>,
}

impl<C> Default for MessageRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MessageRouter<C> {
    pub fn new() -> Self {
        Self {
            notifications: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    /// Registers a fire-and-forget handler. Re-registering an opcode replaces
    /// the previous handler.
    pub fn register_notification<T, F>(&mut self, opcode: Opcode, handler: F)
    where
        T: DeserializeOwned,
        F: Fn(&mut C, ConnectionId, T) + Send + Sync + 'static,
    {
        let boxed: NotificationHandler<C> = Box::new(move |ctx, from, payload| {
            let message = bincode::deserialize::<T>(payload)?;
            handler(ctx, from, message);
            Ok(())
        });

        if self.notifications.insert(opcode, boxed).is_some() {
            warn!("Notification handler for {} replaced", opcode);
        }
    }

    /// Registers a request handler. `Ok` answers with result `None` and the
    /// encoded response; `Err(code)` answers with `code` and an empty payload.
    pub fn register_request<Req, Resp, F>(&mut self, opcode: Opcode, handler: F)
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(&mut C, ConnectionId, Req) -> Result<Resp, ResultCode> + Send + Sync + 'static,
    {
        let boxed: RequestHandler<C> = Box::new(move |ctx, from, payload| {
            let request = match bincode::deserialize::<Req>(payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Malformed {} request from {}: {}", opcode, from, e);
                    return (ResultCode::MalformedMessage, Vec::new());
                }
            };

            match handler(ctx, from, request) {
                Ok(response) => match bincode::serialize(&response) {
                    Ok(payload) => (ResultCode::None, payload),
                    Err(e) => {
                        warn!("Failed to encode {} response for {}: {}", opcode, from, e);
                        (ResultCode::InternalError, Vec::new())
                    }
                },
                Err(code) => (code, Vec::new()),
            }
        });

        if self.requests.insert(opcode, boxed).is_some() {
            warn!("Request handler for {} replaced", opcode);
        }
    }

    pub fn handles(&self, opcode: Opcode) -> bool {
        self.notifications.contains_key(&opcode) || self.requests.contains_key(&opcode)
    }

    /// Dispatches one inbound envelope.
    ///
    /// A request always produces exactly one response envelope, even when its
    /// opcode is unknown or its payload is malformed, so the remote caller is
    /// never left waiting.
    pub fn dispatch(
        &self,
        ctx: &mut C,
        from: ConnectionId,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, RouterError> {
        let opcode = envelope.opcode;

        match envelope.kind {
            MessageKind::Notification => {
                let handler = self
                    .notifications
                    .get(&opcode)
                    .ok_or(RouterError::UnknownOpcode(opcode))?;
                handler(ctx, from, &envelope.payload)
                    .map_err(|source| RouterError::Decode { opcode, source })?;
                Ok(None)
            }
            MessageKind::Request { correlation_id } => {
                let (result, payload) = match self.requests.get(&opcode) {
                    Some(handler) => handler(ctx, from, &envelope.payload),
                    None => {
                        warn!("No request handler for {} from {}", opcode, from);
                        (ResultCode::InternalError, Vec::new())
                    }
                };

                Ok(Some(Envelope {
                    opcode,
                    kind: MessageKind::Response {
                        correlation_id,
                        result,
                    },
                    payload,
                }))
            }
            MessageKind::Response { .. } => Err(RouterError::UnexpectedResponse(opcode)),
        }
    }
}

pub fn notification<T: Serialize>(opcode: Opcode, message: &T) -> Result<Envelope, RouterError> {
    let payload =
        bincode::serialize(message).map_err(|source| RouterError::Encode { opcode, source })?;
    Ok(Envelope {
        opcode,
        kind: MessageKind::Notification,
        payload,
    })
}

pub fn request<T: Serialize>(
    opcode: Opcode,
    correlation_id: u32,
    message: &T,
) -> Result<Envelope, RouterError> {
    let payload =
        bincode::serialize(message).map_err(|source| RouterError::Encode { opcode, source })?;
    Ok(Envelope {
        opcode,
        kind: MessageKind::Request { correlation_id },
        payload,
    })
}

/// Decodes the payload of any envelope as `T`.
pub fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, RouterError> {
    bincode::deserialize(&envelope.payload).map_err(|source| RouterError::Decode {
        opcode: envelope.opcode,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChatMessage, EnterGameRequest, SafeDisconnectResponse};

    #[derive(Default)]
    struct Recorder {
        chats: Vec<(ConnectionId, String)>,
        entered: Vec<String>,
    }

    fn test_router() -> MessageRouter<Recorder> {
        let mut router = MessageRouter::new();
        router.register_notification(Opcode::CHAT, |ctx: &mut Recorder, from, msg: ChatMessage| {
            ctx.chats.push((from, msg.text));
        });
        router.register_request(
            Opcode::ENTER_GAME,
            |ctx: &mut Recorder, _from, req: EnterGameRequest| {
                if req.character_id.is_empty() {
                    return Err(ResultCode::InvalidCharacter);
                }
                ctx.entered.push(req.character_id);
                Ok(SafeDisconnectResponse)
            },
        );
        router
    }

    #[test]
    fn test_notification_dispatch() {
        let router = test_router();
        let mut ctx = Recorder::default();
        let envelope = notification(Opcode::CHAT, &ChatMessage::system("hello")).unwrap();

        let response = router.dispatch(&mut ctx, ConnectionId(3), &envelope).unwrap();

        assert!(response.is_none());
        assert_eq!(ctx.chats, vec![(ConnectionId(3), "hello".to_string())]);
    }

    #[test]
    fn test_request_success_carries_correlation_id() {
        let router = test_router();
        let mut ctx = Recorder::default();
        let req = EnterGameRequest {
            user_id: "u1".into(),
            character_id: "c1".into(),
        };
        let envelope = request(Opcode::ENTER_GAME, 77, &req).unwrap();

        let response = router
            .dispatch(&mut ctx, ConnectionId(1), &envelope)
            .unwrap()
            .unwrap();

        assert_eq!(
            response.kind,
            MessageKind::Response {
                correlation_id: 77,
                result: ResultCode::None
            }
        );
        assert_eq!(ctx.entered, vec!["c1".to_string()]);
    }

    #[test]
    fn test_request_rejection_has_empty_payload() {
        let router = test_router();
        let mut ctx = Recorder::default();
        let req = EnterGameRequest {
            user_id: "u1".into(),
            character_id: String::new(),
        };
        let envelope = request(Opcode::ENTER_GAME, 5, &req).unwrap();

        let response = router
            .dispatch(&mut ctx, ConnectionId(1), &envelope)
            .unwrap()
            .unwrap();

        assert_eq!(
            response.kind,
            MessageKind::Response {
                correlation_id: 5,
                result: ResultCode::InvalidCharacter
            }
        );
        assert!(response.payload.is_empty());
    }

    #[test]
    fn test_malformed_request_still_gets_one_response() {
        let router = test_router();
        let mut ctx = Recorder::default();
        let envelope = Envelope {
            opcode: Opcode::ENTER_GAME,
            kind: MessageKind::Request { correlation_id: 9 },
            payload: vec![0xFF],
        };

        let response = router
            .dispatch(&mut ctx, ConnectionId(1), &envelope)
            .unwrap()
            .unwrap();

        assert_eq!(response.correlation_id(), Some(9));
        assert!(matches!(
            response.kind,
            MessageKind::Response {
                result: ResultCode::MalformedMessage,
                ..
            }
        ));
        assert!(ctx.entered.is_empty());
    }

    #[test]
    fn test_unknown_request_opcode_is_answered() {
        let router = test_router();
        let mut ctx = Recorder::default();
        let envelope = Envelope {
            opcode: Opcode(999),
            kind: MessageKind::Request { correlation_id: 1 },
            payload: Vec::new(),
        };

        let response = router
            .dispatch(&mut ctx, ConnectionId(1), &envelope)
            .unwrap()
            .unwrap();
        assert_eq!(response.correlation_id(), Some(1));
    }

    #[test]
    fn test_unknown_notification_is_an_error() {
        let router = test_router();
        let mut ctx = Recorder::default();
        let envelope = Envelope {
            opcode: Opcode(999),
            kind: MessageKind::Notification,
            payload: Vec::new(),
        };

        assert!(matches!(
            router.dispatch(&mut ctx, ConnectionId(1), &envelope),
            Err(RouterError::UnknownOpcode(Opcode(999)))
        ));
    }

    #[test]
    fn test_responses_are_not_dispatched() {
        let router = test_router();
        let mut ctx = Recorder::default();
        let envelope = Envelope {
            opcode: Opcode::ENTER_GAME,
            kind: MessageKind::Response {
                correlation_id: 1,
                result: ResultCode::None,
            },
            payload: Vec::new(),
        };

        assert!(matches!(
            router.dispatch(&mut ctx, ConnectionId(1), &envelope),
            Err(RouterError::UnexpectedResponse(_))
        ));
    }
}
