//! # Shared Session Library
//!
//! Protocol types and session building blocks used by both the authoritative
//! server and its clients.
//!
//! ## Module Organization
//!
//! ### Protocol (`protocol`, `messages`)
//! Datagram packets, routed envelopes, opcodes, result codes and the typed
//! payloads carried by the enter-game, client-ready and safe-disconnect
//! handshakes and by the world-state broadcasts.
//!
//! ### Delivery (`channel`, `correlation`, `router`)
//! - Reliable-ordered channel with cumulative acks and resends over UDP
//! - Correlation table pairing every request with exactly one outcome
//! - Generic message router dispatching into an explicit session context
//!
//! ### World synchronisation (`readiness`, `physics_sync`, `map_info`, `time_of_day`)
//! - Latching readiness gate that decides when world objects may spawn
//! - Rate-limited manual physics-transform synchronisation
//! - Map-info replication guarded by the concrete type name
//! - Cyclical time-of-day clock with last-write-wins application

pub mod channel;
pub mod correlation;
pub mod map_info;
pub mod messages;
pub mod physics_sync;
pub mod protocol;
pub mod readiness;
pub mod router;
pub mod time_of_day;

pub use protocol::{ConnectionId, DeliveryClass, Envelope, MessageKind, Opcode, Packet, ResultCode};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds, used to stamp broadcasts.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
