//! # Session Client Library
//!
//! This library provides the client side of a networked game session. It
//! connects to the authoritative server, walks the enter-game handshake,
//! waits for its own readiness gate and keeps a local view of the world state
//! the server pushes while the player is in game.
//!
//! ## Session Flow
//!
//! A client moves through a fixed sequence of phases:
//!
//! 1. **Connecting**: `Connect` is repeated once per second until the server
//!    answers with a connection id or a kick.
//! 2. **Entering game**: an enter-game request carries the user and character
//!    ids. A "server not ready" answer is retried on a short cadence; any
//!    other failure ends the session with that result code.
//! 3. **Awaiting readiness**: a client-objects readiness gate holds until the
//!    minimum delay passed and a valid map info arrived.
//! 4. **In game**: the client-ready request is acknowledged and world state
//!    notifications keep flowing.
//! 5. **Disconnecting**: a safe-disconnect request lets the server close
//!    storages first. The connection is dropped when the server answers or
//!    the timeout elapses, whichever comes first.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The local world view and the router for server notifications:
//! - Server info, map info and time of day
//! - Bounded chat log
//! - Latest entity snapshots, party and guild rosters, spawn progress
//!
//! ### Network Module (`network`)
//! Manages all client-server communication:
//! - UDP socket management and the connection handshake
//! - Reliable-ordered delivery and request correlation
//! - Heartbeats and detection of a silent server
//!
//! ### Configuration (`config`)
//! Identity, timeouts and the optional scripted behaviour of the headless
//! client.

pub mod config;
pub mod network;
pub mod session;

pub use config::ClientConfig;
pub use network::{Client, ClientOutcome, ClientPhase};
pub use session::ClientSession;
