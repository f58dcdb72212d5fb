//! # Session Server Library
//!
//! This library provides the authoritative server side of a networked game
//! session. It admits and tracks connections, decides when the world may be
//! populated, spawns the scene's static entities, runs the enter-game and
//! safe-disconnect handshakes and keeps in-game clients supplied with world
//! state.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! Handles the complete lifecycle of client connections including:
//! - Admission control (temporarily closed server, capacity)
//! - Character registration through the enter-game handshake
//! - Client readiness and the safe-disconnect handshake
//! - A disconnect cascade that runs exactly once per connection
//!
//! ### World Readiness and Spawning
//! A latching readiness gate holds spawning back until every registered
//! criterion agrees. Once open, static entities are spawned in stages
//! (portals, NPCs, spawn areas, observer) one entity at a time, and players
//! may only enter after the last stage finished.
//!
//! ### State Broadcasting
//! Server info, map info and time of day are handed to every client entering
//! the game. Time of day is re-broadcast periodically, party and guild
//! rosters are pushed whenever they change, and chat is routed by channel.
//!
//! ## Architecture Design
//!
//! ### Single Update Loop
//! All session state is owned by one `tokio::select!` loop. Network receive
//! and send run as separate tasks that talk to the loop over channels, so
//! handlers never need locks.
//!
//! ### Explicit Session Context
//! Handlers are plain functions registered on a `MessageRouter` and receive
//! the `ServerSession` as an argument instead of reaching for globals.
//!
//! ### UDP-Based Communication
//! Requests, responses and most notifications travel over a per-connection
//! reliable-ordered channel; time-of-day and entity-state updates are sent
//! unreliably since only the newest value matters.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! Admission, per-connection state records, timeouts and the disconnect
//! cascade.
//!
//! ### Scene Modules (`scene`, `spawn`, `world`)
//! - Readiness gate ownership and the one-way players-ready flag
//! - Staged, cooperative entity spawning with progress reporting
//! - The live object table, spatial index and transform synchronisation
//!
//! ### Session Modules (`session`, `handlers`, `world_state`, `plugin`)
//! - The dispatch context holding all mutable server state
//! - Enter-game, client-ready, safe-disconnect and chat handlers
//! - World-state broadcasting and party/guild roster tracking
//! - Lifecycle hooks for subsystems composed at startup
//!
//! ### Network Module (`network`)
//! Manages all UDP communication and drives the update loop.
//!
//! ### Configuration (`config`)
//! Server options and JSON map definitions.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod network;
pub mod plugin;
pub mod scene;
pub mod session;
pub mod spawn;
pub mod world;
pub mod world_state;

pub use config::{MapDefinition, ServerConfig};
pub use network::Server;
pub use plugin::{PluginSet, SessionPlugin};
pub use session::ServerSession;
