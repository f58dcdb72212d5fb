//! Lifecycle hooks for subsystems that live alongside the session.
//!
//! Plugins are composed once when the server is built. Every hook has a
//! no-op default, so a plugin only implements what it cares about.

use crate::connection::DisconnectReason;
use log::info;
use shared::messages::SpawnProgressUpdate;
use shared::readiness::ReadinessGate;
use shared::ConnectionId;

pub trait SessionPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per scene activation, before the gate is first polled.
    fn register_criteria(&mut self, _gate: &mut ReadinessGate) {}

    fn on_peer_connected(&mut self, _id: ConnectionId) {}

    fn on_peer_disconnected(
        &mut self,
        _id: ConnectionId,
        _reason: DisconnectReason,
        _socket_error: Option<&str>,
    ) {
    }

    fn on_character_unregistered(&mut self, _id: ConnectionId, _character_id: &str) {}

    fn on_enter_game(&mut self, _id: ConnectionId, _character_id: &str) {}

    fn on_client_ready(&mut self, _id: ConnectionId) {}

    fn on_spawn_progress(&mut self, _progress: &SpawnProgressUpdate) {}

    fn on_players_ready(&mut self, _scene_name: &str) {}
}

/// Fans every hook out to the registered plugins in registration order.
#[derive(Default)]
pub struct PluginSet {
    plugins: Vec<Box<dyn SessionPlugin>>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, plugin: impl SessionPlugin + 'static) -> Self {
        self.push(plugin);
        self
    }

    pub fn push(&mut self, plugin: impl SessionPlugin + 'static) {
        info!("Session plugin registered: {}", plugin.name());
        self.plugins.push(Box::new(plugin));
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn register_criteria(&mut self, gate: &mut ReadinessGate) {
        for plugin in self.plugins.iter_mut() {
            plugin.register_criteria(gate);
        }
    }

    pub fn on_peer_connected(&mut self, id: ConnectionId) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_peer_connected(id);
        }
    }

    pub fn on_peer_disconnected(
        &mut self,
        id: ConnectionId,
        reason: DisconnectReason,
        socket_error: Option<&str>,
    ) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_peer_disconnected(id, reason, socket_error);
        }
    }

    pub fn on_character_unregistered(&mut self, id: ConnectionId, character_id: &str) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_character_unregistered(id, character_id);
        }
    }

    pub fn on_enter_game(&mut self, id: ConnectionId, character_id: &str) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_enter_game(id, character_id);
        }
    }

    pub fn on_client_ready(&mut self, id: ConnectionId) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_client_ready(id);
        }
    }

    pub fn on_spawn_progress(&mut self, progress: &SpawnProgressUpdate) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_spawn_progress(progress);
        }
    }

    pub fn on_players_ready(&mut self, scene_name: &str) {
        for plugin in self.plugins.iter_mut() {
            plugin.on_players_ready(scene_name);
        }
    }
}

/// Stock plugin that writes the session lifecycle to the log.
pub struct LifecycleLog;

impl SessionPlugin for LifecycleLog {
    fn name(&self) -> &str {
        "lifecycle_log"
    }

    fn on_enter_game(&mut self, id: ConnectionId, character_id: &str) {
        info!("Character {} entered the game on {}", character_id, id);
    }

    fn on_character_unregistered(&mut self, id: ConnectionId, character_id: &str) {
        info!("Character {} left the game ({})", character_id, id);
    }

    fn on_spawn_progress(&mut self, progress: &SpawnProgressUpdate) {
        info!(
            "Spawning {}: {:.0}%",
            progress.scene_name,
            progress.fraction * 100.0
        );
    }

    fn on_players_ready(&mut self, scene_name: &str) {
        info!("Scene {} is accepting players", scene_name);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use shared::readiness::ReadinessScope;

    /// Appends every hook it receives to a shared log.
    pub(crate) struct Recorder {
        pub label: &'static str,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        pub(crate) fn new(label: &'static str) -> (Self, Arc<Mutex<Vec<String>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    label,
                    log: Arc::clone(&log),
                },
                log,
            )
        }

        fn record(&self, event: String) {
            self.log.lock().unwrap().push(format!("{}:{}", self.label, event));
        }
    }

    impl SessionPlugin for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn on_peer_connected(&mut self, id: ConnectionId) {
            self.record(format!("connected {}", id));
        }

        fn on_peer_disconnected(
            &mut self,
            id: ConnectionId,
            reason: DisconnectReason,
            _socket_error: Option<&str>,
        ) {
            self.record(format!("disconnected {} {}", id, reason));
        }

        fn on_character_unregistered(&mut self, _id: ConnectionId, character_id: &str) {
            self.record(format!("unregistered {}", character_id));
        }

        fn on_enter_game(&mut self, _id: ConnectionId, character_id: &str) {
            self.record(format!("entered {}", character_id));
        }

        fn on_client_ready(&mut self, id: ConnectionId) {
            self.record(format!("ready {}", id));
        }

        fn on_players_ready(&mut self, scene_name: &str) {
            self.record(format!("players_ready {}", scene_name));
        }
    }

    #[test]
    fn test_hooks_fan_out_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Recorder {
            label: "a",
            log: Arc::clone(&log),
        };
        let second = Recorder {
            label: "b",
            log: Arc::clone(&log),
        };
        let mut plugins = PluginSet::new().with(first).with(second);

        plugins.on_peer_connected(ConnectionId(4));
        plugins.on_client_ready(ConnectionId(4));

        assert_eq!(plugins.names(), vec!["a", "b"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:connected #4", "b:connected #4", "a:ready #4", "b:ready #4"]
        );
    }

    struct WarmupPlugin;

    impl SessionPlugin for WarmupPlugin {
        fn name(&self) -> &str {
            "warmup"
        }

        fn register_criteria(&mut self, gate: &mut ReadinessGate) {
            gate.register_criterion("warmup", |elapsed: Duration| elapsed >= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_plugin_criteria_hold_the_gate() {
        let t0 = Instant::now();
        let mut gate = ReadinessGate::new(ReadinessScope::ServerObjects, t0);
        let mut plugins = PluginSet::new().with(WarmupPlugin).with(LifecycleLog);

        plugins.register_criteria(&mut gate);

        assert!(!gate.poll(t0 + Duration::from_secs(2)));
        assert!(gate.poll(t0 + Duration::from_secs(3)));
        assert_eq!(plugins.len(), 2);
    }
}
