//! Per-scene readiness and spawn lifecycle.

use crate::spawn::{EntitySpawnDescriptor, EntitySpawnOrchestrator, SpawnBackend, SpawnStep};
use log::info;
use shared::readiness::{ReadinessGate, ReadinessScope};
use std::time::{Duration, Instant};

pub struct SceneState {
    name: String,
    is_remote: bool,
    headless: bool,
    descriptors: Vec<EntitySpawnDescriptor>,
    gate: ReadinessGate,
    orchestrator: EntitySpawnOrchestrator,
    spawn_started: bool,
    ready_to_instantiate_players: bool,
}

impl SceneState {
    pub fn new(
        name: impl Into<String>,
        descriptors: Vec<EntitySpawnDescriptor>,
        headless: bool,
        minimum_delay: Duration,
        open_timeout: Option<Duration>,
        now: Instant,
    ) -> Self {
        let name = name.into();
        let mut gate = ReadinessGate::with_minimum_delay(ReadinessScope::ServerObjects, now, minimum_delay);
        gate.set_open_timeout(open_timeout);

        Self {
            orchestrator: EntitySpawnOrchestrator::new(name.clone(), false, headless),
            name,
            is_remote: false,
            headless,
            descriptors,
            gate,
            spawn_started: false,
            ready_to_instantiate_players: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subsystems register their own criteria here before the gate opens.
    pub fn gate_mut(&mut self) -> &mut ReadinessGate {
        &mut self.gate
    }

    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    /// Polls the gate and starts spawning the first time it reports open.
    /// Returns true when this call started the spawn run.
    pub fn poll_readiness(&mut self, now: Instant) -> bool {
        if !self.gate.poll(now) || self.spawn_started {
            return false;
        }
        self.spawn_started = true;
        self.orchestrator.start(&self.descriptors)
    }

    pub fn is_server_ready_to_instantiate_objects(&self) -> bool {
        self.gate.is_open()
    }

    pub fn readiness_timed_out(&self) -> bool {
        self.gate.timed_out()
    }

    pub fn is_spawning(&self) -> bool {
        self.orchestrator.is_running()
    }

    /// Players may only enter once every static entity is in place.
    pub fn ready_to_instantiate_players(&self) -> bool {
        self.ready_to_instantiate_players
    }

    pub fn step_spawn<B: SpawnBackend>(&mut self, backend: &mut B) -> SpawnStep {
        let step = self.orchestrator.step(backend);
        if let SpawnStep::Finished(_) = step {
            self.ready_to_instantiate_players = true;
        }
        step
    }

    /// Switches to another scene. Everything scene-scoped starts over: the
    /// gate closes and drops its criteria, and players must wait for the new
    /// spawn run.
    pub fn change_scene(
        &mut self,
        name: impl Into<String>,
        descriptors: Vec<EntitySpawnDescriptor>,
        is_remote: bool,
        now: Instant,
    ) {
        self.name = name.into();
        self.is_remote = is_remote;
        self.descriptors = descriptors;
        self.gate.reset(now);
        self.orchestrator = EntitySpawnOrchestrator::new(self.name.clone(), is_remote, self.headless);
        self.spawn_started = false;
        self.ready_to_instantiate_players = false;
        info!("Scene changed to {}", self.name);
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }
}
