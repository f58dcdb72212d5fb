//! Staged, cooperative spawning of a scene's static entities.
//!
//! Portals spawn first, then NPCs, then spawn areas perform their initial
//! spawn, and finally (headless only) the server observer. The orchestrator
//! never spawns more than one entity per [`EntitySpawnOrchestrator::step`],
//! so the owning loop can interleave network work between entities.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use shared::messages::SpawnProgressUpdate;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub position: [f32; 3],
    /// Euler angles in degrees
    #[serde(default)]
    pub rotation: [f32; 3],
}

impl Transform {
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: [x, y, z],
            rotation: [0.0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalData {
    pub destination_map: String,
    pub destination_position: [f32; 3],
    #[serde(default)]
    pub keep_rotation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcData {
    pub npc_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub dialog_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpawnAreaCategory {
    Monster,
    Harvestable,
    ItemDrop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnAreaData {
    pub area_id: String,
    pub category: SpawnAreaCategory,
    /// Entities spawned by the initial spawn
    pub amount: u32,
    pub radius: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpawnKind {
    Portal(PortalData),
    Npc(NpcData),
    SpawnArea(SpawnAreaData),
}

impl SpawnKind {
    pub fn stage(&self) -> SpawnStage {
        match self {
            SpawnKind::Portal(_) => SpawnStage::Portals,
            SpawnKind::Npc(_) => SpawnStage::Npcs,
            SpawnKind::SpawnArea(_) => SpawnStage::SpawnAreas,
        }
    }
}

/// One static entity placed in a map: what it is, which prefab represents
/// it and where it stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpawnDescriptor {
    pub asset: String,
    #[serde(default)]
    pub transform: Transform,
    #[serde(flatten)]
    pub kind: SpawnKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpawnStage {
    Portals,
    Npcs,
    SpawnAreas,
    Observer,
    Done,
}

impl SpawnStage {
    fn next(self) -> SpawnStage {
        match self {
            SpawnStage::Portals => SpawnStage::Npcs,
            SpawnStage::Npcs => SpawnStage::SpawnAreas,
            SpawnStage::SpawnAreas => SpawnStage::Observer,
            SpawnStage::Observer | SpawnStage::Done => SpawnStage::Done,
        }
    }

    /// Progress reported when the stage completes.
    fn completed_fraction(self) -> Option<f32> {
        match self {
            SpawnStage::Portals => Some(0.25),
            SpawnStage::Npcs => Some(0.5),
            SpawnStage::SpawnAreas => Some(1.0),
            SpawnStage::Observer | SpawnStage::Done => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefabHandle(pub u32);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SpawnError {
    #[error("asset {0} could not be resolved")]
    MissingAsset(String),
    #[error("spawn area {area_id} failed its initial spawn: {reason}")]
    AreaFailed { area_id: String, reason: String },
    #[error("observer could not be spawned: {0}")]
    Observer(String),
}

/// World side of spawning. Implemented by the scene world; tests use a
/// recording fake.
pub trait SpawnBackend {
    fn resolve_asset(&self, asset: &str) -> Option<PrefabHandle>;

    fn instantiate(&mut self, prefab: PrefabHandle, transform: &Transform) -> ObjectId;

    /// Copies the descriptor's typed fields onto the live object.
    fn apply_fields(&mut self, object: ObjectId, kind: &SpawnKind);

    /// Registers the object for replication to clients.
    fn network_spawn(&mut self, object: ObjectId);

    /// Returns how many entities the area spawned.
    fn spawn_area_initial(
        &mut self,
        area: &SpawnAreaData,
        asset: &str,
        transform: &Transform,
    ) -> Result<usize, SpawnError>;

    fn spawn_observer(&mut self) -> Result<ObjectId, SpawnError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnReport {
    pub portals: usize,
    pub npcs: usize,
    pub areas: usize,
    pub area_entities: usize,
    pub failed: usize,
    pub observer: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpawnStep {
    /// Nothing is being spawned.
    Idle,
    /// One descriptor was handled. `object` is `None` when it failed and
    /// for spawn areas, which own the entities they spawn.
    Spawned {
        stage: SpawnStage,
        object: Option<ObjectId>,
    },
    StageComplete(SpawnProgressUpdate),
    Finished(SpawnReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running(SpawnStage),
    Finished,
}

pub struct EntitySpawnOrchestrator {
    scene_name: String,
    is_remote_scene: bool,
    headless: bool,
    queue: VecDeque<EntitySpawnDescriptor>,
    state: RunState,
    report: SpawnReport,
    last_fraction: f32,
}

impl EntitySpawnOrchestrator {
    pub fn new(scene_name: impl Into<String>, is_remote_scene: bool, headless: bool) -> Self {
        Self {
            scene_name: scene_name.into(),
            is_remote_scene,
            headless,
            queue: VecDeque::new(),
            state: RunState::Idle,
            report: SpawnReport::default(),
            last_fraction: 0.0,
        }
    }

    /// Queues the scene's descriptors in stage order and starts the run.
    /// Order inside a stage is preserved. Ignored while a run is in flight.
    pub fn start(&mut self, descriptors: &[EntitySpawnDescriptor]) -> bool {
        if self.is_running() {
            warn!("Spawn of {} already running", self.scene_name);
            return false;
        }

        let mut ordered = descriptors.to_vec();
        ordered.sort_by_key(|descriptor| descriptor.kind.stage());

        self.queue = ordered.into();
        self.report = SpawnReport::default();
        self.last_fraction = 0.0;
        self.state = RunState::Running(SpawnStage::Portals);
        info!(
            "Spawning {} entities for scene {}",
            self.queue.len(),
            self.scene_name
        );
        true
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running(_))
    }

    pub fn is_finished(&self) -> bool {
        self.state == RunState::Finished
    }

    pub fn report(&self) -> &SpawnReport {
        &self.report
    }

    /// Performs the next unit of work: one entity, one stage transition or
    /// the final report.
    pub fn step<B: SpawnBackend>(&mut self, backend: &mut B) -> SpawnStep {
        let stage = match self.state {
            RunState::Running(stage) => stage,
            RunState::Idle | RunState::Finished => return SpawnStep::Idle,
        };

        match stage {
            SpawnStage::Portals | SpawnStage::Npcs | SpawnStage::SpawnAreas => {
                let in_stage = self
                    .queue
                    .front()
                    .map_or(false, |descriptor| descriptor.kind.stage() == stage);

                match self.queue.pop_front() {
                    Some(descriptor) if in_stage => {
                        let object = self.spawn_one(&descriptor, backend);
                        SpawnStep::Spawned { stage, object }
                    }
                    other => {
                        if let Some(descriptor) = other {
                            self.queue.push_front(descriptor);
                        }
                        self.state = RunState::Running(stage.next());
                        SpawnStep::StageComplete(self.progress(stage))
                    }
                }
            }
            SpawnStage::Observer => {
                self.state = RunState::Running(SpawnStage::Done);
                if !self.headless {
                    return self.step(backend);
                }

                match backend.spawn_observer() {
                    Ok(object) => {
                        self.report.observer = Some(object);
                        SpawnStep::Spawned {
                            stage,
                            object: Some(object),
                        }
                    }
                    Err(e) => {
                        warn!("{}", e);
                        self.report.failed += 1;
                        SpawnStep::Spawned { stage, object: None }
                    }
                }
            }
            SpawnStage::Done => {
                self.state = RunState::Finished;
                info!(
                    "Scene {} spawned: {} portals, {} npcs, {} areas ({} entities), {} failed",
                    self.scene_name,
                    self.report.portals,
                    self.report.npcs,
                    self.report.areas,
                    self.report.area_entities,
                    self.report.failed
                );
                SpawnStep::Finished(self.report.clone())
            }
        }
    }

    /// Drives the run to completion without yielding. Used where no other
    /// work needs to interleave.
    pub fn run_to_completion<B: SpawnBackend>(&mut self, backend: &mut B) -> Vec<SpawnStep> {
        let mut steps = Vec::new();
        loop {
            match self.step(backend) {
                SpawnStep::Idle => break,
                finished @ SpawnStep::Finished(_) => {
                    steps.push(finished);
                    break;
                }
                other => steps.push(other),
            }
        }
        steps
    }

    fn spawn_one<B: SpawnBackend>(
        &mut self,
        descriptor: &EntitySpawnDescriptor,
        backend: &mut B,
    ) -> Option<ObjectId> {
        if let SpawnKind::SpawnArea(area) = &descriptor.kind {
            return match backend.spawn_area_initial(area, &descriptor.asset, &descriptor.transform) {
                Ok(count) => {
                    debug!("Spawn area {} spawned {} entities", area.area_id, count);
                    self.report.areas += 1;
                    self.report.area_entities += count;
                    None
                }
                Err(e) => {
                    warn!("{}", e);
                    self.report.failed += 1;
                    None
                }
            };
        }

        let prefab = match backend.resolve_asset(&descriptor.asset) {
            Some(prefab) => prefab,
            None => {
                warn!("{}", SpawnError::MissingAsset(descriptor.asset.clone()));
                self.report.failed += 1;
                return None;
            }
        };

        let object = backend.instantiate(prefab, &descriptor.transform);
        backend.apply_fields(object, &descriptor.kind);
        backend.network_spawn(object);

        match descriptor.kind {
            SpawnKind::Portal(_) => self.report.portals += 1,
            SpawnKind::Npc(_) => self.report.npcs += 1,
            SpawnKind::SpawnArea(_) => {}
        }
        Some(object)
    }

    fn progress(&mut self, stage: SpawnStage) -> SpawnProgressUpdate {
        if let Some(fraction) = stage.completed_fraction() {
            self.last_fraction = self.last_fraction.max(fraction);
        }
        SpawnProgressUpdate {
            scene_name: self.scene_name.clone(),
            is_server_side: true,
            is_remote_scene: self.is_remote_scene,
            fraction: self.last_fraction,
        }
    }
}
