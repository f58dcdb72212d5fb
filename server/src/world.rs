//! Server-side scene world: the live objects placed by the spawn run plus a
//! coarse spatial index kept in step with them through manual transform
//! synchronisation.

use crate::spawn::{ObjectId, PrefabHandle, SpawnAreaData, SpawnBackend, SpawnError, SpawnKind, Transform};
use log::{debug, warn};
use rand::Rng;
use shared::messages::EntityStateSnapshot;
use shared::physics_sync::{PhysicsDimension, TransformSync};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const OBSERVER_ASSET: &str = "server_observer";

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRole {
    Prefab,
    Portal { destination_map: String },
    Npc { npc_id: String },
    AreaEntity { area_id: String },
    Observer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldObject {
    pub id: ObjectId,
    pub asset: String,
    pub transform: Transform,
    pub role: ObjectRole,
    pub networked: bool,
}

pub struct SceneWorld {
    /// asset name -> prefab
    catalog: HashMap<String, PrefabHandle>,
    prefab_names: Vec<String>,
    objects: BTreeMap<ObjectId, WorldObject>,
    next_object_id: u32,
    pending_network_spawns: Vec<ObjectId>,
    index_3d: Vec<(ObjectId, [f32; 3])>,
    index_2d: Vec<(ObjectId, [f32; 2])>,
    loaded: Arc<AtomicBool>,
}

impl Default for SceneWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneWorld {
    pub fn new() -> Self {
        Self {
            catalog: HashMap::new(),
            prefab_names: Vec::new(),
            objects: BTreeMap::new(),
            next_object_id: 1,
            pending_network_spawns: Vec::new(),
            index_3d: Vec::new(),
            index_2d: Vec::new(),
            loaded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers the prefabs available to this scene and flags the world as
    /// loaded.
    pub fn load_catalog<I, S>(&mut self, assets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for asset in assets {
            let asset = asset.into();
            if self.catalog.contains_key(&asset) {
                continue;
            }
            let handle = PrefabHandle(self.prefab_names.len() as u32);
            self.prefab_names.push(asset.clone());
            self.catalog.insert(asset, handle);
        }
        self.loaded.store(true, Ordering::SeqCst);
        debug!("World catalog holds {} prefabs", self.catalog.len());
    }

    /// Shared flag readable from a readiness criterion.
    pub fn loaded_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.loaded)
    }

    /// Drops every object and prefab ahead of a scene change.
    pub fn clear(&mut self) {
        self.catalog.clear();
        self.prefab_names.clear();
        self.objects.clear();
        self.pending_network_spawns.clear();
        self.index_3d.clear();
        self.index_2d.clear();
        self.loaded.store(false, Ordering::SeqCst);
    }

    pub fn get(&self, id: ObjectId) -> Option<&WorldObject> {
        self.objects.get(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> impl Iterator<Item = &WorldObject> {
        self.objects.values()
    }

    /// Moves an object by hand. The spatial index is stale until the next
    /// transform sync, so callers mark the physics scheduler dirty.
    pub fn set_transform(&mut self, id: ObjectId, transform: Transform) -> bool {
        match self.objects.get_mut(&id) {
            Some(object) => {
                object.transform = transform;
                if object.networked && !self.pending_network_spawns.contains(&id) {
                    self.pending_network_spawns.push(id);
                }
                true
            }
            None => false,
        }
    }

    /// Objects within `radius` of `center` according to the last synced index.
    pub fn query_radius(&self, center: [f32; 3], radius: f32) -> Vec<ObjectId> {
        let radius_sq = radius * radius;
        self.index_3d
            .iter()
            .filter(|(_, position)| {
                let dx = position[0] - center[0];
                let dy = position[1] - center[1];
                let dz = position[2] - center[2];
                dx * dx + dy * dy + dz * dz <= radius_sq
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Same query against the ground-plane (x, z) index.
    pub fn query_radius_2d(&self, center: [f32; 2], radius: f32) -> Vec<ObjectId> {
        let radius_sq = radius * radius;
        self.index_2d
            .iter()
            .filter(|(_, position)| {
                let dx = position[0] - center[0];
                let dy = position[1] - center[1];
                dx * dx + dy * dy <= radius_sq
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshots of objects spawned or moved since the last call, stamped
    /// for replication.
    pub fn take_entity_updates(&mut self, server_time_ms: u64) -> Vec<EntityStateSnapshot> {
        let pending = std::mem::take(&mut self.pending_network_spawns);
        pending
            .into_iter()
            .filter_map(|id| self.objects.get(&id))
            .filter_map(|object| match bincode::serialize(&object.transform) {
                Ok(delta) => Some(EntityStateSnapshot {
                    object_id: object.id.0,
                    server_time_ms,
                    delta,
                }),
                Err(e) => {
                    warn!("Failed to encode state of {}: {}", object.id, e);
                    None
                }
            })
            .collect()
    }

    fn insert(&mut self, asset: String, transform: Transform, role: ObjectRole) -> ObjectId {
        let id = ObjectId(self.next_object_id);
        self.next_object_id += 1;
        self.objects.insert(
            id,
            WorldObject {
                id,
                asset,
                transform,
                role,
                networked: false,
            },
        );
        id
    }
}

impl SpawnBackend for SceneWorld {
    fn resolve_asset(&self, asset: &str) -> Option<PrefabHandle> {
        self.catalog.get(asset).copied()
    }

    fn instantiate(&mut self, prefab: PrefabHandle, transform: &Transform) -> ObjectId {
        let asset = self
            .prefab_names
            .get(prefab.0 as usize)
            .cloned()
            .unwrap_or_default();
        self.insert(asset, *transform, ObjectRole::Prefab)
    }

    fn apply_fields(&mut self, object: ObjectId, kind: &SpawnKind) {
        if let Some(object) = self.objects.get_mut(&object) {
            object.role = match kind {
                SpawnKind::Portal(portal) => ObjectRole::Portal {
                    destination_map: portal.destination_map.clone(),
                },
                SpawnKind::Npc(npc) => ObjectRole::Npc {
                    npc_id: npc.npc_id.clone(),
                },
                SpawnKind::SpawnArea(area) => ObjectRole::AreaEntity {
                    area_id: area.area_id.clone(),
                },
            };
        }
    }

    fn network_spawn(&mut self, object: ObjectId) {
        if let Some(state) = self.objects.get_mut(&object) {
            state.networked = true;
            self.pending_network_spawns.push(object);
        }
    }

    fn spawn_area_initial(
        &mut self,
        area: &SpawnAreaData,
        asset: &str,
        transform: &Transform,
    ) -> Result<usize, SpawnError> {
        let prefab = self
            .resolve_asset(asset)
            .ok_or_else(|| SpawnError::AreaFailed {
                area_id: area.area_id.clone(),
                reason: format!("entry asset {} is not loaded", asset),
            })?;

        let mut rng = rand::thread_rng();
        for _ in 0..area.amount {
            let mut placed = *transform;
            if area.radius > 0.0 {
                placed.position[0] += rng.gen_range(-area.radius..=area.radius);
                placed.position[2] += rng.gen_range(-area.radius..=area.radius);
            }
            let id = self.instantiate(prefab, &placed);
            self.apply_fields(id, &SpawnKind::SpawnArea(area.clone()));
            self.network_spawn(id);
        }
        Ok(area.amount as usize)
    }

    fn spawn_observer(&mut self) -> Result<ObjectId, SpawnError> {
        if self.objects.values().any(|object| object.role == ObjectRole::Observer) {
            return Err(SpawnError::Observer("an observer already exists".into()));
        }
        Ok(self.insert(OBSERVER_ASSET.to_string(), Transform::default(), ObjectRole::Observer))
    }
}

impl TransformSync for SceneWorld {
    fn sync_transforms(&mut self, dimension: PhysicsDimension) {
        match dimension {
            PhysicsDimension::ThreeD => {
                self.index_3d = self
                    .objects
                    .values()
                    .map(|object| (object.id, object.transform.position))
                    .collect();
            }
            PhysicsDimension::TwoD => {
                self.index_2d = self
                    .objects
                    .values()
                    .map(|object| (object.id, [object.transform.position[0], object.transform.position[2]]))
                    .collect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::{SpawnAreaCategory, SpawnKind};
    use shared::physics_sync::PhysicsSyncScheduler;
    use std::time::Instant;

    fn loaded_world() -> SceneWorld {
        let mut world = SceneWorld::new();
        world.load_catalog(["portal", "npc_smith", "slime"]);
        world
    }

    #[test]
    fn test_catalog_sets_loaded_flag() {
        let mut world = SceneWorld::new();
        let flag = world.loaded_flag();
        assert!(!flag.load(Ordering::SeqCst));

        world.load_catalog(["portal"]);
        assert!(flag.load(Ordering::SeqCst));
        assert!(world.resolve_asset("portal").is_some());
        assert!(world.resolve_asset("dragon").is_none());

        world.clear();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_spawn_area_places_entities_within_radius() {
        let mut world = loaded_world();
        let area = SpawnAreaData {
            area_id: "field".into(),
            category: SpawnAreaCategory::Monster,
            amount: 4,
            radius: 2.0,
        };

        let spawned = world
            .spawn_area_initial(&area, "slime", &Transform::at(10.0, 0.0, 10.0))
            .unwrap();

        assert_eq!(spawned, 4);
        for object in world.objects() {
            assert!((object.transform.position[0] - 10.0).abs() <= 2.0);
            assert!((object.transform.position[2] - 10.0).abs() <= 2.0);
            assert!(object.networked);
        }
        assert_eq!(world.take_entity_updates(0).len(), 4);
        assert!(world.take_entity_updates(0).is_empty());
    }

    #[test]
    fn test_spawn_area_with_unknown_asset_fails() {
        let mut world = loaded_world();
        let area = SpawnAreaData {
            area_id: "cave".into(),
            category: SpawnAreaCategory::Harvestable,
            amount: 2,
            radius: 0.0,
        };

        let result = world.spawn_area_initial(&area, "crystal", &Transform::default());
        assert!(matches!(result, Err(SpawnError::AreaFailed { .. })));
        assert!(world.is_empty());
    }

    #[test]
    fn test_single_observer() {
        let mut world = SceneWorld::new();
        assert!(world.spawn_observer().is_ok());
        assert!(world.spawn_observer().is_err());
    }

    #[test]
    fn test_queries_see_moves_only_after_sync() {
        let mut world = loaded_world();
        let mut scheduler = PhysicsSyncScheduler::default();
        let prefab = world.resolve_asset("npc_smith").unwrap();
        let id = world.instantiate(prefab, &Transform::at(0.0, 0.0, 0.0));
        world.apply_fields(
            id,
            &SpawnKind::Npc(crate::spawn::NpcData {
                npc_id: "smith".into(),
                title: String::new(),
                dialog_id: String::new(),
            }),
        );
        let now = Instant::now();
        scheduler.force_sync(PhysicsDimension::ThreeD, &mut world, now);
        assert_eq!(world.query_radius([0.0; 3], 1.0), vec![id]);

        world.set_transform(id, Transform::at(50.0, 0.0, 50.0));
        assert_eq!(world.query_radius([0.0; 3], 1.0), vec![id]);

        scheduler.force_sync(PhysicsDimension::ThreeD, &mut world, now);
        assert!(world.query_radius([0.0; 3], 1.0).is_empty());
        assert!(world.query_radius_2d([50.0, 50.0], 1.0).is_empty());

        scheduler.force_sync(PhysicsDimension::TwoD, &mut world, now);
        assert_eq!(world.query_radius_2d([50.0, 50.0], 1.0), vec![id]);
        assert_eq!(
            world.get(id).unwrap().role,
            ObjectRole::Npc { npc_id: "smith".into() }
        );
    }
}
