//! Server configuration and map definitions.

use crate::spawn::{
    EntitySpawnDescriptor, NpcData, PortalData, SpawnAreaCategory, SpawnAreaData, SpawnKind, Transform,
};
use crate::world_state::{DEFAULT_LIVENESS_INTERVAL, DEFAULT_TIME_BROADCAST_INTERVAL};
use crate::connection::DEFAULT_CLIENT_TIMEOUT;
use serde::{Deserialize, Serialize};
use shared::map_info::BasicMapInfo;
use shared::messages::ServerInfo;
use shared::physics_sync::DEFAULT_MIN_SYNC_INTERVAL;
use shared::readiness::DEFAULT_MINIMUM_DELAY;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read map file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid map file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A map as loaded by the server: its replicated info, the prefabs it makes
/// available and the static entities placed in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDefinition {
    pub info: BasicMapInfo,
    #[serde(default)]
    pub assets: Vec<String>,
    #[serde(default)]
    pub spawns: Vec<EntitySpawnDescriptor>,
}

impl MapDefinition {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Built-in starting town used when no map file is given.
    pub fn town01() -> Self {
        let mut info = BasicMapInfo::new("Town01");
        info.display_name = "Riverside Town".to_string();

        Self {
            info,
            assets: vec![
                "portal".to_string(),
                "npc_blacksmith".to_string(),
                "npc_guard".to_string(),
                "slime".to_string(),
                "herb".to_string(),
            ],
            spawns: vec![
                EntitySpawnDescriptor {
                    asset: "portal".to_string(),
                    transform: Transform::at(40.0, 0.0, 0.0),
                    kind: SpawnKind::Portal(PortalData {
                        destination_map: "Field01".to_string(),
                        destination_position: [-38.0, 0.0, 0.0],
                        keep_rotation: true,
                    }),
                },
                EntitySpawnDescriptor {
                    asset: "npc_blacksmith".to_string(),
                    transform: Transform::at(5.0, 0.0, 3.0),
                    kind: SpawnKind::Npc(NpcData {
                        npc_id: "blacksmith".to_string(),
                        title: "Blacksmith".to_string(),
                        dialog_id: "smith_greeting".to_string(),
                    }),
                },
                EntitySpawnDescriptor {
                    asset: "npc_guard".to_string(),
                    transform: Transform::at(35.0, 0.0, 2.0),
                    kind: SpawnKind::Npc(NpcData {
                        npc_id: "gate_guard".to_string(),
                        title: "Guard".to_string(),
                        dialog_id: "guard_warning".to_string(),
                    }),
                },
                EntitySpawnDescriptor {
                    asset: "slime".to_string(),
                    transform: Transform::at(25.0, 0.0, -20.0),
                    kind: SpawnKind::SpawnArea(SpawnAreaData {
                        area_id: "south_meadow".to_string(),
                        category: SpawnAreaCategory::Monster,
                        amount: 6,
                        radius: 8.0,
                    }),
                },
                EntitySpawnDescriptor {
                    asset: "herb".to_string(),
                    transform: Transform::at(-15.0, 0.0, 12.0),
                    kind: SpawnKind::SpawnArea(SpawnAreaData {
                        area_id: "herb_garden".to_string(),
                        category: SpawnAreaCategory::Harvestable,
                        amount: 4,
                        radius: 3.0,
                    }),
                },
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub temporarily_closed: bool,
    pub server_info: ServerInfo,
    pub map: MapDefinition,
    pub readiness_delay: Duration,
    /// `None` waits for readiness indefinitely
    pub readiness_timeout: Option<Duration>,
    pub headless: bool,
    pub time_of_day_start: f32,
    /// In-game hours per real second
    pub time_of_day_speed: f32,
    pub liveness_interval: Duration,
    pub time_broadcast_interval: Duration,
    pub physics_min_interval: Duration,
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            tick_rate: 60,
            max_clients: 16,
            temporarily_closed: false,
            server_info: ServerInfo {
                channel_id: "ch1".to_string(),
                title: "Channel 1".to_string(),
                description: String::new(),
            },
            map: MapDefinition::town01(),
            readiness_delay: DEFAULT_MINIMUM_DELAY,
            readiness_timeout: None,
            headless: true,
            time_of_day_start: 8.0,
            time_of_day_speed: 1.0 / 60.0,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            time_broadcast_interval: DEFAULT_TIME_BROADCAST_INTERVAL,
            physics_min_interval: DEFAULT_MIN_SYNC_INTERVAL,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick rate must be positive".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max clients must be positive".into()));
        }
        if self.map.info.map_id.is_empty() {
            return Err(ConfigError::Invalid("map id must not be empty".into()));
        }
        if !self.time_of_day_speed.is_finite() {
            return Err(ConfigError::Invalid("time of day speed must be finite".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.map.info.map_id, "Town01");
        assert!(config.readiness_timeout.is_none());
    }

    #[test]
    fn test_tick_duration() {
        let config = ServerConfig {
            tick_rate: 50,
            ..Default::default()
        };
        assert_eq!(config.tick_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ServerConfig {
            max_clients: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_town01_assets_cover_spawns() {
        let map = MapDefinition::town01();
        for spawn in &map.spawns {
            assert!(map.assets.contains(&spawn.asset), "{} missing", spawn.asset);
        }
    }

    #[test]
    fn test_map_definition_from_json() {
        let json = r#"{
            "info": {
                "map_id": "Field01",
                "display_name": "Open Field",
                "pvp_enabled": true,
                "respawn_map_id": "Town01"
            },
            "assets": ["portal"],
            "spawns": [
                {
                    "asset": "portal",
                    "type": "Portal",
                    "destination_map": "Town01",
                    "destination_position": [38.0, 0.0, 0.0]
                }
            ]
        }"#;
        let map: MapDefinition = serde_json::from_str(json).unwrap();

        assert_eq!(map.info.map_id, "Field01");
        assert!(map.info.pvp_enabled);
        assert_eq!(map.spawns.len(), 1);
        assert!(matches!(map.spawns[0].kind, SpawnKind::Portal(_)));
    }

    #[test]
    fn test_missing_map_file() {
        let result = MapDefinition::load(Path::new("/nonexistent/map.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
