//! Map-info replication with a type-name guard on the receiving side.

use crate::messages::MapInfoSnapshot;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MapInfoError {
    #[error("map info type mismatch: expected {expected}, received {received}")]
    TypeMismatch { expected: String, received: String },
    #[error("map info payload for {map_id} could not be decoded: {source}")]
    Payload {
        map_id: String,
        #[source]
        source: bincode::Error,
    },
    #[error("map info for {map_id} could not be encoded: {source}")]
    Encode {
        map_id: String,
        #[source]
        source: bincode::Error,
    },
}

/// A concrete map-info type. `TYPE_NAME` is sent along with the payload and
/// checked by the receiver before anything is decoded.
pub trait MapInfo: Serialize + DeserializeOwned + Default + Clone {
    const TYPE_NAME: &'static str;

    fn map_id(&self) -> &str;

    fn snapshot(&self) -> Result<MapInfoSnapshot, MapInfoError> {
        let payload = bincode::serialize(self).map_err(|source| MapInfoError::Encode {
            map_id: self.map_id().to_string(),
            source,
        })?;
        Ok(MapInfoSnapshot {
            map_id: self.map_id().to_string(),
            type_name: Self::TYPE_NAME.to_string(),
            payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BasicMapInfo {
    pub map_id: String,
    pub display_name: String,
    pub pvp_enabled: bool,
    pub respawn_map_id: String,
}

impl BasicMapInfo {
    pub fn new(map_id: impl Into<String>) -> Self {
        let map_id = map_id.into();
        Self {
            display_name: map_id.clone(),
            respawn_map_id: map_id.clone(),
            map_id,
            pvp_enabled: false,
        }
    }
}

impl MapInfo for BasicMapInfo {
    const TYPE_NAME: &'static str = "BasicMapInfo";

    fn map_id(&self) -> &str {
        &self.map_id
    }
}

/// Receiver-side holder. Rejected snapshots never touch the stored value.
#[derive(Debug, Clone, Default)]
pub struct MapInfoStore<M: MapInfo> {
    current: Option<M>,
    rejected: u32,
}

impl<M: MapInfo> MapInfoStore<M> {
    pub fn new() -> Self {
        Self {
            current: None,
            rejected: 0,
        }
    }

    pub fn apply(&mut self, snapshot: &MapInfoSnapshot) -> Result<(), MapInfoError> {
        match Self::decode(snapshot) {
            Ok(info) => {
                self.current = Some(info);
                Ok(())
            }
            Err(e) => {
                self.rejected += 1;
                warn!("Rejected map info update for {}: {}", snapshot.map_id, e);
                Err(e)
            }
        }
    }

    fn decode(snapshot: &MapInfoSnapshot) -> Result<M, MapInfoError> {
        if snapshot.type_name != M::TYPE_NAME {
            return Err(MapInfoError::TypeMismatch {
                expected: M::TYPE_NAME.to_string(),
                received: snapshot.type_name.clone(),
            });
        }
        bincode::deserialize(&snapshot.payload).map_err(|source| MapInfoError::Payload {
            map_id: snapshot.map_id.clone(),
            source,
        })
    }

    /// The last valid map info, or a blank default when none was ever valid.
    pub fn current(&self) -> M {
        self.current.clone().unwrap_or_default()
    }

    pub fn has_valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn rejected_count(&self) -> u32 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct DungeonMapInfo {
        map_id: String,
        floors: u8,
    }

    impl MapInfo for DungeonMapInfo {
        const TYPE_NAME: &'static str = "DungeonMapInfo";

        fn map_id(&self) -> &str {
            &self.map_id
        }
    }

    #[test]
    fn test_snapshot_is_accepted_by_matching_store() {
        let info = BasicMapInfo::new("Town01");
        let snapshot = info.snapshot().unwrap();
        assert_eq!(snapshot.map_id, "Town01");
        assert_eq!(snapshot.type_name, "BasicMapInfo");

        let mut store = MapInfoStore::<BasicMapInfo>::new();
        store.apply(&snapshot).unwrap();
        assert_eq!(store.current(), info);
        assert!(store.has_valid());
    }

    #[test]
    fn test_type_mismatch_leaves_state_unchanged() {
        let mut store = MapInfoStore::<BasicMapInfo>::new();
        store.apply(&BasicMapInfo::new("Town01").snapshot().unwrap()).unwrap();
        let before = bincode::serialize(&store.current()).unwrap();

        let foreign = DungeonMapInfo {
            map_id: "Dungeon02".into(),
            floors: 3,
        }
        .snapshot()
        .unwrap();
        let result = store.apply(&foreign);

        assert!(matches!(result, Err(MapInfoError::TypeMismatch { .. })));
        assert_eq!(bincode::serialize(&store.current()).unwrap(), before);
        assert_eq!(store.rejected_count(), 1);
    }

    #[test]
    fn test_mismatch_without_prior_state_falls_back_to_blank() {
        let mut store = MapInfoStore::<BasicMapInfo>::new();
        let foreign = DungeonMapInfo::default().snapshot().unwrap();

        assert!(store.apply(&foreign).is_err());
        assert!(!store.has_valid());
        assert_eq!(store.current(), BasicMapInfo::default());
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let mut store = MapInfoStore::<BasicMapInfo>::new();
        let snapshot = MapInfoSnapshot {
            map_id: "Town01".into(),
            type_name: BasicMapInfo::TYPE_NAME.into(),
            payload: vec![0xFF, 0x01],
        };

        assert!(matches!(store.apply(&snapshot), Err(MapInfoError::Payload { .. })));
        assert!(!store.has_valid());
    }
}
