//! Throttled manual physics-transform synchronisation.
//!
//! Gameplay code that moves transforms by hand calls [`PhysicsSyncScheduler::mark_dirty`];
//! the tick loop calls [`PhysicsSyncScheduler::maybe_sync`], which recomputes at
//! most once per `min_interval` per dimension. Call sites about to run a
//! latency-critical spatial query use [`PhysicsSyncScheduler::force_sync`].

use log::debug;
use std::time::{Duration, Instant};

/// Roughly a 120 Hz cap.
pub const DEFAULT_MIN_SYNC_INTERVAL: Duration = Duration::from_millis(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicsDimension {
    ThreeD,
    TwoD,
}

impl PhysicsDimension {
    pub const ALL: [PhysicsDimension; 2] = [PhysicsDimension::ThreeD, PhysicsDimension::TwoD];

    fn index(self) -> usize {
        match self {
            PhysicsDimension::ThreeD => 0,
            PhysicsDimension::TwoD => 1,
        }
    }
}

/// The expensive recomputation itself, provided by whoever owns the physics
/// scene.
pub trait TransformSync {
    fn sync_transforms(&mut self, dimension: PhysicsDimension);
}

#[derive(Debug, Clone, Copy, Default)]
struct DirtySyncFlag {
    dirty: bool,
    auto_sync: bool,
    last_sync: Option<Instant>,
    sync_count: u64,
}

#[derive(Debug, Clone)]
pub struct PhysicsSyncScheduler {
    min_interval: Duration,
    flags: [DirtySyncFlag; 2],
}

impl Default for PhysicsSyncScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SYNC_INTERVAL)
    }
}

impl PhysicsSyncScheduler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            flags: [DirtySyncFlag::default(); 2],
        }
    }

    pub fn mark_dirty(&mut self, dimension: PhysicsDimension) {
        self.flags[dimension.index()].dirty = true;
    }

    /// Legacy "sync every frame" switch. It only keeps the dimension dirty;
    /// the throttle still decides when a sync actually happens.
    pub fn set_auto_sync(&mut self, dimension: PhysicsDimension, enabled: bool) {
        self.flags[dimension.index()].auto_sync = enabled;
    }

    pub fn is_dirty(&self, dimension: PhysicsDimension) -> bool {
        self.flags[dimension.index()].dirty
    }

    /// Syncs immediately, ignoring the throttle.
    pub fn force_sync<T: TransformSync>(
        &mut self,
        dimension: PhysicsDimension,
        target: &mut T,
        now: Instant,
    ) {
        debug!(
            "Forced {:?} transform sync (dirty: {})",
            dimension,
            self.is_dirty(dimension)
        );
        self.perform(dimension, target, now);
    }

    /// Per-tick entry point. Returns how many dimensions were synced.
    pub fn maybe_sync<T: TransformSync>(&mut self, target: &mut T, now: Instant) -> usize {
        let mut synced = 0;

        for dimension in PhysicsDimension::ALL {
            let flag = &mut self.flags[dimension.index()];
            if flag.auto_sync {
                flag.dirty = true;
            }
            if !flag.dirty {
                continue;
            }

            let due = match flag.last_sync {
                Some(last) => now.saturating_duration_since(last) >= self.min_interval,
                None => true,
            };
            if due {
                self.perform(dimension, target, now);
                synced += 1;
            }
        }

        synced
    }

    pub fn sync_count(&self, dimension: PhysicsDimension) -> u64 {
        self.flags[dimension.index()].sync_count
    }

    pub fn last_sync(&self, dimension: PhysicsDimension) -> Option<Instant> {
        self.flags[dimension.index()].last_sync
    }

    fn perform<T: TransformSync>(&mut self, dimension: PhysicsDimension, target: &mut T, now: Instant) {
        target.sync_transforms(dimension);
        let flag = &mut self.flags[dimension.index()];
        flag.dirty = false;
        flag.last_sync = Some(now);
        flag.sync_count += 1;
    }
}
