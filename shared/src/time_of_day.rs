//! Cyclical in-game clock.

use crate::messages::TimeOfDayUpdate;

pub const HOURS_PER_DAY: f32 = 24.0;

/// Server-side clock. `speed` is in-game hours per real second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeOfDayClock {
    hours: f32,
    speed: f32,
}

impl TimeOfDayClock {
    pub fn new(hours: f32, speed: f32) -> Self {
        Self {
            hours: wrap_hours(hours),
            speed,
        }
    }

    pub fn advance(&mut self, dt: f32) {
        self.hours = wrap_hours(self.hours + self.speed * dt);
    }

    pub fn hours(&self) -> f32 {
        self.hours
    }
}

pub fn wrap_hours(hours: f32) -> f32 {
    let wrapped = hours.rem_euclid(HOURS_PER_DAY);
    // rem_euclid can round up to exactly 24.0 for tiny negative inputs.
    if wrapped >= HOURS_PER_DAY {
        0.0
    } else {
        wrapped
    }
}

/// Client-side view. Updates arrive unreliably, so only one stamped later
/// than the current value is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeOfDayState {
    hours: f32,
    stamped_at_ms: Option<u64>,
}

impl TimeOfDayState {
    /// Seeds the clock from the enter-game response.
    pub fn seed(&mut self, hours: f32) {
        self.hours = wrap_hours(hours);
    }

    pub fn apply(&mut self, update: &TimeOfDayUpdate) -> bool {
        if let Some(stamped) = self.stamped_at_ms {
            if update.server_time_ms < stamped {
                return false;
            }
        }
        self.hours = wrap_hours(update.time_of_day);
        self.stamped_at_ms = Some(update.server_time_ms);
        true
    }

    pub fn hours(&self) -> f32 {
        self.hours
    }
}
