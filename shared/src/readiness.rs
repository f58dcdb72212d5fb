//! Readiness latch gating when dynamic world objects may be instantiated.
//!
//! A gate belongs to one scope (server objects or client objects). It opens
//! once every registered criterion is true on the same poll and stays open
//! until the scene changes, whatever the criteria report afterwards.
//!
//! The gate does not wait by itself: its owner calls [`ReadinessGate::poll`]
//! on a fixed cadence ([`POLL_INTERVAL`]) while the gate is closed.

use log::{error, info};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MINIMUM_DELAY: Duration = Duration::from_secs(1);
pub const MINIMUM_DELAY_KEY: &str = "minimum_delay";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadinessScope {
    ServerObjects,
    ClientObjects,
}

/// A named boolean precondition, evaluated with the time elapsed since the
/// scene was activated.
pub trait Criterion: Send + Sync {
    fn evaluate(&mut self, elapsed: Duration) -> bool;
}

impl<F> Criterion for F
where
    F: FnMut(Duration) -> bool + Send + Sync,
{
    fn evaluate(&mut self, elapsed: Duration) -> bool {
        self(elapsed)
    }
}

/// Built-in criterion: holds the gate closed for a fixed delay after
/// activation so other subsystems get to register their own criteria first.
#[derive(Debug, Clone, Copy)]
pub struct MinimumDelay(pub Duration);

impl Criterion for MinimumDelay {
    fn evaluate(&mut self, elapsed: Duration) -> bool {
        elapsed >= self.0
    }
}

pub struct ReadinessGate {
    scope: ReadinessScope,
    activated_at: Instant,
    minimum_delay: Duration,
    criteria: BTreeMap<String, Box<dyn Criterion>>,
    states: BTreeMap<String, bool>,
    latched: bool,
    open_timeout: Option<Duration>,
    timed_out: bool,
}

impl ReadinessGate {
    pub fn new(scope: ReadinessScope, activated_at: Instant) -> Self {
        Self::with_minimum_delay(scope, activated_at, DEFAULT_MINIMUM_DELAY)
    }

    pub fn with_minimum_delay(
        scope: ReadinessScope,
        activated_at: Instant,
        minimum_delay: Duration,
    ) -> Self {
        let mut gate = Self {
            scope,
            activated_at,
            minimum_delay,
            criteria: BTreeMap::new(),
            states: BTreeMap::new(),
            latched: false,
            open_timeout: None,
            timed_out: false,
        };
        gate.register_criterion(MINIMUM_DELAY_KEY, MinimumDelay(minimum_delay));
        gate
    }

    /// Flags the gate as timed out when it is still closed this long after
    /// activation. Without it a criterion that never resolves keeps the gate
    /// closed forever.
    pub fn set_open_timeout(&mut self, timeout: Option<Duration>) {
        self.open_timeout = timeout;
    }

    /// Registers (or replaces) a criterion. Has no effect on a latched gate.
    pub fn register_criterion(&mut self, key: impl Into<String>, criterion: impl Criterion + 'static) {
        let key = key.into();
        self.states.insert(key.clone(), false);
        self.criteria.insert(key, Box::new(criterion));
    }

    pub fn remove_criterion(&mut self, key: &str) -> bool {
        self.states.remove(key);
        self.criteria.remove(key).is_some()
    }

    /// Re-evaluates every criterion unless the gate already latched.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.latched {
            return true;
        }

        let elapsed = now.saturating_duration_since(self.activated_at);
        for (key, criterion) in self.criteria.iter_mut() {
            self.states.insert(key.clone(), criterion.evaluate(elapsed));
        }

        if self.states.values().all(|ready| *ready) {
            self.latched = true;
            info!(
                "{:?} readiness gate opened after {:.2}s",
                self.scope,
                elapsed.as_secs_f32()
            );
            return true;
        }

        if let Some(timeout) = self.open_timeout {
            if elapsed >= timeout && !self.timed_out {
                self.timed_out = true;
                let pending: Vec<&str> = self
                    .states
                    .iter()
                    .filter(|(_, ready)| !**ready)
                    .map(|(key, _)| key.as_str())
                    .collect();
                error!(
                    "{:?} readiness gate still closed after {:?}; unresolved criteria: {:?}",
                    self.scope, timeout, pending
                );
            }
        }

        false
    }

    /// Scene change: unlatch, drop every criterion and start over with only
    /// the built-in delay.
    pub fn reset(&mut self, now: Instant) {
        self.activated_at = now;
        self.criteria.clear();
        self.states.clear();
        self.latched = false;
        self.timed_out = false;
        self.register_criterion(MINIMUM_DELAY_KEY, MinimumDelay(self.minimum_delay));
    }

    pub fn is_open(&self) -> bool {
        self.latched
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn scope(&self) -> ReadinessScope {
        self.scope
    }

    pub fn activated_at(&self) -> Instant {
        self.activated_at
    }

    /// Latest evaluated value of every criterion.
    pub fn states(&self) -> &BTreeMap<String, bool> {
        &self.states
    }
}
