/// Simulated per-drone energy budget
///
/// Every drone starts at 100% on first reference and only ever drains:
/// with elapsed time, per accepted reading and per summary sent. The level
/// gates ingestion and summary delivery, and fires a one-shot
/// return-to-base latch.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use time::OffsetDateTime;

use crate::config::PipelineConfig;

const FULL_LEVEL: f64 = 100.0;
const EMPTY_LEVEL: f64 = 0.0;

#[derive(Debug, Clone)]
struct BatteryState {
    level: f64,
    last_update: Option<OffsetDateTime>,
    returned_to_base: bool,
}

impl Default for BatteryState {
    fn default() -> Self {
        BatteryState {
            level: FULL_LEVEL,
            last_update: None,
            returned_to_base: false,
        }
    }
}

impl BatteryState {
    fn drain(&mut self, amount: f64) -> f64 {
        self.level = (self.level - amount).clamp(EMPTY_LEVEL, FULL_LEVEL);
        self.level
    }
}

/// Result of a return-to-base check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReturnToBaseCheck {
    /// True only on the call that latched the event
    pub triggered: bool,
    pub level: f64,
}

/// Battery table shared by the reading task and the aggregation task.
///
/// A single lock covers the whole table; every compound read-modify-write
/// happens under it.
#[derive(Debug)]
pub struct BatteryStateManager {
    states: Mutex<HashMap<String, BatteryState>>,
    time_drain_per_sec: f64,
    drain_per_read: f64,
    drain_per_send: f64,
    motor_drain_factor: f64,
    accept_threshold: f64,
    return_to_base_threshold: f64,
}

impl BatteryStateManager {
    pub fn new(config: &PipelineConfig) -> Self {
        BatteryStateManager {
            states: Mutex::new(HashMap::new()),
            time_drain_per_sec: config.time_drain_per_sec,
            drain_per_read: config.drain_per_read,
            drain_per_send: config.drain_per_send,
            motor_drain_factor: config.motor_drain_factor,
            accept_threshold: config.accept_threshold,
            return_to_base_threshold: config.return_to_base_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BatteryState>> {
        // Each update is a single assignment, so a poisoned table is still consistent
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_state<R>(&self, drone_id: &str, f: impl FnOnce(&mut BatteryState) -> R) -> R {
        let mut states = self.lock();
        let state = states.entry(drone_id.to_string()).or_default();
        f(state)
    }

    /// Drain proportionally to the time since the previous update
    ///
    /// The first call for a drone only records `now`. A `now` earlier than
    /// the previous update drains nothing but still becomes the new
    /// reference point.
    pub fn apply_time_drain(&self, drone_id: &str, now: OffsetDateTime) -> f64 {
        let rate = self.time_drain_per_sec;
        self.with_state(drone_id, |state| {
            let elapsed = state
                .last_update
                .map(|last| (now - last).as_seconds_f64())
                .unwrap_or(0.0);
            state.last_update = Some(now);
            state.drain(elapsed.max(0.0) * rate)
        })
    }

    pub fn should_accept(&self, drone_id: &str) -> bool {
        let threshold = self.accept_threshold;
        self.with_state(drone_id, |state| state.level >= threshold)
    }

    pub fn drain_on_read(&self, drone_id: &str) -> f64 {
        let cost = self.drain_per_read;
        self.with_state(drone_id, |state| state.drain(cost))
    }

    pub fn drain_on_send(&self, drone_id: &str, avg_motor_power: f64) -> f64 {
        let cost = self.drain_per_send + avg_motor_power * self.motor_drain_factor;
        self.with_state(drone_id, |state| state.drain(cost))
    }

    pub fn level_of(&self, drone_id: &str) -> f64 {
        self.lock()
            .get(drone_id)
            .map(|state| state.level)
            .unwrap_or(FULL_LEVEL)
    }

    /// Latch the return-to-base event the first time the level is below threshold
    pub fn check_return_to_base(&self, drone_id: &str) -> ReturnToBaseCheck {
        let threshold = self.return_to_base_threshold;
        self.with_state(drone_id, |state| {
            let triggered = state.level < threshold && !state.returned_to_base;
            if triggered {
                state.returned_to_base = true;
            }
            ReturnToBaseCheck {
                triggered,
                level: state.level,
            }
        })
    }
}
