use std::sync::{Arc, Mutex};

use log::info;

use crate::{
    cache::ConfigCache,
    error::ConfigError,
    peripherals::{command_duty, FanActuator},
    schedule::ProgramSlot,
    store::KvStore,
    types::{AutoThresholds, FanMode, SlotSummary},
};

/// Operations the transport layer calls. Writing a setting for a mode also
/// switches the controller into that mode.
pub struct FanControlApi<S, A> {
    cache: Arc<ConfigCache<S>>,
    actuator: Arc<Mutex<A>>,
}

impl<S, A> Clone for FanControlApi<S, A> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            actuator: Arc::clone(&self.actuator),
        }
    }
}

impl<S: KvStore, A: FanActuator> FanControlApi<S, A> {
    pub fn new(cache: Arc<ConfigCache<S>>, actuator: Arc<Mutex<A>>) -> Self {
        Self { cache, actuator }
    }

    pub fn cache(&self) -> &Arc<ConfigCache<S>> {
        &self.cache
    }

    pub fn actuator(&self) -> &Arc<Mutex<A>> {
        &self.actuator
    }

    /// Clamps to 0..=100, stores it, selects MANUAL and drives the fan right
    /// away instead of waiting for the next tick. Returns the applied duty.
    pub fn set_manual_duty(&self, percent: i32) -> Result<u8, ConfigError> {
        let percent = percent.clamp(0, 100) as u8;
        let stored = self.cache.apply_manual_duty(percent);
        // Logged inside; the periodic loop re-applies it anyway.
        let _ = command_duty(&self.actuator, percent);
        info!("api: manual duty {percent}%");
        stored.map(|_| percent)
    }

    /// Any pair is accepted; `tmax <= tmin` is handled by the engine.
    pub fn set_auto_thresholds(&self, tmin: i32, tmax: i32) -> Result<(), ConfigError> {
        let stored = self.cache.apply_auto_thresholds(AutoThresholds { tmin, tmax });
        info!("api: auto thresholds {tmin}..{tmax}");
        stored
    }

    /// Out-of-range ids are rejected without touching the mode.
    pub fn set_slot(&self, id: usize, slot: ProgramSlot) -> Result<(), ConfigError> {
        let stored = self.cache.apply_slot(id, slot);
        if !matches!(stored, Err(ConfigError::InvalidSlot { .. })) {
            info!("api: slot {id} written, mode scheduled");
        }
        stored
    }

    pub fn erase_slot(&self, id: usize) -> Result<(), ConfigError> {
        self.cache.erase_slot(id)
    }

    pub fn get_mode(&self) -> FanMode {
        self.cache.mode()
    }

    pub fn get_manual_duty(&self) -> u8 {
        self.cache.manual_duty()
    }

    pub fn get_auto_thresholds(&self) -> AutoThresholds {
        self.cache.auto_thresholds()
    }

    pub fn get_slot(&self, id: usize) -> ProgramSlot {
        self.cache.get_slot(id)
    }

    pub fn slot_summaries(&self) -> Vec<SlotSummary> {
        self.cache
            .slots()
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotSummary {
                id: index + 1,
                window: slot.window_label(),
            })
            .collect()
    }

    pub fn reset_all(&self) -> Result<(), ConfigError> {
        self.cache.reset_all()
    }

    /// Duty driven before the first control tick: the stored manual duty in
    /// MANUAL, off in every other mode.
    pub fn apply_boot_duty(&self) -> u8 {
        let duty = match self.cache.mode() {
            FanMode::Manual => self.cache.manual_duty(),
            _ => 0,
        };
        let _ = command_duty(&self.actuator, duty);
        info!("api: boot duty {duty}% (mode {})", self.cache.mode().as_str());
        duty
    }
}
