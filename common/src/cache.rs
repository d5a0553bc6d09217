use std::sync::{OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::{
    error::{ConfigError, StoreError},
    schedule::{
        decode_slots, default_slots, encode_slots, slot_index, ProgramSlot, SlotTable, SLOT_COUNT,
    },
    store::{KvStore, KEY_AUTO_TMAX, KEY_AUTO_TMIN, KEY_MANUAL_DUTY, KEY_MODE, KEY_SLOTS},
    types::{AutoThresholds, FanConfig, FanMode},
};

pub const DEFAULT_MANUAL_DUTY: u8 = 0;
pub const DEFAULT_AUTO_TMIN: i32 = 24;
pub const DEFAULT_AUTO_TMAX: i32 = 28;

pub const DEFAULT_THRESHOLDS: AutoThresholds = AutoThresholds {
    tmin: DEFAULT_AUTO_TMIN,
    tmax: DEFAULT_AUTO_TMAX,
};

/// Everything one control tick needs, copied out under shared locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub config: FanConfig,
    pub slots: SlotTable,
}

#[derive(Debug)]
struct Loaded {
    mode: RwLock<FanMode>,
    manual_duty: RwLock<u8>,
    thresholds: RwLock<AutoThresholds>,
    slots: RwLock<SlotTable>,
}

/// In-memory mirror of the persisted fan configuration.
///
/// Loading happens once, on whichever caller gets here first. Each scalar
/// group and the slot table sit behind their own lock, and every mutation
/// keeps its write lock until the store write has returned, so readers never
/// see a value that is newer than what was handed to flash.
#[derive(Debug)]
pub struct ConfigCache<S> {
    store: S,
    loaded: OnceLock<Loaded>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn or_default<T: std::fmt::Debug>(key: &str, result: Result<T, StoreError>, default: T) -> T {
    match result {
        Ok(value) => value,
        Err(StoreError::NotFound) => {
            info!("config: `{key}` not stored, using default {default:?}");
            default
        }
        Err(err) => {
            warn!("config: reading `{key}` failed ({err}), using default {default:?}");
            default
        }
    }
}

fn persisted(key: &str, result: Result<(), StoreError>) -> Result<(), ConfigError> {
    result.map_err(|err| {
        warn!("config: writing `{key}` failed, change kept in memory only: {err}");
        ConfigError::Storage(err)
    })
}

impl<S: KvStore> ConfigCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            loaded: OnceLock::new(),
        }
    }

    /// Loads every key on first use. Concurrent first callers block until the
    /// single load has finished.
    pub fn ensure_loaded(&self) {
        self.state();
    }

    fn state(&self) -> &Loaded {
        self.loaded.get_or_init(|| self.load())
    }

    fn load(&self) -> Loaded {
        let mode = FanMode::from(or_default(
            KEY_MODE,
            self.store.get_u8(KEY_MODE),
            FanMode::default().as_u8(),
        ));
        let manual_duty = or_default(
            KEY_MANUAL_DUTY,
            self.store.get_u8(KEY_MANUAL_DUTY),
            DEFAULT_MANUAL_DUTY,
        )
        .min(100);
        let thresholds = AutoThresholds {
            tmin: or_default(KEY_AUTO_TMIN, self.store.get_i32(KEY_AUTO_TMIN), DEFAULT_AUTO_TMIN),
            tmax: or_default(KEY_AUTO_TMAX, self.store.get_i32(KEY_AUTO_TMAX), DEFAULT_AUTO_TMAX),
        };
        let slots = self.load_slots();

        info!(
            "config: loaded mode={} manual={}% auto={}..{}",
            mode.as_str(),
            manual_duty,
            thresholds.tmin,
            thresholds.tmax
        );

        Loaded {
            mode: RwLock::new(mode),
            manual_duty: RwLock::new(manual_duty),
            thresholds: RwLock::new(thresholds),
            slots: RwLock::new(slots),
        }
    }

    fn load_slots(&self) -> SlotTable {
        let blob = match self.store.get_blob(KEY_SLOTS) {
            Ok(blob) => blob,
            Err(err) => return or_default(KEY_SLOTS, Err(err), default_slots()),
        };

        let (mut slots, decoded) = decode_slots(&blob);
        if decoded < SLOT_COUNT {
            info!(
                "config: `{KEY_SLOTS}` holds {decoded} of {SLOT_COUNT} slots, defaulting the rest"
            );
        }
        for slot in &mut slots {
            slot.sanitize();
        }
        slots
    }

    pub fn mode(&self) -> FanMode {
        *read(&self.state().mode)
    }

    pub fn set_mode(&self, mode: FanMode) -> Result<(), ConfigError> {
        let mut current = write(&self.state().mode);
        *current = mode;
        debug!("config: mode -> {}", mode.as_str());
        self.persist_mode(mode)
    }

    pub fn manual_duty(&self) -> u8 {
        *read(&self.state().manual_duty)
    }

    /// Stores `duty` clamped to 0..=100 and returns the stored value.
    pub fn set_manual_duty(&self, duty: u8) -> Result<u8, ConfigError> {
        let duty = duty.min(100);
        let mut current = write(&self.state().manual_duty);
        *current = duty;
        persisted(KEY_MANUAL_DUTY, self.store.set_u8(KEY_MANUAL_DUTY, duty))?;
        Ok(duty)
    }

    pub fn auto_thresholds(&self) -> AutoThresholds {
        *read(&self.state().thresholds)
    }

    /// Writes both keys even if the first one fails; the first error wins.
    pub fn set_auto_thresholds(&self, thresholds: AutoThresholds) -> Result<(), ConfigError> {
        let mut current = write(&self.state().thresholds);
        *current = thresholds;
        let tmin = persisted(KEY_AUTO_TMIN, self.store.set_i32(KEY_AUTO_TMIN, thresholds.tmin));
        let tmax = persisted(KEY_AUTO_TMAX, self.store.set_i32(KEY_AUTO_TMAX, thresholds.tmax));
        tmin.and(tmax)
    }

    /// Copy of slot `id` (1-based). Out-of-range ids read as the default slot.
    pub fn get_slot(&self, id: usize) -> ProgramSlot {
        match slot_index(id) {
            Some(index) => read(&self.state().slots)[index],
            None => {
                warn!("config: slot {id} requested, outside 1..={SLOT_COUNT}");
                ProgramSlot::default()
            }
        }
    }

    pub fn slots(&self) -> SlotTable {
        *read(&self.state().slots)
    }

    pub fn set_slot(&self, id: usize, slot: ProgramSlot) -> Result<(), ConfigError> {
        let Some(index) = slot_index(id) else {
            warn!("config: ignoring write to slot {id}, outside 1..={SLOT_COUNT}");
            return Err(ConfigError::InvalidSlot {
                id,
                max: SLOT_COUNT,
            });
        };

        let mut slot = slot;
        slot.sanitize();

        let mut slots = write(&self.state().slots);
        slots[index] = slot;
        debug!("config: slot {id} -> {}", slot.window_label());
        persisted(KEY_SLOTS, self.store.set_blob(KEY_SLOTS, &encode_slots(&slots)))
    }

    pub fn erase_slot(&self, id: usize) -> Result<(), ConfigError> {
        let Some(index) = slot_index(id) else {
            warn!("config: ignoring erase of slot {id}, outside 1..={SLOT_COUNT}");
            return Err(ConfigError::InvalidSlot {
                id,
                max: SLOT_COUNT,
            });
        };

        let mut slots = write(&self.state().slots);
        slots[index] = ProgramSlot::default();
        debug!("config: slot {id} erased");
        persisted(KEY_SLOTS, self.store.set_blob(KEY_SLOTS, &encode_slots(&slots)))
    }

    /// Stores `duty` and selects MANUAL as one step.
    pub fn apply_manual_duty(&self, duty: u8) -> Result<u8, ConfigError> {
        let duty = duty.min(100);
        let state = self.state();
        let mut mode = write(&state.mode);
        let mut current = write(&state.manual_duty);

        *current = duty;
        *mode = FanMode::Manual;
        let stored = persisted(KEY_MANUAL_DUTY, self.store.set_u8(KEY_MANUAL_DUTY, duty));
        let switched = self.persist_mode(FanMode::Manual);
        stored.and(switched).map(|()| duty)
    }

    /// Stores both thresholds and selects AUTO as one step.
    pub fn apply_auto_thresholds(&self, thresholds: AutoThresholds) -> Result<(), ConfigError> {
        let state = self.state();
        let mut mode = write(&state.mode);
        let mut current = write(&state.thresholds);

        *current = thresholds;
        *mode = FanMode::Auto;
        let tmin = persisted(KEY_AUTO_TMIN, self.store.set_i32(KEY_AUTO_TMIN, thresholds.tmin));
        let tmax = persisted(KEY_AUTO_TMAX, self.store.set_i32(KEY_AUTO_TMAX, thresholds.tmax));
        let switched = self.persist_mode(FanMode::Auto);
        tmin.and(tmax).and(switched)
    }

    /// Writes slot `id` and selects SCHEDULED as one step. An invalid id
    /// changes nothing, the mode included.
    pub fn apply_slot(&self, id: usize, slot: ProgramSlot) -> Result<(), ConfigError> {
        let Some(index) = slot_index(id) else {
            warn!("config: ignoring write to slot {id}, outside 1..={SLOT_COUNT}");
            return Err(ConfigError::InvalidSlot {
                id,
                max: SLOT_COUNT,
            });
        };

        let mut slot = slot;
        slot.sanitize();

        let state = self.state();
        let mut slots = write(&state.slots);
        let mut mode = write(&state.mode);

        slots[index] = slot;
        *mode = FanMode::Scheduled;
        debug!("config: slot {id} -> {}", slot.window_label());
        let stored = persisted(KEY_SLOTS, self.store.set_blob(KEY_SLOTS, &encode_slots(&slots)));
        let switched = self.persist_mode(FanMode::Scheduled);
        stored.and(switched)
    }

    fn persist_mode(&self, mode: FanMode) -> Result<(), ConfigError> {
        persisted(KEY_MODE, self.store.set_u8(KEY_MODE, mode.as_u8()))
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let state = self.state();
        // One guard at a time, so no ordering with the stacked writers.
        let slots = *read(&state.slots);
        let mode = *read(&state.mode);
        let manual_duty = *read(&state.manual_duty);
        let auto = *read(&state.thresholds);

        ConfigSnapshot {
            config: FanConfig {
                mode,
                manual_duty,
                auto,
            },
            slots,
        }
    }

    /// Clears the namespace and puts every cached value back to its default.
    pub fn reset_all(&self) -> Result<(), ConfigError> {
        let state = self.state();

        // Stacked writers all acquire in this order: slots, mode, manual, thresholds.
        let mut slots = write(&state.slots);
        let mut mode = write(&state.mode);
        let mut manual_duty = write(&state.manual_duty);
        let mut thresholds = write(&state.thresholds);

        *slots = default_slots();
        *mode = FanMode::default();
        *manual_duty = DEFAULT_MANUAL_DUTY;
        *thresholds = DEFAULT_THRESHOLDS;

        info!("config: reset to defaults");
        persisted("*", self.store.erase_all())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        schedule::TimeOfDay,
        store::{MemoryStore, StoredValue},
    };

    fn slot(start: (u8, u8), end: (u8, u8), t0: i16, t100: i16) -> ProgramSlot {
        ProgramSlot {
            active: true,
            start: TimeOfDay::new(start.0, start.1),
            end: TimeOfDay::new(end.0, end.1),
            t0,
            t100,
        }
    }

    #[test]
    fn empty_store_loads_defaults_without_writing_them() {
        let store = MemoryStore::new();
        let cache = ConfigCache::new(store.clone());

        let snapshot = cache.snapshot();

        assert_eq!(snapshot.config.mode, FanMode::Manual);
        assert_eq!(snapshot.config.manual_duty, 0);
        assert_eq!(snapshot.config.auto, DEFAULT_THRESHOLDS);
        assert_eq!(snapshot.slots, default_slots());
        assert!(!store.contains(KEY_MODE));
        assert!(!store.contains(KEY_SLOTS));
    }

    #[test]
    fn slot_round_trips_and_survives_restart() {
        let store = MemoryStore::new();
        let written = slot((22, 0), (6, 0), 24, 28);
        {
            let cache = ConfigCache::new(store.clone());
            cache.set_slot(2, written).unwrap();
            assert_eq!(cache.get_slot(2), written);
        }

        let restarted = ConfigCache::new(store);
        assert_eq!(restarted.get_slot(2), written);
        assert_eq!(restarted.get_slot(1), ProgramSlot::default());
    }

    #[test]
    fn invalid_ids_fail_soft_on_read_and_are_rejected_on_write() {
        let store = MemoryStore::new();
        let cache = ConfigCache::new(store.clone());

        assert_eq!(cache.get_slot(0), ProgramSlot::default());
        assert_eq!(cache.get_slot(SLOT_COUNT + 1), ProgramSlot::default());

        let err = cache.set_slot(0, slot((1, 0), (2, 0), 20, 30)).unwrap_err();
        assert_eq!(err, ConfigError::InvalidSlot { id: 0, max: SLOT_COUNT });
        assert!(cache.erase_slot(SLOT_COUNT + 1).is_err());
        assert_eq!(cache.slots(), default_slots());
        assert!(!store.contains(KEY_SLOTS));
    }

    #[test]
    fn erase_slot_restores_default() {
        let cache = ConfigCache::new(MemoryStore::new());
        cache.set_slot(3, slot((8, 0), (9, 0), 20, 22)).unwrap();

        cache.erase_slot(3).unwrap();

        assert_eq!(cache.get_slot(3), ProgramSlot::default());
    }

    #[test]
    fn manual_duty_is_clamped() {
        let cache = ConfigCache::new(MemoryStore::new());

        assert_eq!(cache.set_manual_duty(250).unwrap(), 100);
        assert_eq!(cache.manual_duty(), 100);
    }

    #[test]
    fn unknown_stored_mode_is_preserved() {
        let store = MemoryStore::new();
        store.set_u8(KEY_MODE, 9).unwrap();

        let cache = ConfigCache::new(store);

        assert_eq!(cache.mode(), FanMode::Unknown(9));
    }

    #[test]
    fn read_faults_fall_back_to_defaults() {
        let store = MemoryStore::new();
        store.set_u8(KEY_MANUAL_DUTY, 70).unwrap();
        store.set_fail_reads(true);

        let cache = ConfigCache::new(store);

        assert_eq!(cache.manual_duty(), DEFAULT_MANUAL_DUTY);
        assert_eq!(cache.auto_thresholds(), DEFAULT_THRESHOLDS);
    }

    #[test]
    fn mistyped_keys_fall_back_to_defaults() {
        let store = MemoryStore::new();
        store.insert_raw(KEY_AUTO_TMIN, StoredValue::U8(3));
        store.insert_raw(KEY_SLOTS, StoredValue::I32(1));

        let cache = ConfigCache::new(store);

        assert_eq!(cache.auto_thresholds().tmin, DEFAULT_AUTO_TMIN);
        assert_eq!(cache.slots(), default_slots());
    }

    #[test]
    fn write_fault_keeps_memory_and_reports_error() {
        let store = MemoryStore::new();
        let cache = ConfigCache::new(store.clone());
        cache.ensure_loaded();
        store.set_fail_writes(true);

        let result = cache.set_auto_thresholds(AutoThresholds { tmin: 30, tmax: 35 });

        assert!(matches!(result, Err(ConfigError::Storage(_))));
        assert_eq!(cache.auto_thresholds(), AutoThresholds { tmin: 30, tmax: 35 });

        store.set_fail_writes(false);
        let restarted = ConfigCache::new(store);
        assert_eq!(restarted.auto_thresholds(), DEFAULT_THRESHOLDS);
    }

    #[test]
    fn reset_clears_store_and_memory() {
        let store = MemoryStore::new();
        let cache = ConfigCache::new(store.clone());
        cache.set_mode(FanMode::Scheduled).unwrap();
        cache.set_manual_duty(60).unwrap();
        cache.set_auto_thresholds(AutoThresholds { tmin: 18, tmax: 22 }).unwrap();
        cache.set_slot(1, slot((1, 0), (2, 0), 20, 30)).unwrap();

        cache.reset_all().unwrap();

        assert_eq!(cache.mode(), FanMode::Manual);
        assert_eq!(cache.manual_duty(), 0);
        assert_eq!(cache.auto_thresholds(), DEFAULT_THRESHOLDS);
        assert_eq!(cache.slots(), default_slots());
        assert!(!store.contains(KEY_MODE));
        assert!(!store.contains(KEY_SLOTS));
    }

    #[test]
    fn concurrent_first_access_loads_once() {
        let store = MemoryStore::new();
        store.set_u8(KEY_MANUAL_DUTY, 42).unwrap();
        let cache = Arc::new(ConfigCache::new(store));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.manual_duty()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
    }

    #[test]
    fn concurrent_writes_to_different_slots_are_not_lost() {
        let store = MemoryStore::new();
        let cache = Arc::new(ConfigCache::new(store.clone()));
        let first = slot((6, 0), (7, 0), 20, 25);
        let second = slot((18, 30), (23, 0), 22, 26);

        for _ in 0..50 {
            let barrier = Arc::new(Barrier::new(2));
            let writers: Vec<_> = [(1, first), (2, second)]
                .into_iter()
                .map(|(id, value)| {
                    let cache = Arc::clone(&cache);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        cache.set_slot(id, value).unwrap();
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }

            let reloaded = ConfigCache::new(store.clone());
            assert_eq!(reloaded.get_slot(1), first);
            assert_eq!(reloaded.get_slot(2), second);

            cache.erase_slot(1).unwrap();
            cache.erase_slot(2).unwrap();
        }
    }

    #[test]
    fn apply_slot_with_bad_id_leaves_mode_alone() {
        let cache = ConfigCache::new(MemoryStore::new());
        cache.set_mode(FanMode::Auto).unwrap();

        let result = cache.apply_slot(SLOT_COUNT + 1, slot((1, 0), (2, 0), 20, 30));

        assert!(matches!(result, Err(ConfigError::InvalidSlot { .. })));
        assert_eq!(cache.mode(), FanMode::Auto);
    }

    #[test]
    fn apply_manual_duty_persists_value_and_mode_together() {
        let store = MemoryStore::new();
        let cache = ConfigCache::new(store.clone());
        cache.set_mode(FanMode::Auto).unwrap();

        assert_eq!(cache.apply_manual_duty(140).unwrap(), 100);

        let reloaded = ConfigCache::new(store);
        assert_eq!(reloaded.mode(), FanMode::Manual);
        assert_eq!(reloaded.manual_duty(), 100);
    }

    #[test]
    fn reset_racing_apply_slot_never_mixes_outcomes() {
        let store = MemoryStore::new();
        let cache = Arc::new(ConfigCache::new(store.clone()));
        let program = slot((6, 0), (7, 0), 20, 25);

        for _ in 0..100 {
            let barrier = Arc::new(Barrier::new(2));
            let writer = {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.apply_slot(1, program).unwrap();
                })
            };
            let resetter = {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.reset_all().unwrap();
                })
            };
            writer.join().unwrap();
            resetter.join().unwrap();

            let reloaded = ConfigCache::new(store.clone());
            for view in [&*cache, &reloaded] {
                match view.mode() {
                    FanMode::Scheduled => assert_eq!(view.get_slot(1), program),
                    FanMode::Manual => assert_eq!(view.slots(), default_slots()),
                    other => panic!("unexpected mode {other:?}"),
                }
            }
            assert_eq!(cache.mode(), reloaded.mode());

            cache.reset_all().unwrap();
        }
    }
}
