use std::sync::Mutex;

use log::{debug, info};

use crate::{
    cache::{ConfigCache, ConfigSnapshot},
    peripherals::{command_duty, FanActuator, PresenceSensor, TemperatureSensor},
    schedule::{first_match, TimeOfDay},
    store::KvStore,
    types::{ControllerStatus, FanMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyReason {
    Manual,
    AutoCurve,
    /// `tmax <= tmin`: run flat out.
    AutoDegenerate,
    NoPresence,
    SensorFault,
    ScheduleSlot(usize),
    NoScheduleMatch,
    ClockUnavailable,
    UnknownMode,
}

impl DutyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::AutoCurve => "AUTO_CURVE",
            Self::AutoDegenerate => "AUTO_DEGENERATE",
            Self::NoPresence => "NO_PRESENCE",
            Self::SensorFault => "SENSOR_FAULT",
            Self::ScheduleSlot(_) => "SCHEDULE_SLOT",
            Self::NoScheduleMatch => "NO_SCHEDULE_MATCH",
            Self::ClockUnavailable => "CLOCK_UNAVAILABLE",
            Self::UnknownMode => "UNKNOWN_MODE",
        }
    }

    pub fn slot(self) -> Option<usize> {
        match self {
            Self::ScheduleSlot(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub duty: u8,
    pub reason: DutyReason,
}

impl Decision {
    fn new(duty: u8, reason: DutyReason) -> Self {
        Self { duty, reason }
    }
}

/// Linear ramp from `low` (0%) to `high` (100%), saturating at both ends.
/// Callers handle `high <= low` before getting here.
fn ramp(temp: f32, low: i32, high: i32) -> u8 {
    let (low, high) = (low as f32, high as f32);
    if temp <= low {
        0
    } else if temp >= high {
        100
    } else {
        (100.0 * (temp - low) / (high - low)).round().clamp(0.0, 100.0) as u8
    }
}

/// Shared by AUTO and by a matched schedule slot. `reason` is what a
/// successful evaluation reports.
fn curve(temp: Option<f32>, low: i32, high: i32, reason: DutyReason) -> Decision {
    let Some(temp) = temp.filter(|value| value.is_finite()) else {
        return Decision::new(0, DutyReason::SensorFault);
    };

    if high <= low {
        let reason = match reason {
            DutyReason::AutoCurve => DutyReason::AutoDegenerate,
            other => other,
        };
        return Decision::new(100, reason);
    }

    Decision::new(ramp(temp, low, high), reason)
}

/// Pure duty computation for one control tick.
///
/// `now` is the local time of day, or `None` when no trustworthy clock is
/// available yet. `temperature` is `None` when the thermistor has no valid reading.
pub fn decide(
    snapshot: &ConfigSnapshot,
    temperature: Option<f32>,
    presence: bool,
    now: Option<TimeOfDay>,
) -> Decision {
    let config = &snapshot.config;
    match config.mode {
        FanMode::Manual => Decision::new(config.manual_duty.min(100), DutyReason::Manual),
        FanMode::Auto => {
            if !presence {
                return Decision::new(0, DutyReason::NoPresence);
            }
            curve(
                temperature,
                config.auto.tmin,
                config.auto.tmax,
                DutyReason::AutoCurve,
            )
        }
        FanMode::Scheduled => {
            if !presence {
                return Decision::new(0, DutyReason::NoPresence);
            }
            let Some(now) = now else {
                return Decision::new(0, DutyReason::ClockUnavailable);
            };
            match first_match(&snapshot.slots, now) {
                Some((id, slot)) => curve(
                    temperature,
                    slot.t0 as i32,
                    slot.t100 as i32,
                    DutyReason::ScheduleSlot(id),
                ),
                None => Decision::new(0, DutyReason::NoScheduleMatch),
            }
        }
        FanMode::Unknown(_) => Decision::new(0, DutyReason::UnknownMode),
    }
}

#[derive(Debug, Clone, Copy)]
struct LastTick {
    temperature: Option<f32>,
    presence: bool,
    decision: Decision,
}

/// Remembers the previous tick for status reporting and change logging.
#[derive(Debug, Clone, Default)]
pub struct FanEngine {
    last: Option<LastTick>,
}

impl FanEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_decision(&self) -> Option<Decision> {
        self.last.map(|tick| tick.decision)
    }

    /// Evaluates one tick against already-sampled inputs.
    pub fn evaluate(
        &mut self,
        snapshot: &ConfigSnapshot,
        temperature: Option<f32>,
        presence: bool,
        now: Option<TimeOfDay>,
    ) -> Decision {
        let temperature = temperature.filter(|value| value.is_finite());
        let decision = decide(snapshot, temperature, presence, now);

        if self.last_decision() != Some(decision) {
            info!(
                "engine: mode={} duty={}% reason={}{}",
                snapshot.config.mode.as_str(),
                decision.duty,
                decision.reason.as_str(),
                decision
                    .reason
                    .slot()
                    .map(|id| format!(" slot={id}"))
                    .unwrap_or_default()
            );
        } else {
            debug!("engine: duty={}% unchanged", decision.duty);
        }

        self.last = Some(LastTick {
            temperature,
            presence,
            decision,
        });
        decision
    }

    /// Full control tick: sample both sensors, read the cache, drive the fan.
    pub fn tick<S, T, P, A>(
        &mut self,
        cache: &ConfigCache<S>,
        thermometer: &mut T,
        presence: &P,
        actuator: &Mutex<A>,
        now: Option<TimeOfDay>,
    ) -> Decision
    where
        S: KvStore,
        T: TemperatureSensor + ?Sized,
        P: PresenceSensor + ?Sized,
        A: FanActuator,
    {
        let temperature = thermometer.read_temperature();
        let present = presence.read_presence();
        let snapshot = cache.snapshot();

        let decision = self.evaluate(&snapshot, temperature, present, now);
        // A failed write is already logged; the next tick tries again.
        let _ = command_duty(actuator, decision.duty);
        decision
    }

    pub fn status(&self, mode: FanMode, time_synced: bool, timezone: &str) -> ControllerStatus {
        let (temp, presence, decision) = match self.last {
            Some(tick) => (tick.temperature, tick.presence, Some(tick.decision)),
            None => (None, false, None),
        };

        ControllerStatus {
            temp,
            presence,
            mode: mode.as_u8(),
            mode_name: mode.as_str(),
            duty: decision.map(|d| d.duty).unwrap_or(0),
            reason: decision.map(|d| d.reason.as_str()).unwrap_or("STARTING"),
            slot: decision.and_then(|d| d.reason.slot()),
            time_synced,
            timezone: timezone.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        peripherals::{FixedTemperature, RecordingActuator},
        schedule::{default_slots, ProgramSlot},
        store::MemoryStore,
        types::{AutoThresholds, FanConfig},
    };

    struct Present(bool);

    impl PresenceSensor for Present {
        fn read_presence(&self) -> bool {
            self.0
        }
    }

    fn snapshot(mode: FanMode) -> ConfigSnapshot {
        ConfigSnapshot {
            config: FanConfig {
                mode,
                manual_duty: 35,
                auto: AutoThresholds { tmin: 24, tmax: 28 },
            },
            slots: default_slots(),
        }
    }

    fn window(start: (u8, u8), end: (u8, u8), t0: i16, t100: i16) -> ProgramSlot {
        ProgramSlot {
            active: true,
            start: TimeOfDay::new(start.0, start.1),
            end: TimeOfDay::new(end.0, end.1),
            t0,
            t100,
        }
    }

    #[test]
    fn manual_ignores_sensors() {
        let manual = snapshot(FanMode::Manual);

        assert_eq!(decide(&manual, None, false, None), Decision::new(35, DutyReason::Manual));
        assert_eq!(decide(&manual, Some(40.0), true, None).duty, 35);
    }

    #[test]
    fn auto_interpolates_between_thresholds() {
        let auto = snapshot(FanMode::Auto);

        assert_eq!(decide(&auto, Some(26.0), true, None), Decision::new(50, DutyReason::AutoCurve));
        assert_eq!(decide(&auto, Some(24.0), true, None).duty, 0);
        assert_eq!(decide(&auto, Some(30.0), true, None).duty, 100);
        assert_eq!(decide(&auto, Some(25.0), true, None).duty, 25);
        assert_eq!(decide(&auto, Some(24.5), true, None).duty, 13);
    }

    #[test]
    fn auto_without_presence_is_off() {
        let auto = snapshot(FanMode::Auto);

        assert_eq!(decide(&auto, Some(35.0), false, None), Decision::new(0, DutyReason::NoPresence));
    }

    #[test]
    fn degenerate_thresholds_run_flat_out() {
        let mut auto = snapshot(FanMode::Auto);
        auto.config.auto = AutoThresholds { tmin: 28, tmax: 24 };

        assert_eq!(
            decide(&auto, Some(10.0), true, None),
            Decision::new(100, DutyReason::AutoDegenerate)
        );

        auto.config.auto = AutoThresholds { tmin: 25, tmax: 25 };
        assert_eq!(decide(&auto, Some(10.0), true, None).duty, 100);
    }

    #[test]
    fn missing_temperature_forces_zero() {
        let auto = snapshot(FanMode::Auto);
        assert_eq!(decide(&auto, None, true, None), Decision::new(0, DutyReason::SensorFault));

        let mut scheduled = snapshot(FanMode::Scheduled);
        scheduled.slots[0] = window((0, 0), (23, 59), 20, 30);
        assert_eq!(
            decide(&scheduled, None, true, Some(TimeOfDay::new(12, 0))),
            Decision::new(0, DutyReason::SensorFault)
        );
    }

    #[test]
    fn scheduled_wrap_window() {
        let mut scheduled = snapshot(FanMode::Scheduled);
        scheduled.slots[0] = window((22, 0), (6, 0), 24, 28);

        assert_eq!(
            decide(&scheduled, Some(26.0), true, Some(TimeOfDay::new(23, 30))),
            Decision::new(50, DutyReason::ScheduleSlot(1))
        );
        assert_eq!(
            decide(&scheduled, Some(26.0), true, Some(TimeOfDay::new(10, 0))),
            Decision::new(0, DutyReason::NoScheduleMatch)
        );
    }

    #[test]
    fn scheduled_first_match_wins() {
        let mut scheduled = snapshot(FanMode::Scheduled);
        scheduled.slots[0] = window((20, 0), (23, 0), 20, 30);
        scheduled.slots[1] = window((21, 0), (22, 0), 26, 27);

        let decision = decide(&scheduled, Some(25.0), true, Some(TimeOfDay::new(21, 30)));

        assert_eq!(decision, Decision::new(50, DutyReason::ScheduleSlot(1)));
    }

    #[test]
    fn scheduled_degenerate_slot_and_presence() {
        let mut scheduled = snapshot(FanMode::Scheduled);
        scheduled.slots[2] = window((8, 0), (9, 0), 30, 30);
        let now = Some(TimeOfDay::new(8, 30));

        assert_eq!(
            decide(&scheduled, Some(0.0), true, now),
            Decision::new(100, DutyReason::ScheduleSlot(3))
        );
        assert_eq!(decide(&scheduled, Some(0.0), false, now).reason, DutyReason::NoPresence);
        assert_eq!(
            decide(&scheduled, Some(0.0), true, None).reason,
            DutyReason::ClockUnavailable
        );
    }

    #[test]
    fn unknown_mode_fails_safe() {
        let unknown = snapshot(FanMode::Unknown(7));

        assert_eq!(
            decide(&unknown, Some(40.0), true, Some(TimeOfDay::new(1, 0))),
            Decision::new(0, DutyReason::UnknownMode)
        );
    }

    #[test]
    fn tick_drives_actuator_and_reports_status() {
        let cache = ConfigCache::new(MemoryStore::new());
        cache.set_auto_thresholds(AutoThresholds { tmin: 24, tmax: 28 }).unwrap();
        cache.set_mode(FanMode::Auto).unwrap();
        let actuator = Mutex::new(RecordingActuator::default());
        let mut engine = FanEngine::new();

        let decision = engine.tick(
            &cache,
            &mut FixedTemperature(Some(27.0)),
            &Present(true),
            &actuator,
            None,
        );

        assert_eq!(decision.duty, 75);
        assert_eq!(actuator.lock().unwrap().last(), Some(75));

        let status = engine.status(cache.mode(), false, "UTC");
        assert_eq!(status.temp, Some(27.0));
        assert!(status.presence);
        assert_eq!(status.mode_name, "AUTO");
        assert_eq!(status.duty, 75);
        assert_eq!(status.reason, "AUTO_CURVE");
        assert_eq!(status.slot, None);
    }

    #[test]
    fn status_before_first_tick() {
        let status = FanEngine::new().status(FanMode::Scheduled, true, "Europe/Rome");

        assert_eq!(status.mode, 2);
        assert_eq!(status.duty, 0);
        assert_eq!(status.reason, "STARTING");
        assert_eq!(status.temp, None);
    }
}
