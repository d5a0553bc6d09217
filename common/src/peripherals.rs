use std::sync::{Mutex, PoisonError};

use log::warn;

use crate::error::ActuatorError;

/// Source of the ambient temperature in °C. `None` means no usable reading.
pub trait TemperatureSensor: Send {
    fn read_temperature(&mut self) -> Option<f32>;
}

pub trait PresenceSensor: Send {
    fn read_presence(&self) -> bool;
}

/// Fan drive output, in percent.
pub trait FanActuator: Send {
    fn set_duty(&mut self, percent: u8) -> Result<(), ActuatorError>;
}

/// Commands the shared actuator, clamping to 100%. Failures are logged and
/// reported back; the next control tick retries with a fresh value.
pub fn command_duty<A: FanActuator>(actuator: &Mutex<A>, percent: u8) -> Result<(), ActuatorError> {
    let percent = percent.min(100);
    let mut actuator = actuator.lock().unwrap_or_else(PoisonError::into_inner);
    actuator.set_duty(percent).inspect_err(|err| {
        warn!("actuator: setting {percent}% failed: {err}");
    })
}

/// Reading handed in from outside, e.g. a test or a simulated sensor.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedTemperature(pub Option<f32>);

impl TemperatureSensor for FixedTemperature {
    fn read_temperature(&mut self) -> Option<f32> {
        self.0.filter(|value| value.is_finite())
    }
}

/// Actuator that only remembers what it was told.
#[derive(Debug, Clone, Default)]
pub struct RecordingActuator {
    pub history: Vec<u8>,
}

impl RecordingActuator {
    pub fn last(&self) -> Option<u8> {
        self.history.last().copied()
    }
}

impl FanActuator for RecordingActuator {
    fn set_duty(&mut self, percent: u8) -> Result<(), ActuatorError> {
        self.history.push(percent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenFan;

    impl FanActuator for BrokenFan {
        fn set_duty(&mut self, _percent: u8) -> Result<(), ActuatorError> {
            Err(ActuatorError("ledc offline".to_string()))
        }
    }

    #[test]
    fn command_clamps_before_driving() {
        let actuator = Mutex::new(RecordingActuator::default());

        command_duty(&actuator, 180).unwrap();

        assert_eq!(actuator.lock().unwrap().last(), Some(100));
    }

    #[test]
    fn command_reports_driver_failure() {
        let actuator = Mutex::new(BrokenFan);

        assert!(command_duty(&actuator, 40).is_err());
    }

    #[test]
    fn fixed_temperature_hides_nan() {
        assert_eq!(FixedTemperature(Some(f32::NAN)).read_temperature(), None);
        assert_eq!(FixedTemperature(Some(21.5)).read_temperature(), Some(21.5));
    }
}
