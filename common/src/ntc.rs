use serde::{Deserialize, Serialize};

const KELVIN_OFFSET: f32 = 273.15;

/// Readings this close to either supply rail mean an open or shorted thermistor.
const RAIL_MARGIN_V: f32 = 0.01;

/// Divider `VCC --[r_fixed]--+--[NTC]-- GND`, sampled at the junction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NtcParams {
    pub vcc: f32,
    pub r_fixed_ohms: f32,
    pub beta: f32,
    pub r0_ohms: f32,
    pub t0_kelvin: f32,
    pub offset_c: f32,
    pub adc_max: u16,
}

impl Default for NtcParams {
    fn default() -> Self {
        Self {
            vcc: 3.3,
            r_fixed_ohms: 10_000.0,
            beta: 3950.0,
            r0_ohms: 10_000.0,
            t0_kelvin: 298.15,
            offset_c: -24.0,
            adc_max: 4095,
        }
    }
}

impl NtcParams {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !(self.vcc.is_finite() && self.vcc > 0.0) {
            self.vcc = defaults.vcc;
        }
        if !(self.r_fixed_ohms.is_finite() && self.r_fixed_ohms > 0.0) {
            self.r_fixed_ohms = defaults.r_fixed_ohms;
        }
        if !(self.beta.is_finite() && self.beta > 0.0) {
            self.beta = defaults.beta;
        }
        if !(self.r0_ohms.is_finite() && self.r0_ohms > 0.0) {
            self.r0_ohms = defaults.r0_ohms;
        }
        if !(self.t0_kelvin.is_finite() && self.t0_kelvin > 0.0) {
            self.t0_kelvin = defaults.t0_kelvin;
        }
        if !self.offset_c.is_finite() {
            self.offset_c = 0.0;
        }
        if self.adc_max == 0 {
            self.adc_max = defaults.adc_max;
        }
    }

    /// Beta-equation temperature for a raw ADC count, calibration offset
    /// included. `None` near the rails or for any non-finite result.
    pub fn celsius_from_raw(&self, raw: u16) -> Option<f32> {
        let vout = raw.min(self.adc_max) as f32 / self.adc_max as f32 * self.vcc;
        if vout <= RAIL_MARGIN_V || vout >= self.vcc - RAIL_MARGIN_V {
            return None;
        }

        let r_ntc = vout * self.r_fixed_ohms / (self.vcc - vout);
        let inv_t = 1.0 / self.t0_kelvin + (r_ntc / self.r0_ohms).ln() / self.beta;
        let celsius = 1.0 / inv_t - KELVIN_OFFSET + self.offset_c;

        celsius.is_finite().then_some(celsius)
    }
}

/// LEDC compare value for `percent` at the given timer resolution.
pub fn duty_to_ledc(percent: u8, resolution_bits: u8) -> u32 {
    let max = (1_u32 << resolution_bits.clamp(1, 20)) - 1;
    percent.min(100) as u32 * max / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midscale_reads_reference_temperature_plus_offset() {
        let params = NtcParams::default();

        let celsius = params.celsius_from_raw(2048).unwrap();

        assert!((celsius - 1.0).abs() < 0.1, "got {celsius}");
    }

    #[test]
    fn hotter_thermistor_reads_higher() {
        let params = NtcParams {
            offset_c: 0.0,
            ..NtcParams::default()
        };

        // Lower junction voltage means lower NTC resistance.
        let warm = params.celsius_from_raw(1500).unwrap();
        let cool = params.celsius_from_raw(2500).unwrap();

        assert!(warm > 25.0 && cool < 25.0, "warm={warm} cool={cool}");
    }

    #[test]
    fn rails_are_not_available() {
        let params = NtcParams::default();

        assert_eq!(params.celsius_from_raw(0), None);
        assert_eq!(params.celsius_from_raw(4095), None);
        assert_eq!(params.celsius_from_raw(u16::MAX), None);
    }

    #[test]
    fn sanitize_repairs_unusable_values() {
        let mut params = NtcParams {
            beta: 0.0,
            adc_max: 0,
            offset_c: f32::NAN,
            ..NtcParams::default()
        };

        params.sanitize();

        assert_eq!(params.beta, 3950.0);
        assert_eq!(params.adc_max, 4095);
        assert_eq!(params.offset_c, 0.0);
    }

    #[test]
    fn ledc_duty_scales_to_resolution() {
        assert_eq!(duty_to_ledc(0, 10), 0);
        assert_eq!(duty_to_ledc(50, 10), 511);
        assert_eq!(duty_to_ledc(100, 10), 1023);
        assert_eq!(duty_to_ledc(250, 10), 1023);
        assert_eq!(duty_to_ledc(100, 8), 255);
    }
}
