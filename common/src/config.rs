use serde::{Deserialize, Serialize};

use crate::{ntc::NtcParams, presence::Polarity};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlConfig {
    pub period_ms: u64,
    pub state_publish_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            state_publish_interval_ms: 10_000,
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.period_ms = self.period_ms.clamp(100, 60_000);
        self.state_publish_interval_ms = self.state_publish_interval_ms.clamp(1_000, 3_600_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn mqtt_enabled(&self) -> bool {
        !self.mqtt_host.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    /// PIR module: interrupt driven, debounced, needs warm-up.
    Motion,
    /// IR obstacle module: plain level read.
    Proximity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceConfig {
    pub kind: PresenceKind,
    pub pin: i32,
    pub polarity: Polarity,
    pub debounce_ms: u64,
    pub warmup_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            kind: PresenceKind::Motion,
            pin: 10,
            polarity: Polarity::ActiveLow,
            debounce_ms: 50,
            warmup_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    pub fan_pin: i32,
    pub pwm_frequency_hz: u32,
    pub pwm_resolution_bits: u8,
    #[serde(default)]
    pub thermistor: NtcParams,
    #[serde(default)]
    pub presence: PresenceConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            fan_pin: 9,
            pwm_frequency_hz: 25_000,
            pwm_resolution_bits: 10,
            thermistor: NtcParams::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        if self.fan_pin < 0 {
            self.fan_pin = 9;
        }
        self.pwm_frequency_hz = self.pwm_frequency_hz.clamp(1_000, 40_000);
        self.pwm_resolution_bits = self.pwm_resolution_bits.clamp(8, 14);
        self.thermistor.sanitize();

        if self.presence.pin < 0 {
            self.presence.pin = 10;
        }
        self.presence.debounce_ms = self.presence.debounce_ms.clamp(5, 1_000);
        self.presence.warmup_ms = self.presence.warmup_ms.min(120_000);
    }
}

/// Device settings kept apart from the fan configuration namespace, so a
/// factory reset of the fan settings leaves connectivity intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub control: ControlConfig,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            timezone: "UTC".to_string(),
            network: NetworkConfig::default(),
            hardware: HardwareConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.control.sanitize();
        self.hardware.sanitize();
        if self.timezone.trim().is_empty() {
            self.timezone = "UTC".to_string();
        }
    }
}
