use serde::{Deserialize, Serialize};

use crate::schedule::ProgramSlot;

/// Operating mode as persisted under the `mode` key.
///
/// Values outside 0..=2 can come back from flash written by older firmware;
/// they are carried as `Unknown` so the engine can fail safe on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum FanMode {
    #[default]
    Manual,
    Auto,
    Scheduled,
    Unknown(u8),
}

impl FanMode {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Manual => 0,
            Self::Auto => 1,
            Self::Scheduled => 2,
            Self::Unknown(raw) => raw,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Auto => "AUTO",
            Self::Scheduled => "SCHEDULED",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u8> for FanMode {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Manual,
            1 => Self::Auto,
            2 => Self::Scheduled,
            other => Self::Unknown(other),
        }
    }
}

impl From<FanMode> for u8 {
    fn from(mode: FanMode) -> Self {
        mode.as_u8()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoThresholds {
    pub tmin: i32,
    pub tmax: i32,
}

/// Scalar settings mirrored from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanConfig {
    pub mode: FanMode,
    pub manual_duty: u8,
    pub auto: AutoThresholds,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub temp: Option<f32>,
    pub presence: bool,
    pub mode: u8,
    #[serde(rename = "modeName")]
    pub mode_name: &'static str,
    pub duty: u8,
    pub reason: &'static str,
    pub slot: Option<usize>,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualConfigView {
    pub mode: u8,
    #[serde(rename = "manualDuty")]
    pub manual_duty: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoConfigView {
    pub tmin: i32,
    pub tmax: i32,
    pub mode: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoConfigUpdate {
    pub tmin: i32,
    pub tmax: i32,
}

/// Wire form of one schedule slot. Fields are wider than storage so the
/// transport can hand out-of-range numbers to the clamping in `ProgramSlot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotPayload {
    pub id: usize,
    pub active: bool,
    #[serde(rename = "hStart")]
    pub h_start: i32,
    #[serde(rename = "mStart")]
    pub m_start: i32,
    #[serde(rename = "hEnd")]
    pub h_end: i32,
    #[serde(rename = "mEnd")]
    pub m_end: i32,
    pub t0: i32,
    pub t100: i32,
}

impl SlotPayload {
    pub fn from_slot(id: usize, slot: &ProgramSlot) -> Self {
        Self {
            id,
            active: slot.active,
            h_start: slot.start.hour as i32,
            m_start: slot.start.minute as i32,
            h_end: slot.end.hour as i32,
            m_end: slot.end.minute as i32,
            t0: slot.t0 as i32,
            t100: slot.t100 as i32,
        }
    }

    pub fn to_slot(&self) -> ProgramSlot {
        ProgramSlot::from_parts(
            self.active,
            (self.h_start, self.m_start),
            (self.h_end, self.m_end),
            self.t0,
            self.t100,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSummary {
    pub id: usize,
    pub window: String,
}
