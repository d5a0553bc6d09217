use chrono::{DateTime, Datelike, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fan_common::{
    schedule::slot_index,
    types::{AutoConfigView, ManualConfigView, SlotPayload},
    ConfigError, FanMode, ProgramSlot, TimeOfDay, SLOT_COUNT,
};

/// Anything before this year means the RTC has not been set yet.
const MIN_PLAUSIBLE_YEAR: i32 = 2024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Missing or invalid '{0}' parameter")]
    BadParam(&'static str),
    #[error("Invalid slot id (1-{max})")]
    InvalidSlot { max: usize },
    #[error("Invalid timezone value")]
    InvalidTimezone,
    #[error("Invalid request body")]
    BadBody,
    #[error("Change applied but could not be saved")]
    NotPersisted,
    #[error("Internal error")]
    Internal,
}

impl RequestError {
    pub fn status(&self) -> u16 {
        match self {
            Self::NotPersisted | Self::Internal => 500,
            _ => 400,
        }
    }
}

impl From<ConfigError> for RequestError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidSlot { max, .. } => Self::InvalidSlot { max },
            ConfigError::Storage(_) => Self::NotPersisted,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl From<&RequestError> for ErrorBody {
    fn from(err: &RequestError) -> Self {
        Self {
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TimeStatus {
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: i64,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimezoneUpdate {
    pub timezone: String,
}

#[cfg_attr(not(feature = "esp32"), allow(dead_code))]
pub fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

/// Slot id as the transport sees it: anything outside 1..=N is a client error.
pub fn parse_slot_id(raw: Option<&str>) -> Result<usize, RequestError> {
    let id = raw
        .and_then(|value| value.trim().parse::<usize>().ok())
        .ok_or(RequestError::BadParam("id"))?;
    slot_index(id)
        .map(|_| id)
        .ok_or(RequestError::InvalidSlot { max: SLOT_COUNT })
}

pub fn parse_manual_value(raw: Option<&str>) -> Result<i32, RequestError> {
    raw.and_then(|value| value.trim().parse::<i32>().ok())
        .ok_or(RequestError::BadParam("value"))
}

pub fn parse_slot_body(body: &[u8]) -> Result<(usize, ProgramSlot), RequestError> {
    let payload: SlotPayload = serde_json::from_slice(body).map_err(|_| RequestError::BadBody)?;
    slot_index(payload.id).ok_or(RequestError::InvalidSlot { max: SLOT_COUNT })?;
    Ok((payload.id, payload.to_slot()))
}

pub fn validate_timezone(timezone: &str) -> Result<(), RequestError> {
    timezone
        .parse::<Tz>()
        .map(|_| ())
        .map_err(|_| RequestError::InvalidTimezone)
}

pub fn manual_view(mode: FanMode, duty: u8) -> ManualConfigView {
    ManualConfigView {
        mode: mode.as_u8(),
        manual_duty: duty,
    }
}

pub fn auto_view(mode: FanMode, tmin: i32, tmax: i32) -> AutoConfigView {
    AutoConfigView {
        tmin,
        tmax,
        mode: mode.as_u8(),
    }
}

pub fn slot_view(id: usize, slot: &ProgramSlot) -> SlotPayload {
    SlotPayload::from_slot(id, slot)
}

pub fn now_in_timezone(timezone: &str) -> Option<DateTime<FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

/// Local time of day, or `None` while the zone is unknown or the clock is
/// still at its power-on epoch.
pub fn local_time_of_day(timezone: &str) -> Option<TimeOfDay> {
    let now = now_in_timezone(timezone)?;
    (now.year() >= MIN_PLAUSIBLE_YEAR).then(|| TimeOfDay::from_datetime(now))
}

pub fn time_status(timezone: &str) -> TimeStatus {
    let local = local_time_of_day(timezone);
    TimeStatus {
        time_synced: local.is_some(),
        timezone: timezone.to_string(),
        now_epoch: Utc::now().timestamp(),
        local_time: local.map(|time| time.to_string()),
    }
}
