use chrono::{DateTime, FixedOffset, Timelike};
use serde::{Deserialize, Serialize};

pub const SLOT_COUNT: usize = 3;

/// Encoded size of one slot record inside the `prog_slots` blob.
pub const SLOT_RECORD_LEN: usize = 10;

pub const DEFAULT_SLOT_T0: i16 = 24;
pub const DEFAULT_SLOT_T100: i16 = 28;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    /// Clamps out-of-range components instead of rejecting them.
    pub fn clamped(hour: i32, minute: i32) -> Self {
        Self {
            hour: hour.clamp(0, 23) as u8,
            minute: minute.clamp(0, 59) as u8,
        }
    }

    pub fn from_datetime(now: DateTime<FixedOffset>) -> Self {
        Self {
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }

    pub fn minutes(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSlot {
    pub active: bool,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    /// Temperature (°C) mapped to 0% duty.
    pub t0: i16,
    /// Temperature (°C) mapped to 100% duty.
    pub t100: i16,
}

impl Default for ProgramSlot {
    fn default() -> Self {
        Self {
            active: false,
            start: TimeOfDay::default(),
            end: TimeOfDay::default(),
            t0: DEFAULT_SLOT_T0,
            t100: DEFAULT_SLOT_T100,
        }
    }
}

impl ProgramSlot {
    pub fn from_parts(
        active: bool,
        start: (i32, i32),
        end: (i32, i32),
        t0: i32,
        t100: i32,
    ) -> Self {
        Self {
            active,
            start: TimeOfDay::clamped(start.0, start.1),
            end: TimeOfDay::clamped(end.0, end.1),
            t0: t0.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            t100: t100.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
        }
    }

    pub fn sanitize(&mut self) {
        self.start = TimeOfDay::clamped(self.start.hour as i32, self.start.minute as i32);
        self.end = TimeOfDay::clamped(self.end.hour as i32, self.end.minute as i32);
    }

    /// Window containment in minutes since midnight. `start == end` is an
    /// empty window; `start > end` wraps past midnight.
    pub fn contains(&self, now: TimeOfDay) -> bool {
        let cur = now.minutes();
        let start = self.start.minutes();
        let end = self.end.minutes();

        if start == end {
            false
        } else if start < end {
            start <= cur && cur < end
        } else {
            cur >= start || cur < end
        }
    }

    pub fn window_label(&self) -> String {
        if self.active {
            format!("{}-{}", self.start, self.end)
        } else {
            "--".to_string()
        }
    }

    fn encode_into(&self, out: &mut [u8]) {
        out[0] = self.active as u8;
        out[1] = self.start.hour;
        out[2] = self.start.minute;
        out[3] = self.end.hour;
        out[4] = self.end.minute;
        out[5] = 0;
        out[6..8].copy_from_slice(&self.t0.to_le_bytes());
        out[8..10].copy_from_slice(&self.t100.to_le_bytes());
    }

    fn decode(record: &[u8]) -> Self {
        Self {
            active: record[0] != 0,
            start: TimeOfDay::new(record[1], record[2]),
            end: TimeOfDay::new(record[3], record[4]),
            t0: i16::from_le_bytes([record[6], record[7]]),
            t100: i16::from_le_bytes([record[8], record[9]]),
        }
    }
}

pub type SlotTable = [ProgramSlot; SLOT_COUNT];

/// Array index for a 1-based slot id, if it names a slot.
pub fn slot_index(id: usize) -> Option<usize> {
    (1..=SLOT_COUNT).contains(&id).then(|| id - 1)
}

pub fn default_slots() -> SlotTable {
    [ProgramSlot::default(); SLOT_COUNT]
}

pub fn encode_slots(slots: &SlotTable) -> Vec<u8> {
    let mut blob = vec![0_u8; SLOT_COUNT * SLOT_RECORD_LEN];
    for (slot, record) in slots.iter().zip(blob.chunks_exact_mut(SLOT_RECORD_LEN)) {
        slot.encode_into(record);
    }
    blob
}

/// Decodes every complete leading record; slots the blob does not cover keep
/// their defaults. Returns the table and the number of records decoded.
pub fn decode_slots(blob: &[u8]) -> (SlotTable, usize) {
    let mut slots = default_slots();
    let mut decoded = 0;
    for (slot, record) in slots.iter_mut().zip(blob.chunks_exact(SLOT_RECORD_LEN)) {
        *slot = ProgramSlot::decode(record);
        decoded += 1;
    }
    (slots, decoded)
}

/// First active slot (ascending id) whose window contains `now`.
pub fn first_match(slots: &SlotTable, now: TimeOfDay) -> Option<(usize, &ProgramSlot)> {
    slots
        .iter()
        .enumerate()
        .find(|(_, slot)| slot.active && slot.contains(now))
        .map(|(index, slot)| (index + 1, slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn slot(start: (u8, u8), end: (u8, u8)) -> ProgramSlot {
        ProgramSlot {
            active: true,
            start: TimeOfDay::new(start.0, start.1),
            end: TimeOfDay::new(end.0, end.1),
            t0: 24,
            t100: 28,
        }
    }

    #[test]
    fn plain_window_is_half_open() {
        let window = slot((8, 0), (17, 30));

        assert!(!window.contains(TimeOfDay::new(7, 59)));
        assert!(window.contains(TimeOfDay::new(8, 0)));
        assert!(window.contains(TimeOfDay::new(17, 29)));
        assert!(!window.contains(TimeOfDay::new(17, 30)));
    }

    #[test]
    fn wrapping_window_spans_midnight() {
        let window = slot((22, 0), (6, 0));

        assert!(window.contains(TimeOfDay::new(23, 30)));
        assert!(window.contains(TimeOfDay::new(0, 0)));
        assert!(window.contains(TimeOfDay::new(5, 59)));
        assert!(!window.contains(TimeOfDay::new(6, 0)));
        assert!(!window.contains(TimeOfDay::new(10, 0)));
    }

    #[test]
    fn equal_start_and_end_never_matches() {
        let window = slot((12, 0), (12, 0));

        assert!(!window.contains(TimeOfDay::new(12, 0)));
        assert!(!window.contains(TimeOfDay::new(0, 0)));
    }

    #[test]
    fn first_active_match_wins() {
        let mut slots = default_slots();
        slots[0] = slot((20, 0), (23, 0));
        slots[0].active = false;
        slots[1] = slot((21, 0), (22, 0));
        slots[2] = slot((18, 0), (23, 59));

        let (id, matched) = first_match(&slots, TimeOfDay::new(21, 15)).unwrap();
        assert_eq!(id, 2);
        assert_eq!(matched, &slots[1]);

        assert!(first_match(&slots, TimeOfDay::new(3, 0)).is_none());
    }

    #[test]
    fn blob_keeps_c_record_layout() {
        let mut slots = default_slots();
        slots[0] = ProgramSlot {
            active: true,
            start: TimeOfDay::new(20, 15),
            end: TimeOfDay::new(6, 45),
            t0: -5,
            t100: 300,
        };

        let blob = encode_slots(&slots);

        assert_eq!(blob.len(), SLOT_COUNT * SLOT_RECORD_LEN);
        assert_eq!(&blob[..10], &[1, 20, 15, 6, 45, 0, 0xFB, 0xFF, 0x2C, 0x01]);
        assert_eq!(decode_slots(&blob), (slots, SLOT_COUNT));
    }

    #[test]
    fn short_blob_defaults_uncovered_slots() {
        let mut slots = default_slots();
        slots[0] = slot((1, 0), (2, 0));
        slots[1] = slot((3, 0), (4, 0));
        let blob = encode_slots(&slots);

        // One full record plus a torn second one.
        let (decoded, count) = decode_slots(&blob[..SLOT_RECORD_LEN + 4]);

        assert_eq!(count, 1);
        assert_eq!(decoded[0], slots[0]);
        assert_eq!(decoded[1], ProgramSlot::default());
        assert_eq!(decoded[2], ProgramSlot::default());
    }

    #[test]
    fn clamps_out_of_range_times() {
        let parsed = ProgramSlot::from_parts(true, (25, 70), (-1, 30), 40_000, -40_000);

        assert_eq!(parsed.start, TimeOfDay::new(23, 59));
        assert_eq!(parsed.end, TimeOfDay::new(0, 30));
        assert_eq!(parsed.t0, i16::MAX);
        assert_eq!(parsed.t100, i16::MIN);
    }

    #[test]
    fn time_of_day_follows_local_offset() {
        let now = FixedOffset::west_opt(6 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 5, 23, 30, 0)
            .unwrap();

        assert_eq!(TimeOfDay::from_datetime(now), TimeOfDay::new(23, 30));
        assert_eq!(slot((22, 0), (6, 0)).window_label(), "22:00-06:00");
    }
}
