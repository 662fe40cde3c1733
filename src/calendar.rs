//! The fixed booking day: ten one-hour blocks from 08:00 to 18:00.

use chrono::{NaiveTime, TimeDelta, Timelike};

use crate::model::Slot;

/// First bookable hour.
pub const OPENING_HOUR: u32 = 8;

/// Number of one-hour blocks per day. The last block starts at 17:00.
pub const SLOTS_PER_DAY: usize = 10;

/// Length of every block.
pub fn slot_length() -> TimeDelta {
    TimeDelta::hours(1)
}

fn on_the_hour(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or_default()
}

/// End of the block starting at `start`.
pub fn slot_end(start: NaiveTime) -> NaiveTime {
    start + slot_length()
}

/// The ordered slots of a day. Operating hours do not depend on the date,
/// so there is nothing to pass in.
pub fn day_slots() -> Vec<Slot> {
    (0..SLOTS_PER_DAY as u32)
        .map(|i| {
            let start = on_the_hour(OPENING_HOUR + i);
            Slot { start, end: slot_end(start) }
        })
        .collect()
}

/// True if `t` is the start of one of the day's blocks.
pub fn is_slot_start(t: NaiveTime) -> bool {
    let closing = OPENING_HOUR + SLOTS_PER_DAY as u32;
    t.minute() == 0
        && t.second() == 0
        && t.nanosecond() == 0
        && (OPENING_HOUR..closing).contains(&t.hour())
}
