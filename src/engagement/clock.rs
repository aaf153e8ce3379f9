//! Hour-slot arithmetic for the availability buckets.
//!
//! Timestamps are always stored in UTC. A user's buckets are indexed by the
//! hour of day in that user's fixed UTC offset, so all bucket math goes
//! through a [`LocalClock`].

use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};

pub const HOURS_PER_DAY: usize = 24;

/// Largest offset in use anywhere (UTC+14 / UTC-12 rounded up).
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalClock {
    offset: FixedOffset,
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl LocalClock {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Out-of-range offsets are clamped to ±14h.
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let minutes = minutes.clamp(-MAX_OFFSET_MINUTES, MAX_OFFSET_MINUTES);
        FixedOffset::east_opt(minutes * 60).map_or_else(Self::utc, |offset| Self { offset })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    fn local(&self, ts: DateTime<Utc>) -> DateTime<FixedOffset> {
        ts.with_timezone(&self.offset)
    }

    /// Bucket index (0..24) of `ts`.
    pub fn hour_of(&self, ts: DateTime<Utc>) -> usize {
        self.local(ts).hour() as usize
    }

    /// Start of the local hour containing `ts`.
    pub fn truncate_to_hour(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.local(ts)
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .map_or(ts, |t| t.with_timezone(&Utc))
    }

    /// Start of the local day containing `ts`.
    pub fn start_of_day(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let hour = self.truncate_to_hour(ts);
        self.local(hour)
            .with_hour(0)
            .map_or(hour, |t| t.with_timezone(&Utc))
    }

    /// Hour slots from the slot containing `from` through the slot containing
    /// `to`, both inclusive. Empty when `to` precedes `from`'s slot.
    pub fn hour_slots(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = DateTime<Utc>> {
        let start = self.truncate_to_hour(from);
        let end = self.truncate_to_hour(to);
        std::iter::successors(Some(start), |slot| slot.checked_add_signed(Duration::hours(1)))
            .take_while(move |slot| *slot <= end)
    }
}
