use std::collections::VecDeque;

use time::{Duration, OffsetDateTime};

use crate::models::Reading;

/// Recent readings of one drone in arrival order
#[derive(Debug, Default)]
pub struct SlidingWindow {
    entries: VecDeque<(OffsetDateTime, Reading)>,
}

impl SlidingWindow {
    /// Append a reading and evict expired entries from the front
    ///
    /// Only the front is inspected: an out-of-order entry sitting behind a
    /// newer one survives until everything ahead of it has expired.
    pub fn insert(&mut self, ts: OffsetDateTime, reading: Reading, horizon: Duration) {
        self.entries.push_back((ts, reading));
        let cutoff = ts - horizon;
        while self
            .entries
            .front()
            .map_or(false, |(entry_ts, _)| *entry_ts < cutoff)
        {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter().map(|(_, reading)| reading)
    }
}
