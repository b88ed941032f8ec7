use crate::ProcessedEvent;
use std::collections::VecDeque;

/// Timestamp-ordered buffer of recent events from all boards.
///
/// Events are expected to arrive almost in time order (each board delivers in
/// order, boards are only skewed by queueing), so insertion scans from the
/// newest end and is O(1) in the common case. Events leave from the oldest
/// end only, once the newest timestamp is at least `horizon` ticks past them.
#[derive(Debug)]
pub struct SortedWindow {
    entries: VecDeque<ProcessedEvent>,
    horizon: u64,
    /// Newest timestamp that has already left the window.
    last_finalized: Option<u64>,
    late: u64,
}

impl SortedWindow {
    pub fn new(horizon: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            horizon,
            last_finalized: None,
            late: 0,
        }
    }

    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn newest(&self) -> Option<u64> {
        self.entries.back().map(|e| e.timestamp)
    }

    /// Events that arrived after a younger event had already been finalized,
    /// i.e. board skew exceeded the horizon.
    pub fn late_events(&self) -> u64 {
        self.late
    }

    /// Insert keeping timestamp order; equal timestamps keep arrival order.
    /// Returns `false` if the event is older than something already finalized.
    pub fn insert(&mut self, event: ProcessedEvent) -> bool {
        let in_order = self
            .last_finalized
            .map_or(true, |finalized| event.timestamp >= finalized);
        if !in_order {
            self.late += 1;
        }

        let pos = self
            .entries
            .iter()
            .rposition(|e| e.timestamp <= event.timestamp)
            .map_or(0, |i| i + 1);
        self.entries.insert(pos, event);
        in_order
    }

    /// Remove every event at least `horizon` ticks older than the newest one,
    /// oldest first.
    pub fn evict_expired(&mut self, mut finalize: impl FnMut(ProcessedEvent)) -> usize {
        let Some(newest) = self.newest() else {
            return 0;
        };
        let mut evicted = 0;
        while let Some(oldest) = self.entries.front() {
            if newest - oldest.timestamp < self.horizon {
                break;
            }
            if let Some(event) = self.entries.pop_front() {
                self.last_finalized = self.last_finalized.max(Some(event.timestamp));
                finalize(event);
                evicted += 1;
            }
        }
        evicted
    }

    /// Empty the window, oldest first, regardless of age.
    pub fn flush(&mut self, mut finalize: impl FnMut(ProcessedEvent)) -> usize {
        let flushed = self.entries.len();
        for event in self.entries.drain(..) {
            self.last_finalized = self.last_finalized.max(Some(event.timestamp));
            finalize(event);
        }
        flushed
    }

    pub fn timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|e| e.timestamp)
    }
}
