//! Deadline-ordered one-shot timers for actor loops.

use tokio::time::Instant;

/// Handle of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

/// A small timer list keyed by absolute deadlines.
///
/// Timers are one-shot: [`expired`](Self::expired) removes what it returns, and the owner
/// re-inserts recurring work with its next deadline. [`next`](Self::next) yields the
/// soonest deadline for use as the wait timeout of a select loop.
#[derive(Debug)]
pub(crate) struct FrameTimer<K> {
    entries: Vec<(TimerId, Instant, K)>,
    next_id: u64,
}

impl<K> Default for FrameTimer<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<K> FrameTimer<K> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules `data` at `deadline`.
    pub(crate) fn insert(&mut self, deadline: Instant, data: K) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, deadline, data));
        id
    }

    /// Moves a timer. Returns `false` if it no longer exists.
    pub(crate) fn update(&mut self, id: TimerId, deadline: Instant) -> bool {
        match self.entries.iter_mut().find(|(i, _, _)| *i == id) {
            Some(entry) => {
                entry.1 = deadline;
                true
            }
            None => false,
        }
    }

    /// Cancels a timer. Returns `false` if it no longer exists.
    pub(crate) fn remove(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(i, _, _)| *i != id);
        self.entries.len() != before
    }

    /// Soonest deadline, or `None` when nothing is scheduled.
    pub(crate) fn next(&self) -> Option<Instant> {
        self.entries.iter().map(|(_, deadline, _)| *deadline).min()
    }

    /// Removes and returns every timer due at `now`, earliest first.
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<(TimerId, Instant, K)> {
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].1 <= now {
                due.push(self.entries.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|(_, deadline, _)| *deadline);
        due
    }
}
