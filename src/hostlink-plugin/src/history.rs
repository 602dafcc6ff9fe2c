//! Per-plugin round-trip accounting.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

/// One delivered envelope. `end` is absent when no response arrived in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub target: Option<String>,
    pub signature: String,
    pub start: SystemTime,
    pub end: Option<SystemTime>,
}

impl HistoryEntry {
    pub fn round_trip(&self) -> Option<Duration> {
        let end = self.end?;
        Some(end.duration_since(self.start).unwrap_or_default())
    }

    pub fn is_timeout(&self) -> bool {
        self.end.is_none()
    }
}

#[derive(Debug, Default)]
struct Stats {
    entries: VecDeque<HistoryEntry>,
    average: Duration,
    worst: Duration,
    worst_signature: Option<String>,
}

/// Rolling latency statistics.
///
/// The aggregates fold in every completed round trip ever recorded; `capacity` only
/// bounds how many raw entries are retained for inspection.
#[derive(Debug)]
pub struct CommunicationHistory {
    capacity: usize,
    stats: Mutex<Stats>,
}

impl CommunicationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            stats: Mutex::new(Stats::default()),
        }
    }

    pub fn record(
        &self,
        target: Option<String>,
        signature: impl Into<String>,
        start: SystemTime,
        end: Option<SystemTime>,
    ) {
        let entry = HistoryEntry {
            target,
            signature: signature.into(),
            start,
            end,
        };
        let mut stats = self.stats();
        if let Some(rtt) = entry.round_trip() {
            stats.average = if stats.average.is_zero() {
                rtt
            } else {
                (stats.average + rtt) / 2
            };
            if rtt > stats.worst {
                stats.worst = rtt;
                stats.worst_signature = Some(entry.signature.clone());
            }
        }
        if stats.entries.len() == self.capacity {
            stats.entries.pop_front();
        }
        stats.entries.push_back(entry);
    }

    pub fn average(&self) -> Duration {
        self.stats().average
    }

    pub fn worst(&self) -> Duration {
        self.stats().worst
    }

    pub fn worst_signature(&self) -> Option<String> {
        self.stats().worst_signature.clone()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.stats().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.stats().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.stats() = Stats::default();
    }

    fn stats(&self) -> MutexGuard<'_, Stats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CommunicationHistory {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(history: &CommunicationHistory, signature: &str, millis: u64) {
        let start = SystemTime::now();
        history.record(
            Some("device".to_string()),
            signature,
            start,
            Some(start + Duration::from_millis(millis)),
        );
    }

    #[test]
    fn average_is_two_point_rolling() {
        let history = CommunicationHistory::default();
        round_trip(&history, "a", 100);
        round_trip(&history, "b", 300);
        assert_eq!(history.average(), Duration::from_millis(200));
        round_trip(&history, "c", 10);
        assert_eq!(history.average(), Duration::from_millis(105));
    }

    #[test]
    fn worst_tracks_signature_only_when_exceeded() {
        let history = CommunicationHistory::default();
        round_trip(&history, "slow", 300);
        round_trip(&history, "tie", 300);
        round_trip(&history, "fast", 5);
        assert_eq!(history.worst(), Duration::from_millis(300));
        assert_eq!(history.worst_signature().as_deref(), Some("slow"));
    }

    #[test]
    fn timeouts_are_kept_but_not_aggregated() {
        let history = CommunicationHistory::default();
        round_trip(&history, "ok", 50);
        history.record(None, "lost", SystemTime::now(), None);
        assert_eq!(history.len(), 2);
        assert!(history.entries()[1].is_timeout());
        assert_eq!(history.average(), Duration::from_millis(50));
        assert_eq!(history.worst_signature().as_deref(), Some("ok"));
    }

    #[test]
    fn capacity_bounds_entries_not_aggregates() {
        let history = CommunicationHistory::new(2);
        round_trip(&history, "first", 400);
        round_trip(&history, "second", 10);
        round_trip(&history, "third", 10);
        let signatures: Vec<_> = history.entries().into_iter().map(|e| e.signature).collect();
        assert_eq!(signatures, vec!["second", "third"]);
        assert_eq!(history.worst_signature().as_deref(), Some("first"));
    }

    #[test]
    fn clear_resets_everything() {
        let history = CommunicationHistory::default();
        round_trip(&history, "x", 20);
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.average(), Duration::ZERO);
        assert_eq!(history.worst_signature(), None);
    }
}
