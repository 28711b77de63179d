use serde::Serialize;
use std::time::{Duration, Instant};

use crate::pipeline::types::Output;

/// Collects timing statistics over a capture session's rounds.
pub struct RoundStats {
    completed: u64,
    timeouts: [u64; 3],
    total_bytes: u64,
    total_round_time: Duration,
    fastest: Option<Duration>,
    slowest: Option<Duration>,
    last: Option<Duration>,
    start_time: Instant,
}

/// Snapshot of round statistics for logging or serialisation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub completed: u64,
    pub timed_out: u64,
    pub large_timeouts: u64,
    pub small_timeouts: u64,
    pub thumbnail_timeouts: u64,
    pub rounds_per_sec: f64,
    pub mean_round_ms: f64,
    pub fastest_round_ms: Option<f64>,
    pub slowest_round_ms: Option<f64>,
    pub last_round_ms: Option<f64>,
    pub total_bytes: u64,
}

fn timeout_slot(output: Output) -> usize {
    match output {
        Output::LargeJpeg => 0,
        Output::SmallJpeg => 1,
        Output::Thumbnail => 2,
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl RoundStats {
    /// Create new stats with zeroed counters.
    pub fn new() -> Self {
        Self {
            completed: 0,
            timeouts: [0; 3],
            total_bytes: 0,
            total_round_time: Duration::ZERO,
            fastest: None,
            slowest: None,
            last: None,
            start_time: Instant::now(),
        }
    }

    /// Record a round that delivered all three outputs.
    pub fn record_round(&mut self, elapsed: Duration, bytes: usize) {
        self.completed += 1;
        self.total_bytes += bytes as u64;
        self.total_round_time += elapsed;
        self.last = Some(elapsed);
        self.fastest = Some(self.fastest.map_or(elapsed, |f| f.min(elapsed)));
        self.slowest = Some(self.slowest.map_or(elapsed, |s| s.max(elapsed)));
    }

    /// Record a round abandoned because `output` timed out.
    pub fn record_timeout(&mut self, output: Output) {
        self.timeouts[timeout_slot(output)] += 1;
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn timed_out(&self) -> u64 {
        self.timeouts.iter().sum()
    }

    /// Mean duration of completed rounds.
    pub fn mean_round(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        self.total_round_time / self.completed as u32
    }

    /// Completed rounds per second since the stats were created or reset.
    pub fn rounds_per_sec(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.completed as f64 / elapsed
    }

    /// Reset all counters.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Take a serialisable snapshot.
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            completed: self.completed,
            timed_out: self.timed_out(),
            large_timeouts: self.timeouts[0],
            small_timeouts: self.timeouts[1],
            thumbnail_timeouts: self.timeouts[2],
            rounds_per_sec: self.rounds_per_sec(),
            mean_round_ms: as_ms(self.mean_round()),
            fastest_round_ms: self.fastest.map(as_ms),
            slowest_round_ms: self.slowest.map(as_ms),
            last_round_ms: self.last.map(as_ms),
            total_bytes: self.total_bytes,
        }
    }
}

impl Default for RoundStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn initialises_with_zero_values() {
        let stats = RoundStats::new();
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.timed_out(), 0);
        assert_eq!(stats.mean_round(), Duration::ZERO);
        assert!(stats.snapshot().last_round_ms.is_none());
    }

    #[test]
    fn record_round_tracks_extremes_and_mean() {
        let mut stats = RoundStats::new();
        stats.record_round(Duration::from_millis(100), 10);
        stats.record_round(Duration::from_millis(300), 20);
        assert_eq!(stats.completed(), 2);
        assert_eq!(stats.mean_round(), Duration::from_millis(200));

        let snap = stats.snapshot();
        assert_eq!(snap.fastest_round_ms, Some(100.0));
        assert_eq!(snap.slowest_round_ms, Some(300.0));
        assert_eq!(snap.last_round_ms, Some(300.0));
        assert_eq!(snap.total_bytes, 30);
    }

    #[test]
    fn timeouts_are_counted_per_output() {
        let mut stats = RoundStats::new();
        stats.record_timeout(Output::SmallJpeg);
        stats.record_timeout(Output::SmallJpeg);
        stats.record_timeout(Output::Thumbnail);
        let snap = stats.snapshot();
        assert_eq!(snap.timed_out, 3);
        assert_eq!(snap.large_timeouts, 0);
        assert_eq!(snap.small_timeouts, 2);
        assert_eq!(snap.thumbnail_timeouts, 1);
    }

    #[test]
    fn rounds_per_sec_is_positive_after_rounds() {
        let mut stats = RoundStats::new();
        stats.record_round(Duration::from_millis(10), 1);
        thread::sleep(Duration::from_millis(20));
        assert!(stats.rounds_per_sec() > 0.0);
    }

    #[test]
    fn reset_clears_all_counters() {
        let mut stats = RoundStats::new();
        stats.record_round(Duration::from_millis(10), 1);
        stats.record_timeout(Output::LargeJpeg);
        stats.reset();
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.timed_out(), 0);
    }

    #[test]
    fn snapshot_serialises_to_camelcase() {
        let mut stats = RoundStats::new();
        stats.record_round(Duration::from_millis(50), 5000);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert!(json["meanRoundMs"].is_number());
        assert!(json["thumbnailTimeouts"].is_number());
        assert_eq!(json["totalBytes"], 5000);
    }
}
