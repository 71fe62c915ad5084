//! Per-stage latency tracking
//!
//! Named timers with call counts and an exponential moving average of the
//! call duration. Durations are reported in milliseconds.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::Serialize;

use crate::error::{CascadeError, Result};

/// Weight of the newest sample in the moving average
pub const SMOOTHING: f64 = 0.1;

/// Statistics of one named timer
#[derive(Debug, Clone)]
pub struct CallStat {
    calls: u64,
    total_ms: f64,
    last_ms: f64,
    /// Negative until the first finish
    smoothed_ms: f64,
    last_start: Instant,
}

impl CallStat {
    fn new(now: Instant) -> Self {
        Self {
            calls: 0,
            total_ms: 0.0,
            last_ms: 0.0,
            smoothed_ms: -1.0,
            last_start: now,
        }
    }

    fn record(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_start).as_secs_f64() * 1000.0;
        self.last_start = now;

        self.calls += 1;
        self.total_ms += elapsed;
        self.last_ms = elapsed;
        if self.smoothed_ms < 0.0 {
            self.smoothed_ms = elapsed;
        }
        self.smoothed_ms = (1.0 - SMOOTHING) * self.smoothed_ms + SMOOTHING * elapsed;
        elapsed
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn total_ms(&self) -> f64 {
        self.total_ms
    }

    pub fn last_ms(&self) -> f64 {
        self.last_ms
    }

    /// Moving average, or the time since the last start before any finish
    pub fn smoothed_ms(&self) -> f64 {
        self.smoothed_at(Instant::now())
    }

    fn smoothed_at(&self, now: Instant) -> f64 {
        if self.smoothed_ms < 0.0 {
            return now.saturating_duration_since(self.last_start).as_secs_f64() * 1000.0;
        }
        self.smoothed_ms
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            calls: self.calls,
            total_ms: self.total_ms,
            last_ms: self.last_ms,
            smoothed_ms: self.smoothed_ms(),
        }
    }
}

/// Point-in-time view of a timer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub calls: u64,
    pub total_ms: f64,
    pub last_ms: f64,
    pub smoothed_ms: f64,
}

pub type LatencyReport = BTreeMap<String, LatencySnapshot>;

/// Named timers driven from a single thread
#[derive(Debug, Default)]
pub struct LatencyTracker {
    timers: HashMap<String, CallStat>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) a timer, creating it on first use
    pub fn start(&mut self, name: &str) {
        self.start_at(name, Instant::now());
    }

    fn start_at(&mut self, name: &str, now: Instant) {
        self.timers
            .entry(name.to_string())
            .and_modify(|stat| stat.last_start = now)
            .or_insert_with(|| CallStat::new(now));
    }

    /// Finish a call and return its duration in milliseconds
    pub fn finish(&mut self, name: &str) -> Result<f64> {
        self.finish_at(name, Instant::now())
    }

    fn finish_at(&mut self, name: &str, now: Instant) -> Result<f64> {
        let stat = self
            .timers
            .get_mut(name)
            .ok_or_else(|| CascadeError::UnknownStage(name.to_string()))?;
        Ok(stat.record(now))
    }

    pub fn get(&self, name: &str) -> Result<&CallStat> {
        self.timers
            .get(name)
            .ok_or_else(|| CascadeError::UnknownStage(name.to_string()))
    }

    pub fn smoothed_duration(&self, name: &str) -> Result<f64> {
        Ok(self.get(name)?.smoothed_ms())
    }

    pub fn report(&self) -> LatencyReport {
        self.timers
            .iter()
            .map(|(name, stat)| (name.clone(), stat.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_finish_unknown_timer() {
        let mut tracker = LatencyTracker::new();
        assert!(matches!(
            tracker.finish("detection"),
            Err(CascadeError::UnknownStage(name)) if name == "detection"
        ));
        assert!(tracker.smoothed_duration("detection").is_err());
    }

    #[test]
    fn test_first_sample_seeds_average() {
        let mut tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.start_at("detection", t0);
        let d = tracker
            .finish_at("detection", t0 + Duration::from_millis(40))
            .unwrap();

        assert!((d - 40.0).abs() < 1e-6);
        let stat = tracker.get("detection").unwrap();
        assert_eq!(stat.calls(), 1);
        assert!((stat.smoothed_ms() - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_moving_average() {
        let mut tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.start_at("total", t0);
        tracker.finish_at("total", t0 + Duration::from_millis(10)).unwrap();
        let t1 = t0 + Duration::from_millis(100);
        tracker.start_at("total", t1);
        tracker.finish_at("total", t1 + Duration::from_millis(30)).unwrap();

        let stat = tracker.get("total").unwrap();
        assert_eq!(stat.calls(), 2);
        assert!((stat.total_ms() - 40.0).abs() < 1e-6);
        assert!((stat.last_ms() - 30.0).abs() < 1e-6);
        assert!((stat.smoothed_ms() - (0.9 * 10.0 + 0.1 * 30.0)).abs() < 1e-6);
    }

    #[test]
    fn test_finish_resets_start() {
        let mut tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.start_at("loop", t0);
        tracker.finish_at("loop", t0 + Duration::from_millis(5)).unwrap();
        let d = tracker
            .finish_at("loop", t0 + Duration::from_millis(12))
            .unwrap();
        assert!((d - 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_live_estimate_before_first_finish() {
        let mut tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.start_at("face_analytics", t0);

        let stat = tracker.get("face_analytics").unwrap();
        let live = stat.smoothed_at(t0 + Duration::from_millis(25));
        assert!((live - 25.0).abs() < 1e-6);
        assert!(tracker.smoothed_duration("face_analytics").unwrap() >= 0.0);
    }

    #[test]
    fn test_report() {
        let mut tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.start_at("a", t0);
        tracker.finish_at("a", t0 + Duration::from_millis(2)).unwrap();
        tracker.start_at("b", t0);

        let report = tracker.report();
        assert_eq!(report.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(report["a"].calls, 1);
        assert_eq!(report["b"].calls, 0);
    }
}
