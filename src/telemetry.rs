//! Progress telemetry: samples pushed by workers and the ETA derived from them.
//!
//! Samples are advisory. Losing one only makes the estimate less accurate.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Count carried by a telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleCount {
    /// Items the source still has to process (a snapshot, not a delta).
    Remaining(u64),
    /// Items processed since the previous sample (a delta).
    Done(u64),
}

/// One progress report from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub source: String,
    pub count: SampleCount,
}

impl TelemetrySample {
    pub fn remaining(source: impl Into<String>, remaining: u64) -> Self {
        Self {
            source: source.into(),
            count: SampleCount::Remaining(remaining),
        }
    }

    pub fn done(source: impl Into<String>, done: u64) -> Self {
        Self {
            source: source.into(),
            count: SampleCount::Done(done),
        }
    }
}

/// Sliding-window average of the time between samples.
#[derive(Debug, Clone)]
struct EtaTracker {
    /// Recent (elapsed delta, items completed in that delta) pairs
    window: VecDeque<(Duration, u64)>,
    window_size: usize,
    last_at: Duration,
}

impl EtaTracker {
    fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            last_at: Duration::ZERO,
        }
    }

    /// Record `items` completed at job time `at`.
    fn record(&mut self, at: Duration, items: u64) {
        if items == 0 {
            return;
        }
        let delta = at.saturating_sub(self.last_at);
        self.last_at = self.last_at.max(at);
        self.window.push_back((delta, items));
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }
    }

    /// Average time per item over the window.
    fn time_per_item(&self) -> Option<Duration> {
        let items: u64 = self.window.iter().map(|(_, n)| n).sum();
        if items == 0 {
            return None;
        }
        let total: Duration = self.window.iter().map(|(d, _)| *d).sum();
        Some(total.div_f64(items as f64))
    }
}

/// Point-in-time view of job progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub done: u64,
    /// Items still outstanding, when a total is known.
    pub remaining: Option<u64>,
    /// Fraction complete in percent, when a total is known.
    pub percent: Option<f64>,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub samples: u64,
}

impl ProgressSnapshot {
    /// Human-readable ETA, e.g. "1m 05s".
    pub fn eta_string(&self) -> String {
        match self.eta {
            Some(eta) => format_duration(eta),
            None => "calculating...".to_string(),
        }
    }
}

/// Format a duration as `"1h 02m"`, `"3m 05s"` or `"42s"`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Aggregates telemetry samples into a progress estimate.
///
/// Two kinds of sources are tracked:
/// - `Remaining` sources: the largest count seen is taken as that source's
///   total; the latest count is what is left.
/// - `Done` sources: deltas are summed and compared against an optional
///   expected total.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    totals: HashMap<String, u64>,
    remaining: HashMap<String, u64>,
    done_deltas: u64,
    expected_total: Option<u64>,
    samples: u64,
    eta: EtaTracker,
}

impl ProgressTracker {
    pub fn new(expected_total: Option<u64>) -> Self {
        Self {
            totals: HashMap::new(),
            remaining: HashMap::new(),
            done_deltas: 0,
            expected_total,
            samples: 0,
            eta: EtaTracker::new(32),
        }
    }

    /// Fold one sample in, observed at job time `at`.
    pub fn record(&mut self, sample: &TelemetrySample, at: Duration) {
        self.samples += 1;
        match sample.count {
            SampleCount::Done(n) => {
                self.done_deltas += n;
                self.eta.record(at, n);
            }
            SampleCount::Remaining(left) => {
                let total = self.totals.entry(sample.source.clone()).or_insert(left);
                *total = (*total).max(left);
                let previous = self.remaining.insert(sample.source.clone(), left);
                let progressed = previous.map_or(*total - left, |p| p.saturating_sub(left));
                self.eta.record(at, progressed);
            }
        }
    }

    fn done(&self) -> u64 {
        let from_remaining: u64 = self
            .totals
            .iter()
            .map(|(source, total)| total - self.remaining.get(source).copied().unwrap_or(*total))
            .sum();
        from_remaining + self.done_deltas
    }

    fn total(&self) -> Option<u64> {
        let remaining_total: u64 = self.totals.values().sum();
        match self.expected_total {
            Some(expected) => Some(expected + remaining_total),
            None if self.done_deltas == 0 && !self.totals.is_empty() => Some(remaining_total),
            None => None,
        }
    }

    /// Progress as of job time `elapsed`.
    pub fn snapshot_at(&self, elapsed: Duration) -> ProgressSnapshot {
        let done = self.done();
        let total = self.total();
        let remaining = total.map(|t| t.saturating_sub(done));
        let percent = total.map(|t| {
            if t == 0 {
                100.0
            } else {
                (done.min(t) as f64 / t as f64) * 100.0
            }
        });
        let eta = remaining.and_then(|left| {
            if left == 0 {
                return Some(Duration::ZERO);
            }
            self.eta
                .time_per_item()
                .map(|per_item| per_item.mul_f64(left as f64))
        });
        ProgressSnapshot {
            done,
            remaining,
            percent,
            eta,
            elapsed,
            samples: self.samples,
        }
    }
}
