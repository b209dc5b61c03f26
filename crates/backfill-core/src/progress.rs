//! Stability-based completion detection for target document counts.
//!
//! A [`ProgressTracker`] polls one index on a fixed interval. When the last
//! K samples are equal and nonzero the count is declared stable; the caller
//! acknowledges to mark it done. Running out of ticks first yields
//! [`TrackerState::TimedOut`], a soft outcome the caller escalates or not.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Ticker;
use crate::cluster::{ClusterClient, ClusterFuture, ClusterRole};
use crate::error::{ClusterError, Error, Result};

/// Rates kept for smoothing.
pub const RATE_WINDOW: usize = 5;

/// Tracker timing and thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub interval: Duration,
    /// K: equal nonzero samples in a row required for stability.
    pub stability_samples: usize,
    pub max_ticks: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stability_samples: 3,
            max_ticks: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Stability detection
// ---------------------------------------------------------------------------

/// Counts how many equal nonzero samples arrived in a row.
#[derive(Debug, Clone)]
pub struct StabilityDetector {
    required: usize,
    last: Option<u64>,
    streak: usize,
}

impl StabilityDetector {
    #[must_use]
    pub fn new(required: usize) -> Self {
        Self {
            required: required.max(1),
            last: None,
            streak: 0,
        }
    }

    /// Feed one sample. Returns true once the last K samples are equal and
    /// nonzero.
    pub fn observe(&mut self, count: u64) -> bool {
        self.streak = match self.last {
            _ if count == 0 => 0,
            Some(prev) if prev == count => self.streak.saturating_add(1),
            _ => 1,
        };
        self.last = Some(count);
        self.is_stable()
    }

    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.streak >= self.required
    }

    #[must_use]
    pub fn streak(&self) -> usize {
        self.streak
    }

    #[must_use]
    pub fn required(&self) -> usize {
        self.required
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.streak = 0;
    }
}

// ---------------------------------------------------------------------------
// Samples and metrics
// ---------------------------------------------------------------------------

/// One observation of an index's document count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub index: String,
    pub observed_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Derived progress figures for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    pub observed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    /// Documents per second since the previous tick.
    pub rate: f64,
    /// Mean of the last [`RATE_WINDOW`] positive rates.
    pub smoothed_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
}

impl ProgressMetrics {
    #[must_use]
    pub fn eta(&self) -> Option<Duration> {
        self.eta_secs.map(Duration::from_secs)
    }
}

/// Rolling rate window feeding [`ProgressMetrics`].
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    rates: VecDeque<f64>,
    last: Option<(u64, Duration)>,
}

impl RateEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` observed at `elapsed` and derive metrics.
    pub fn record(&mut self, count: u64, elapsed: Duration, expected: Option<u64>) -> ProgressMetrics {
        let rate = match self.last {
            Some((prev_count, prev_at)) if elapsed > prev_at => {
                let secs = (elapsed - prev_at).as_secs_f64();
                count.saturating_sub(prev_count) as f64 / secs
            }
            _ => 0.0,
        };
        self.last = Some((count, elapsed));
        if rate > 0.0 {
            if self.rates.len() == RATE_WINDOW {
                self.rates.pop_front();
            }
            self.rates.push_back(rate);
        }

        let smoothed_rate = if self.rates.is_empty() {
            0.0
        } else {
            self.rates.iter().sum::<f64>() / self.rates.len() as f64
        };
        let percent = expected
            .filter(|&want| want > 0)
            .map(|want| (count as f64 / want as f64 * 100.0).min(100.0));
        let remaining = expected.map(|want| want.saturating_sub(count));
        let eta_secs = match remaining {
            Some(0) => Some(0),
            Some(left) if smoothed_rate > 0.0 => Some((left as f64 / smoothed_rate).ceil() as u64),
            _ => None,
        };

        ProgressMetrics {
            observed: count,
            expected,
            percent,
            rate,
            smoothed_rate,
            remaining,
            eta_secs,
        }
    }
}

/// Render a duration as `45s`, `2m 5s`, or `1h 3m`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

// ---------------------------------------------------------------------------
// Count probes
// ---------------------------------------------------------------------------

/// Where the tracker reads counts from.
pub trait CountProbe: Send + Sync {
    fn count(&self, index: &str) -> ClusterFuture<'_, u64>;
}

/// Reads counts from one side of a [`ClusterClient`].
pub struct ClusterCountProbe {
    client: Arc<dyn ClusterClient>,
    role: ClusterRole,
    attempts: u32,
    delay_ms: u64,
}

impl fmt::Debug for ClusterCountProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCountProbe")
            .field("role", &self.role)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl ClusterCountProbe {
    /// Single-attempt probe; the tracker does its own polling.
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, role: ClusterRole) -> Self {
        Self {
            client,
            role,
            attempts: 1,
            delay_ms: 0,
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.attempts = attempts.max(1);
        self.delay_ms = delay_ms;
        self
    }
}

impl CountProbe for ClusterCountProbe {
    fn count(&self, index: &str) -> ClusterFuture<'_, u64> {
        let index = index.to_string();
        Box::pin(async move {
            self.client
                .get_doc_count(self.role, &index, self.attempts, self.delay_ms)
                .await
        })
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Polling,
    Stable,
    Done,
    TimedOut,
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Polling => "polling",
            Self::Stable => "stable",
            Self::Done => "done",
            Self::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Result of one tracking run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerOutcome {
    pub index: String,
    /// `Stable` or `TimedOut`.
    pub state: TrackerState,
    pub ticks: u32,
    pub final_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ProgressMetrics>,
    pub samples: Vec<ProgressSample>,
}

impl TrackerOutcome {
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.state == TrackerState::Stable
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.state == TrackerState::TimedOut
    }

    /// Stable, but at a count other than the expected one.
    #[must_use]
    pub fn mismatched(&self) -> bool {
        self.is_stable() && self.expected_count.is_some_and(|want| want != self.final_count)
    }
}

/// Polls one index until its count stabilizes or ticks run out.
pub struct ProgressTracker {
    index: String,
    probe: Arc<dyn CountProbe>,
    config: TrackerConfig,
    expected_count: Option<u64>,
    state: TrackerState,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProgressTracker {
    #[must_use]
    pub fn new(index: impl Into<String>, probe: Arc<dyn CountProbe>, config: TrackerConfig) -> Self {
        Self {
            index: index.into(),
            probe,
            config,
            expected_count: None,
            state: TrackerState::Polling,
        }
    }

    #[must_use]
    pub fn with_expected_count(mut self, expected: u64) -> Self {
        self.expected_count = Some(expected);
        self
    }

    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Move a stable tracker to `Done`. Returns false in any other state.
    pub fn acknowledge(&mut self) -> bool {
        if self.state == TrackerState::Stable {
            self.state = TrackerState::Done;
            info!(index = %self.index, "Convergence acknowledged");
            true
        } else {
            false
        }
    }

    async fn observe(&self) -> Result<u64> {
        match self.probe.count(&self.index).await {
            Err(Error::Cluster(ClusterError::IndexNotFound(_))) => {
                debug!(index = %self.index, "Index not created yet, counting as empty");
                Ok(0)
            }
            other => other,
        }
    }

    /// Poll until stable or out of ticks.
    ///
    /// Count probe failures other than a missing index are returned as
    /// errors; running out of ticks is not an error.
    pub async fn run(&mut self, ticker: &mut dyn Ticker) -> Result<TrackerOutcome> {
        self.state = TrackerState::Polling;
        let mut detector = StabilityDetector::new(self.config.stability_samples);
        let mut rates = RateEstimator::new();
        let mut samples = Vec::new();
        let mut metrics = None;
        let mut last_count = 0;
        let mut ticks = 0;
        let max_ticks = self.config.max_ticks.max(1);

        while ticks < max_ticks {
            if ticks > 0 {
                ticker.wait(self.config.interval).await;
            }
            ticks += 1;

            let count = self.observe().await?;
            last_count = count;
            samples.push(ProgressSample {
                index: self.index.clone(),
                observed_count: count,
                timestamp: Utc::now(),
            });
            let tick_metrics = rates.record(count, ticker.elapsed(), self.expected_count);

            if let Some(want) = self.expected_count {
                if count > want {
                    warn!(
                        index = %self.index,
                        count,
                        expected = want,
                        "Target count exceeds expectation"
                    );
                }
            }

            let stable = detector.observe(count);
            debug!(
                index = %self.index,
                tick = ticks,
                count,
                streak = detector.streak(),
                rate = tick_metrics.smoothed_rate,
                eta = ?tick_metrics.eta().map(format_duration),
                "Progress tick"
            );
            metrics = Some(tick_metrics);

            if stable {
                self.state = TrackerState::Stable;
                info!(index = %self.index, count, ticks, "Document count stable");
                break;
            }
        }

        if self.state != TrackerState::Stable {
            self.state = TrackerState::TimedOut;
            warn!(
                index = %self.index,
                count = last_count,
                ticks,
                waited = %format_duration(ticker.elapsed()),
                "Document count did not stabilize"
            );
        }

        Ok(TrackerOutcome {
            index: self.index.clone(),
            state: self.state,
            ticks,
            final_count: last_count,
            expected_count: self.expected_count,
            metrics,
            samples,
        })
    }
}

/// Track several indices one after another.
///
/// `expected` supplies the optional expected count per index.
pub async fn track_indices(
    indices: &[String],
    expected: &BTreeMap<String, u64>,
    probe: Arc<dyn CountProbe>,
    config: &TrackerConfig,
    ticker: &mut dyn Ticker,
) -> Result<BTreeMap<String, TrackerOutcome>> {
    let mut outcomes = BTreeMap::new();
    for index in indices {
        let mut tracker = ProgressTracker::new(index.clone(), Arc::clone(&probe), config.clone());
        if let Some(&want) = expected.get(index) {
            tracker = tracker.with_expected_count(want);
        }
        let outcome = tracker.run(ticker).await?;
        if outcome.is_stable() {
            tracker.acknowledge();
        }
        outcomes.insert(index.clone(), outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTicker;
    use std::sync::Mutex;

    /// Replays a fixed count sequence, repeating the last value.
    struct ScriptedProbe {
        counts: Mutex<VecDeque<u64>>,
        last: Mutex<u64>,
    }

    impl ScriptedProbe {
        fn new(counts: impl IntoIterator<Item = u64>) -> Arc<Self> {
            Arc::new(Self {
                counts: Mutex::new(counts.into_iter().collect()),
                last: Mutex::new(0),
            })
        }
    }

    impl CountProbe for ScriptedProbe {
        fn count(&self, _index: &str) -> ClusterFuture<'_, u64> {
            let next = self.counts.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = next {
                *last = next;
            }
            let value = *last;
            Box::pin(async move { Ok(value) })
        }
    }

    fn config(k: usize, max_ticks: u32) -> TrackerConfig {
        TrackerConfig {
            interval: Duration::from_secs(30),
            stability_samples: k,
            max_ticks,
        }
    }

    #[test]
    fn three_equal_samples_are_stable() {
        let mut detector = StabilityDetector::new(3);
        assert!(!detector.observe(5));
        assert!(!detector.observe(5));
        assert!(detector.observe(5));
    }

    #[test]
    fn change_resets_streak() {
        let mut detector = StabilityDetector::new(3);
        detector.observe(5);
        detector.observe(6);
        assert!(!detector.observe(6));
        assert_eq!(detector.streak(), 2);
    }

    #[test]
    fn zero_is_never_stable() {
        let mut detector = StabilityDetector::new(2);
        for _ in 0..10 {
            assert!(!detector.observe(0));
        }
        assert_eq!(detector.streak(), 0);
    }

    #[test]
    fn zero_requirement_is_clamped() {
        let detector = StabilityDetector::new(0);
        assert_eq!(detector.required(), 1);
    }

    #[test]
    fn format_duration_buckets() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3780)), "1h 3m");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn rate_smoothing_uses_last_five_positive_rates() {
        let mut rates = RateEstimator::new();
        rates.record(0, Duration::ZERO, Some(1000));
        let mut count = 0;
        for step in 1..=7u64 {
            count += step * 10;
            rates.record(count, Duration::from_secs(step), Some(1000));
        }
        // Rates were 10..=70; the window holds 30..=70.
        let metrics = rates.record(count, Duration::from_secs(8), Some(1000));
        assert!((metrics.smoothed_rate - 50.0).abs() < 1e-9);
        assert_eq!(metrics.rate, 0.0);
        assert_eq!(metrics.remaining, Some(1000 - 280));
        assert_eq!(metrics.eta_secs, Some(15));
        assert!((metrics.percent.unwrap() - 28.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stable_after_k_equal_polls() {
        let probe = ScriptedProbe::new([10, 40, 60, 60, 60]);
        let mut tracker = ProgressTracker::new("idx", probe, config(3, 30));
        let mut ticker = ManualTicker::new();

        let outcome = tracker.run(&mut ticker).await.unwrap();
        assert_eq!(outcome.state, TrackerState::Stable);
        assert_eq!(outcome.ticks, 5);
        assert_eq!(outcome.final_count, 60);
        assert_eq!(outcome.samples.len(), 5);
        assert_eq!(ticker.waits(), 4);

        assert!(tracker.acknowledge());
        assert_eq!(tracker.state(), TrackerState::Done);
        assert!(!tracker.acknowledge());
    }

    #[tokio::test]
    async fn changing_counts_time_out_softly() {
        let probe = ScriptedProbe::new(1..=30);
        let mut tracker = ProgressTracker::new("idx", probe, config(3, 30));
        let mut ticker = ManualTicker::new();

        let outcome = tracker.run(&mut ticker).await.unwrap();
        assert_eq!(outcome.state, TrackerState::TimedOut);
        assert!(!outcome.is_stable());
        assert_eq!(outcome.ticks, 30);
        assert_eq!(ticker.elapsed(), Duration::from_secs(29 * 30));
        assert!(!tracker.acknowledge());
    }

    #[tokio::test]
    async fn stable_at_wrong_count_is_flagged() {
        let probe = ScriptedProbe::new([7, 7, 7]);
        let mut tracker = ProgressTracker::new("idx", probe, config(3, 30)).with_expected_count(9);
        let outcome = tracker.run(&mut ManualTicker::new()).await.unwrap();
        assert!(outcome.is_stable());
        assert!(outcome.mismatched());
    }

    #[tokio::test]
    async fn track_indices_reports_each_index() {
        let probe = ScriptedProbe::new([3, 3, 3]);
        let mut expected = BTreeMap::new();
        expected.insert("a".to_string(), 3);
        let indices = vec!["a".to_string(), "b".to_string()];
        let outcomes = track_indices(&indices, &expected, probe, &config(2, 5), &mut ManualTicker::new())
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes["a"].is_stable());
        assert!(!outcomes["a"].mismatched());
        assert!(outcomes["b"].is_stable());
        assert_eq!(outcomes["b"].expected_count, None);
    }

    #[tokio::test]
    async fn missing_index_counts_as_empty() {
        use crate::cluster::MemoryCluster;
        let cluster = Arc::new(MemoryCluster::new());
        let probe = Arc::new(ClusterCountProbe::new(cluster, ClusterRole::Target));
        let mut tracker = ProgressTracker::new("absent", probe, config(2, 3));
        let outcome = tracker.run(&mut ManualTicker::new()).await.unwrap();
        assert!(outcome.timed_out());
        assert_eq!(outcome.final_count, 0);
    }
}
