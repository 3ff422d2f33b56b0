//! Rolling latency window and quality rating.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse rating of the average round trip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyQuality {
    /// Under 100 ms.
    Excellent,
    /// Under 300 ms.
    Good,
    /// Under 600 ms.
    Fair,
    /// 600 ms or more.
    Poor,
    /// No answered probe yet.
    #[default]
    Unknown,
}

impl LatencyQuality {
    /// Rate an average round trip.
    pub fn from_average(average: Option<Duration>) -> Self {
        match average.map(|d| d.as_millis()) {
            None => Self::Unknown,
            Some(ms) if ms < 100 => Self::Excellent,
            Some(ms) if ms < 300 => Self::Good,
            Some(ms) if ms < 600 => Self::Fair,
            Some(_) => Self::Poor,
        }
    }
}

/// One probe outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencySample {
    /// Answered after this long.
    RoundTrip(Duration),
    /// No answer within the probe timeout.
    Timeout,
}

/// Read-only view of the window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    /// Mean of answered samples in milliseconds.
    pub average_ms: Option<u64>,
    /// Most recent answered sample in milliseconds.
    pub last_ms: Option<u64>,
    /// Rating of the average.
    pub quality: LatencyQuality,
    /// Samples in the window.
    pub samples: usize,
    /// Timeout samples in the window.
    pub timeouts: usize,
}

/// The last `capacity` probe outcomes.
#[derive(Clone, Debug)]
pub struct LatencyWindow {
    samples: VecDeque<LatencySample>,
    capacity: usize,
}

impl LatencyWindow {
    /// Window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a sample, evicting the oldest when full.
    pub fn push(&mut self, sample: LatencySample) {
        if self.samples.len() == self.capacity {
            let _ = self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the answered samples.
    pub fn average(&self) -> Option<Duration> {
        let answered: Vec<Duration> = self
            .samples
            .iter()
            .filter_map(|s| match s {
                LatencySample::RoundTrip(d) => Some(*d),
                LatencySample::Timeout => None,
            })
            .collect();
        if answered.is_empty() {
            return None;
        }
        let total: Duration = answered.iter().sum();
        #[allow(clippy::cast_possible_truncation)]
        Some(total / answered.len() as u32)
    }

    /// Current snapshot.
    #[allow(clippy::cast_possible_truncation)]
    pub fn snapshot(&self) -> LatencySnapshot {
        let average = self.average();
        let last_ms = self.samples.iter().rev().find_map(|s| match s {
            LatencySample::RoundTrip(d) => Some(d.as_millis() as u64),
            LatencySample::Timeout => None,
        });
        LatencySnapshot {
            average_ms: average.map(|d| d.as_millis() as u64),
            last_ms,
            quality: LatencyQuality::from_average(average),
            samples: self.samples.len(),
            timeouts: self
                .samples
                .iter()
                .filter(|s| matches!(s, LatencySample::Timeout))
                .count(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(n: u64) -> LatencySample {
        LatencySample::RoundTrip(Duration::from_millis(n))
    }

    #[test]
    fn quality_thresholds() {
        let rate = |n: u64| LatencyQuality::from_average(Some(Duration::from_millis(n)));
        assert_eq!(rate(0), LatencyQuality::Excellent);
        assert_eq!(rate(99), LatencyQuality::Excellent);
        assert_eq!(rate(100), LatencyQuality::Good);
        assert_eq!(rate(299), LatencyQuality::Good);
        assert_eq!(rate(300), LatencyQuality::Fair);
        assert_eq!(rate(599), LatencyQuality::Fair);
        assert_eq!(rate(600), LatencyQuality::Poor);
        assert_eq!(LatencyQuality::from_average(None), LatencyQuality::Unknown);
    }

    #[test]
    fn window_keeps_last_n() {
        let mut window = LatencyWindow::new(10);
        for n in 1..=12 {
            window.push(ms(n * 10));
        }
        let snap = window.snapshot();
        assert_eq!(snap.samples, 10);
        // 30..=120 step 10
        assert_eq!(snap.average_ms, Some(75));
        assert_eq!(snap.last_ms, Some(120));
    }

    #[test]
    fn timeouts_count_but_do_not_skew_average() {
        let mut window = LatencyWindow::new(10);
        window.push(ms(200));
        window.push(LatencySample::Timeout);
        window.push(ms(400));
        let snap = window.snapshot();
        assert_eq!(snap.samples, 3);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.average_ms, Some(300));
        assert_eq!(snap.quality, LatencyQuality::Fair);
    }

    #[test]
    fn only_timeouts_is_unknown() {
        let mut window = LatencyWindow::new(3);
        window.push(LatencySample::Timeout);
        let snap = window.snapshot();
        assert_eq!(snap.quality, LatencyQuality::Unknown);
        assert_eq!(snap.average_ms, None);
        assert_eq!(snap.last_ms, None);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut window = LatencyWindow::new(0);
        window.push(ms(1));
        window.push(ms(2));
        assert_eq!(window.snapshot().samples, 1);
    }

    proptest! {
        #[test]
        fn average_stays_within_answered_range(
            samples in proptest::collection::vec(prop::option::of(0u64..5_000), 1..40),
            capacity in 1usize..16,
        ) {
            let mut window = LatencyWindow::new(capacity);
            for sample in &samples {
                window.push(sample.map_or(LatencySample::Timeout, ms));
            }
            let kept = &samples[samples.len().saturating_sub(capacity)..];
            let answered: Vec<u64> = kept.iter().flatten().copied().collect();
            let snap = window.snapshot();

            prop_assert_eq!(snap.samples, kept.len());
            prop_assert_eq!(snap.timeouts, kept.len() - answered.len());
            match snap.average_ms {
                None => prop_assert!(answered.is_empty()),
                Some(avg) => {
                    prop_assert!(avg >= *answered.iter().min().unwrap());
                    prop_assert!(avg <= *answered.iter().max().unwrap());
                }
            }
        }
    }
}
