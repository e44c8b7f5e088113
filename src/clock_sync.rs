//! Round-trip clock synchronization against the room server.
//!
//! Each completed `TIME_SYNC_REQUEST`/`TIME_SYNC_RESPONSE` exchange yields one
//! [`ClockSample`]. The synchronizer keeps the most recent [`SAMPLE_WINDOW`]
//! samples and trusts the one with the lowest round-trip time, since a short
//! round trip bounds the offset error most tightly.

use log::debug;
use std::collections::VecDeque;

use crate::status::SyncStatus;

/// Number of samples retained in the rolling window.
pub const SAMPLE_WINDOW: usize = 6;

/// Synchronization older than this is reported as stale.
pub const DEFAULT_FRESH_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    /// Reference minus local, in milliseconds.
    pub offset_ms: f64,
    pub rtt_ms: f64,
    /// Local time the reply was received.
    pub at_ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSyncState {
    pub best_offset_ms: f64,
    pub best_rtt_ms: f64,
    pub last_sync_at: i64,
}

/// Estimate `(rtt, offset)` from the four timestamps of one exchange.
///
/// `t0` client send, `t1` server receive, `t2` server send, `t3` client
/// receive. Returns `None` if any timestamp or either result is not finite.
pub fn estimate(t0: f64, t1: f64, t2: f64, t3: f64) -> Option<(f64, f64)> {
    if ![t0, t1, t2, t3].iter().all(|v| v.is_finite()) {
        return None;
    }
    let rtt = ((t3 - t0) - (t2 - t1)).max(0.0);
    let offset = ((t1 - t0) + (t2 - t3)) / 2.0;
    if !rtt.is_finite() || !offset.is_finite() {
        return None;
    }
    Some((rtt, offset))
}

#[derive(Debug)]
pub struct ClockSynchronizer {
    samples: VecDeque<ClockSample>,
    state: Option<ClockSyncState>,
    fresh_ms: i64,
}

impl Default for ClockSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSynchronizer {
    pub fn new() -> Self {
        Self::with_freshness(DEFAULT_FRESH_MS)
    }

    pub fn with_freshness(fresh_ms: i64) -> Self {
        ClockSynchronizer {
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            state: None,
            fresh_ms,
        }
    }

    /// Append a sample, evict beyond the window and reselect the best sample.
    ///
    /// Non-finite samples are dropped without touching the window.
    /// Returns whether the sample was recorded.
    pub fn record_sample(&mut self, offset_ms: f64, rtt_ms: f64, at_ts: i64) -> bool {
        if !offset_ms.is_finite() || !rtt_ms.is_finite() {
            debug!("[Sync] Discarding non-finite sample");
            return false;
        }

        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(ClockSample { offset_ms, rtt_ms, at_ts });

        // First minimum wins on equal RTT.
        let best = self
            .samples
            .iter()
            .fold(None::<&ClockSample>, |min, next| match min {
                Some(m) if next.rtt_ms >= m.rtt_ms => Some(m),
                _ => Some(next),
            });

        if let Some(best) = best {
            self.state = Some(ClockSyncState {
                best_offset_ms: best.offset_ms,
                best_rtt_ms: best.rtt_ms,
                last_sync_at: best.at_ts,
            });
            debug!(
                "[Sync] Sample offset={:.1}ms rtt={:.1}ms -> best offset={:.1}ms rtt={:.1}ms",
                offset_ms, rtt_ms, best.offset_ms, best.rtt_ms
            );
        }
        true
    }

    /// Run the two-timestamp estimation for one exchange and record it.
    ///
    /// `t3` is the local receive time. Returns the recorded sample, or `None`
    /// if the exchange carried a non-finite timestamp or produced a
    /// non-finite estimate.
    pub fn record_exchange(&mut self, t0: f64, t1: f64, t2: f64, t3: i64) -> Option<ClockSample> {
        let Some((rtt, offset)) = estimate(t0, t1, t2, t3 as f64) else {
            debug!("[Sync] Ignoring exchange with non-finite timestamps");
            return None;
        };
        if !self.record_sample(offset, rtt, t3) {
            return None;
        }
        self.samples.back().copied()
    }

    pub fn state(&self) -> Option<ClockSyncState> {
        self.state
    }

    pub fn best_offset_ms(&self) -> f64 {
        self.state.map(|s| s.best_offset_ms).unwrap_or(0.0)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ClockSample> {
        self.samples.iter()
    }

    /// Local time shifted onto the reference clock, rounded to whole ms.
    pub fn corrected_now(&self, local_now: i64) -> i64 {
        local_now.saturating_add(self.best_offset_ms().round() as i64)
    }

    /// True while the last accepted sync is younger than the freshness window.
    pub fn is_live(&self, local_now: i64) -> bool {
        match self.state {
            Some(s) => local_now.saturating_sub(s.last_sync_at) < self.fresh_ms,
            None => false,
        }
    }

    pub fn status(&self, local_now: i64) -> SyncStatus {
        SyncStatus {
            offset_ms: self.best_offset_ms(),
            rtt_ms: self.state.map(|s| s.best_rtt_ms),
            last_sync_at: self.state.map(|s| s.last_sync_at),
            live: self.is_live(local_now),
            samples: self.samples.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_known_exchange() {
        let (rtt, offset) = estimate(1000.0, 1050.0, 1060.0, 1120.0).unwrap();
        assert_eq!(rtt, 110.0);
        assert_eq!(offset, -5.0);
    }

    #[test]
    fn test_estimate_clamps_negative_rtt() {
        // Server claims it held the request longer than the full round trip.
        let (rtt, _) = estimate(0.0, 10.0, 200.0, 100.0).unwrap();
        assert_eq!(rtt, 0.0);
    }

    #[test]
    fn test_estimate_rejects_non_finite() {
        assert!(estimate(f64::NAN, 1.0, 2.0, 3.0).is_none());
        assert!(estimate(0.0, f64::INFINITY, 2.0, 3.0).is_none());
        assert!(estimate(0.0, 1.0, f64::NEG_INFINITY, 3.0).is_none());
    }

    #[test]
    fn test_best_offset_tracks_min_rtt_in_window() {
        let mut sync = ClockSynchronizer::new();
        let samples = [
            (10.0, 80.0),
            (12.0, 40.0),
            (15.0, 90.0),
            (11.0, 60.0),
            (9.0, 70.0),
            (14.0, 55.0),
            (20.0, 100.0),
            (30.0, 120.0),
            (25.0, 45.0),
        ];

        for (i, (offset, rtt)) in samples.iter().enumerate() {
            sync.record_sample(*offset, *rtt, i as i64);

            let start = (i + 1).saturating_sub(SAMPLE_WINDOW);
            let expected = samples[start..=i]
                .iter()
                .fold(None::<(f64, f64)>, |min, s| match min {
                    Some(m) if s.1 >= m.1 => Some(m),
                    _ => Some(*s),
                })
                .unwrap();
            assert_eq!(sync.best_offset_ms(), expected.0, "after sample {}", i);
            assert_eq!(sync.state().unwrap().best_rtt_ms, expected.1);
        }
        assert_eq!(sync.sample_count(), SAMPLE_WINDOW);
    }

    #[test]
    fn test_evicted_best_sample_is_replaced() {
        let mut sync = ClockSynchronizer::new();
        sync.record_sample(-50.0, 5.0, 0);
        for i in 1..=5 {
            sync.record_sample(10.0 * i as f64, 100.0 + i as f64, i);
        }
        assert_eq!(sync.best_offset_ms(), -50.0);

        // Pushes the 5ms sample out of the window.
        sync.record_sample(70.0, 200.0, 6);
        assert_eq!(sync.best_offset_ms(), 10.0);
        assert_eq!(sync.state().unwrap().last_sync_at, 1);
    }

    #[test]
    fn test_non_finite_exchange_leaves_state_untouched() {
        let mut sync = ClockSynchronizer::new();
        sync.record_exchange(1000.0, 1050.0, 1060.0, 1120);
        let before = sync.state();

        assert!(sync.record_exchange(2000.0, f64::NAN, 2060.0, 2120).is_none());
        assert_eq!(sync.state(), before);
        assert_eq!(sync.sample_count(), 1);
        assert_eq!(sync.best_offset_ms(), -5.0);
    }

    #[test]
    fn test_overflowing_estimate_is_not_recorded() {
        let mut sync = ClockSynchronizer::new();
        sync.record_exchange(1000.0, 1050.0, 1060.0, 1120);

        // Finite timestamps whose offset sum overflows to infinity.
        assert!(estimate(0.0, 1e308, 1e308, 0.0).is_none());
        assert!(sync.record_exchange(0.0, 1e308, 1e308, 0).is_none());
        assert_eq!(sync.sample_count(), 1);
        assert_eq!(sync.best_offset_ms(), -5.0);

        assert!(!sync.record_sample(f64::INFINITY, 10.0, 5));
        assert_eq!(sync.sample_count(), 1);
    }

    #[test]
    fn test_corrected_now_saturates_on_huge_offset() {
        let mut sync = ClockSynchronizer::new();
        assert!(sync.record_sample(1e300, 1.0, 0));
        assert_eq!(sync.corrected_now(1_700_000_000_000), i64::MAX);
    }

    #[test]
    fn test_corrected_now_applies_offset() {
        let mut sync = ClockSynchronizer::new();
        assert_eq!(sync.corrected_now(5_000), 5_000);
        sync.record_sample(250.4, 20.0, 0);
        assert_eq!(sync.corrected_now(5_000), 5_250);
        sync.record_sample(-99.6, 10.0, 0);
        assert_eq!(sync.corrected_now(5_000), 4_900);
    }

    #[test]
    fn test_freshness_window() {
        let mut sync = ClockSynchronizer::new();
        assert!(!sync.is_live(0));

        sync.record_exchange(1000.0, 1050.0, 1060.0, 1120);
        assert!(sync.is_live(1120));
        assert!(sync.is_live(1120 + DEFAULT_FRESH_MS - 1));
        assert!(!sync.is_live(1120 + DEFAULT_FRESH_MS));

        let status = sync.status(1120 + DEFAULT_FRESH_MS);
        assert!(!status.live);
        assert_eq!(status.offset_ms, -5.0);
        assert_eq!(status.rtt_ms, Some(110.0));
    }
}
