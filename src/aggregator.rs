//! # Run Aggregator
//!
//! Synchronous state machine that owns the trace of one run.
//!
//! ```text
//!            start_observing            set_tracking(true)
//!   Idle ───────────────────▶ Paused ─────────────────────▶ Active
//!    ▲                          │  ◀─────────────────────     │
//!    │    stop / source failure │     set_tracking(false)     │
//!    └──────────────────────────┴─────────────────────────────┘
//! ```
//!
//! Every transition is a plain method call, so the async driver in
//! [`crate::tracker`] only has to feed it events in order. Samples are only
//! appended in the `Active` state, always to the last segment, and every
//! append produces a new [`RunSnapshot`].

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::geo_utils::haversine_distance;
use crate::{
    DistanceAccumulator, LocationError, LocationSample, Result, RunSnapshot, Trace,
    TrackerConfig, TrackerError,
};

/// Observation state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerState {
    /// Not subscribed to the location source
    Idle,
    /// Subscribed, samples are discarded
    ObservingPaused,
    /// Subscribed, samples are appended to the open segment
    ObservingActive,
}

impl TrackerState {
    pub fn is_observing(&self) -> bool {
        !matches!(self, TrackerState::Idle)
    }
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerState::Idle => write!(f, "idle"),
            TrackerState::ObservingPaused => write!(f, "observing (paused)"),
            TrackerState::ObservingActive => write!(f, "observing (tracking)"),
        }
    }
}

/// Owns the trace of one run and applies events to it.
#[derive(Debug, Clone)]
pub struct RunAggregator {
    state: TrackerState,
    trace: Arc<Trace>,
    distance: DistanceAccumulator,
    config: TrackerConfig,
    failure: Option<LocationError>,
}

impl RunAggregator {
    /// Create an idle aggregator with an empty trace.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            state: TrackerState::Idle,
            trace: Arc::new(Trace::new()),
            distance: DistanceAccumulator::new(),
            config,
            failure: None,
        }
    }

    /// Create an idle aggregator that continues an existing trace.
    pub fn with_trace(config: TrackerConfig, trace: Trace) -> Self {
        Self {
            distance: DistanceAccumulator::from_trace(&trace),
            trace: Arc::new(trace),
            ..Self::new(config)
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn trace(&self) -> &Arc<Trace> {
        &self.trace
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The source failure that last ended observation, if any.
    pub fn failure(&self) -> Option<&LocationError> {
        self.failure.as_ref()
    }

    /// Current trace and distance as an immutable value.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            trace: Arc::clone(&self.trace),
            distance_meters: self.distance.rounded_meters(),
        }
    }

    /// Idle → ObservingPaused. No segment is opened yet.
    pub fn start_observing(&mut self) -> Result<()> {
        if self.state.is_observing() {
            return Err(TrackerError::invalid_transition("start observing", self.state));
        }
        self.state = TrackerState::ObservingPaused;
        self.failure = None;
        info!("[Aggregator] Observing, {} samples retained", self.trace.sample_count());
        Ok(())
    }

    /// Enable or disable appending.
    ///
    /// Enabling while paused opens a new segment; disabling seals it. Setting
    /// the flag to its current value does nothing. Returns whether the state
    /// changed. Enabling while idle is a caller error.
    pub fn set_tracking(&mut self, tracking: bool) -> Result<bool> {
        match (self.state, tracking) {
            (TrackerState::Idle, true) => {
                Err(TrackerError::invalid_transition("enable tracking", self.state))
            }
            (TrackerState::ObservingPaused, true) => {
                Arc::make_mut(&mut self.trace).open_segment();
                self.state = TrackerState::ObservingActive;
                debug!(
                    "[Aggregator] Tracking resumed, segment {} opened",
                    self.trace.segments().len()
                );
                Ok(true)
            }
            (TrackerState::ObservingActive, false) => {
                self.state = TrackerState::ObservingPaused;
                debug!(
                    "[Aggregator] Tracking paused, segment {} sealed",
                    self.trace.segments().len()
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Any observing state → Idle. Returns false when already idle.
    pub fn stop_observing(&mut self) -> bool {
        if !self.state.is_observing() {
            return false;
        }
        self.state = TrackerState::Idle;
        info!(
            "[Aggregator] Stopped, {} samples in {} segments",
            self.trace.sample_count(),
            self.trace.segments().len()
        );
        true
    }

    /// The location source died. The trace is kept as-is.
    pub fn fail(&mut self, error: LocationError) -> bool {
        if !self.state.is_observing() {
            return false;
        }
        warn!("[Aggregator] Location source failed: {}", error);
        self.state = TrackerState::Idle;
        self.failure = Some(error);
        true
    }

    /// Apply one sample from the location source.
    ///
    /// Returns the new snapshot if the sample was appended. Samples are
    /// dropped when not tracking, when the coordinates are invalid, when the
    /// elapsed time runs backwards, or when closer than the configured spacing.
    ///
    /// The append is in place only while no snapshot of the trace is alive;
    /// otherwise the whole trace is cloned first. The live tracker's feed
    /// always keeps the latest snapshot, so there every append is an O(n)
    /// copy of the trace.
    pub fn on_sample(&mut self, sample: LocationSample) -> Option<RunSnapshot> {
        if self.state != TrackerState::ObservingActive {
            debug!("[Aggregator] Ignoring sample while {}", self.state);
            return None;
        }

        if self.config.skip_invalid_points && !sample.point.is_valid() {
            warn!(
                "[Aggregator] Dropping sample with invalid coordinates ({}, {})",
                sample.point.latitude, sample.point.longitude
            );
            return None;
        }

        let previous = self.trace.segments().last().and_then(|s| s.last()).copied();
        match previous {
            Some(prev) if sample.elapsed <= prev.elapsed => {
                warn!(
                    "[Aggregator] Dropping out-of-order sample at {:?} (previous {:?})",
                    sample.elapsed, prev.elapsed
                );
                return None;
            }
            None => {
                if let Some(last) = self.trace.last_sample() {
                    if sample.elapsed < last.elapsed {
                        warn!(
                            "[Aggregator] Dropping sample at {:?} before end of previous segment {:?}",
                            sample.elapsed, last.elapsed
                        );
                        return None;
                    }
                }
            }
            _ => {}
        }

        if let Some(prev) = previous {
            if self.config.min_point_spacing_meters > 0.0
                && haversine_distance(&prev.point, &sample.point)
                    < self.config.min_point_spacing_meters
            {
                debug!("[Aggregator] Dropping sample closer than minimum spacing");
                return None;
            }
        }

        // Active always has an open segment
        Arc::make_mut(&mut self.trace).open_segment_mut()?.push(sample);
        if let Some(prev) = previous {
            self.distance.add_pair(&prev, &sample);
        }

        Some(self.snapshot())
    }

    /// Discard the retained trace. Only allowed while idle.
    pub fn clear(&mut self) -> Result<()> {
        self.take_trace().map(|_| ())
    }

    /// Hand the trace off and start over with an empty one. Only allowed while idle.
    pub fn take_trace(&mut self) -> Result<Trace> {
        if self.state.is_observing() {
            return Err(TrackerError::invalid_transition("release the trace", self.state));
        }
        let trace = std::mem::take(&mut self.trace);
        self.distance = DistanceAccumulator::new();
        self.failure = None;
        Ok(Arc::try_unwrap(trace).unwrap_or_else(|shared| (*shared).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::total_distance_meters;
    use crate::GpsPoint;
    use std::time::Duration;

    fn sample(lat: f64, lng: f64, secs: u64) -> LocationSample {
        LocationSample::new(GpsPoint::new(lat, lng), 0.0, Duration::from_secs(secs))
    }

    fn tracking() -> RunAggregator {
        let mut agg = RunAggregator::new(TrackerConfig::default());
        agg.start_observing().unwrap();
        agg.set_tracking(true).unwrap();
        agg
    }

    #[test]
    fn test_start_observing_opens_no_segment() {
        let mut agg = RunAggregator::new(TrackerConfig::default());
        assert_eq!(agg.state(), TrackerState::Idle);

        agg.start_observing().unwrap();
        assert_eq!(agg.state(), TrackerState::ObservingPaused);
        assert!(agg.trace().segments().is_empty());
        assert_eq!(agg.snapshot().distance_meters, 0);
    }

    #[test]
    fn test_enable_tracking_while_idle_fails() {
        let mut agg = RunAggregator::new(TrackerConfig::default());
        let result = agg.set_tracking(true);
        assert!(matches!(
            result,
            Err(TrackerError::InvalidTransition {
                state: TrackerState::Idle,
                ..
            })
        ));
        assert_eq!(agg.state(), TrackerState::Idle);
        assert!(agg.trace().segments().is_empty());
    }

    #[test]
    fn test_start_observing_twice_fails() {
        let mut agg = RunAggregator::new(TrackerConfig::default());
        agg.start_observing().unwrap();
        assert!(agg.start_observing().is_err());
        assert_eq!(agg.state(), TrackerState::ObservingPaused);
    }

    #[test]
    fn test_enable_tracking_is_idempotent() {
        let mut agg = tracking();
        assert!(!agg.set_tracking(true).unwrap());
        assert_eq!(agg.trace().segments().len(), 1);
        assert_eq!(agg.state(), TrackerState::ObservingActive);
    }

    #[test]
    fn test_samples_ignored_unless_tracking() {
        let mut agg = RunAggregator::new(TrackerConfig::default());
        assert!(agg.on_sample(sample(1.0, 1.0, 0)).is_none());

        agg.start_observing().unwrap();
        assert!(agg.on_sample(sample(1.0, 1.0, 0)).is_none());
        assert!(agg.trace().is_empty());
    }

    #[test]
    fn test_append_emits_snapshot_with_distance() {
        let mut agg = tracking();
        let first = agg.on_sample(sample(1.0, 1.0, 0)).unwrap();
        assert_eq!(first.distance_meters, 0);
        assert_eq!(first.trace.segments()[0].len(), 1);

        let second = agg.on_sample(sample(2.0, 2.0, 1)).unwrap();
        assert_eq!(second.trace.segments()[0].len(), 2);
        let d = second.distance_meters as f64;
        assert!(d >= 156_900.0 * 0.97 && d <= 156_900.0 * 1.03);

        // Earlier snapshots are not affected by later appends
        assert_eq!(first.trace.sample_count(), 1);
    }

    #[test]
    fn test_append_copies_trace_only_while_snapshot_held() {
        let mut agg = tracking();
        drop(agg.on_sample(sample(1.0, 1.0, 0)));
        let before = Arc::as_ptr(agg.trace());

        drop(agg.on_sample(sample(1.001, 1.0, 1)));
        assert_eq!(Arc::as_ptr(agg.trace()), before);

        let held = agg.on_sample(sample(1.002, 1.0, 2)).unwrap();
        agg.on_sample(sample(1.003, 1.0, 3)).unwrap();
        assert_ne!(Arc::as_ptr(agg.trace()), Arc::as_ptr(&held.trace));
        assert_eq!(held.trace.sample_count(), 3);
        assert_eq!(agg.trace().sample_count(), 4);
    }

    #[test]
    fn test_pause_resume_opens_new_segment() {
        let mut agg = tracking();
        agg.on_sample(sample(1.0, 1.0, 0));
        agg.on_sample(sample(1.001, 1.0, 1));
        agg.on_sample(sample(1.002, 1.0, 2));

        assert!(agg.set_tracking(false).unwrap());
        assert!(agg.on_sample(sample(1.5, 1.5, 3)).is_none());
        assert!(agg.set_tracking(true).unwrap());

        let snap = agg.on_sample(sample(1.003, 1.0, 10)).unwrap();
        assert_eq!(snap.trace.segments().len(), 2);
        assert_eq!(snap.trace.segments()[0].len(), 3);
        assert_eq!(snap.trace.segments()[1].len(), 1);
    }

    #[test]
    fn test_pause_gap_adds_no_distance() {
        let mut agg = tracking();
        agg.on_sample(sample(1.0, 1.0, 0));
        agg.on_sample(sample(1.001, 1.0, 1));
        let before = agg.snapshot().distance_meters;

        agg.set_tracking(false).unwrap();
        agg.set_tracking(true).unwrap();
        let after = agg.on_sample(sample(2.0, 2.0, 100)).unwrap();
        assert_eq!(after.distance_meters, before);
    }

    #[test]
    fn test_snapshot_distance_matches_full_recomputation() {
        let mut agg = tracking();
        for i in 0..200u64 {
            if i % 50 == 49 {
                agg.set_tracking(false).unwrap();
                agg.set_tracking(true).unwrap();
            }
            let f = i as f64;
            let snap = agg
                .on_sample(sample(
                    51.5 + f * 0.000_3 + (f * 0.3).sin() * 0.000_1,
                    -0.12 + (f * 0.2).cos() * 0.000_2,
                    i,
                ))
                .unwrap();
            assert_eq!(snap.distance_meters, total_distance_meters(&snap.trace));
        }
        assert_eq!(agg.trace().segments().len(), 5);
    }

    #[test]
    fn test_out_of_order_samples_dropped() {
        let mut agg = tracking();
        agg.on_sample(sample(1.0, 1.0, 5)).unwrap();
        assert!(agg.on_sample(sample(1.001, 1.0, 5)).is_none());
        assert!(agg.on_sample(sample(1.001, 1.0, 4)).is_none());

        agg.set_tracking(false).unwrap();
        agg.set_tracking(true).unwrap();
        assert!(agg.on_sample(sample(1.002, 1.0, 3)).is_none());
        // Equal to the end of the previous segment is allowed
        assert!(agg.on_sample(sample(1.002, 1.0, 5)).is_some());
        assert_eq!(agg.trace().sample_count(), 2);
    }

    #[test]
    fn test_invalid_points_dropped_by_default() {
        let mut agg = tracking();
        assert!(agg.on_sample(sample(f64::NAN, 1.0, 0)).is_none());
        assert!(agg.on_sample(sample(95.0, 1.0, 1)).is_none());
        assert!(agg.trace().is_empty());
    }

    #[test]
    fn test_min_point_spacing() {
        let config = TrackerConfig {
            min_point_spacing_meters: 5.0,
            ..TrackerConfig::default()
        };
        let mut agg = RunAggregator::new(config);
        agg.start_observing().unwrap();
        agg.set_tracking(true).unwrap();

        agg.on_sample(sample(0.0, 0.0, 0)).unwrap();
        // ~1.1 m away
        assert!(agg.on_sample(sample(0.000_01, 0.0, 1)).is_none());
        // ~11 m away
        assert!(agg.on_sample(sample(0.000_1, 0.0, 2)).is_some());
    }

    #[test]
    fn test_stop_is_idempotent_and_keeps_trace() {
        let mut agg = tracking();
        agg.on_sample(sample(1.0, 1.0, 0));
        agg.on_sample(sample(1.001, 1.0, 1));

        assert!(agg.stop_observing());
        assert!(!agg.stop_observing());
        assert_eq!(agg.state(), TrackerState::Idle);
        assert_eq!(agg.trace().sample_count(), 2);
        assert!(agg.on_sample(sample(1.002, 1.0, 2)).is_none());
    }

    #[test]
    fn test_source_failure_preserves_trace() {
        let mut agg = tracking();
        agg.on_sample(sample(1.0, 1.0, 0));

        assert!(agg.fail(LocationError::PermissionRevoked));
        assert_eq!(agg.state(), TrackerState::Idle);
        assert_eq!(agg.failure(), Some(&LocationError::PermissionRevoked));
        assert_eq!(agg.trace().sample_count(), 1);
        assert!(agg.set_tracking(true).is_err());
    }

    #[test]
    fn test_restart_continues_trace_in_new_segment() {
        let mut agg = tracking();
        agg.on_sample(sample(1.0, 1.0, 0));
        agg.on_sample(sample(1.001, 1.0, 1));
        let distance = agg.snapshot().distance_meters;
        agg.stop_observing();

        let retained = Trace::clone(agg.trace());
        let mut resumed = RunAggregator::with_trace(TrackerConfig::default(), retained);
        assert_eq!(resumed.snapshot().distance_meters, distance);

        resumed.start_observing().unwrap();
        resumed.set_tracking(true).unwrap();
        resumed.on_sample(sample(1.002, 1.0, 30)).unwrap();
        assert_eq!(resumed.trace().segments().len(), 2);
    }

    #[test]
    fn test_take_trace_only_when_idle() {
        let mut agg = tracking();
        agg.on_sample(sample(1.0, 1.0, 0));
        let held = agg.snapshot();

        assert!(agg.take_trace().is_err());
        agg.stop_observing();

        let trace = agg.take_trace().unwrap();
        assert_eq!(trace.sample_count(), 1);
        assert!(agg.trace().segments().is_empty());
        assert_eq!(agg.snapshot().distance_meters, 0);
        // Snapshots handed out earlier still see the old trace
        assert_eq!(held.trace.sample_count(), 1);
    }
}
