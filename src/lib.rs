//! # Run Tracker
//!
//! Live tracking core for running activities.
//!
//! This library provides:
//! - A segment-aware run trace built from a continuous location stream
//! - Pause/resume gating through a tracking flag
//! - Distance, max speed and elevation gain metrics over any trace
//! - A broadcast feed of run snapshots for any number of subscribers
//!
//! ## Features
//!
//! - **`parallel`** - Compute the aggregate metrics passes on the rayon pool
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use run_tracker::{metrics, GpsPoint, LocationSample, Segment, Trace};
//!
//! let trace = Trace::from_segments(vec![Segment::from_samples(vec![
//!     LocationSample::new(GpsPoint::new(1.0, 1.0), 1.0, Duration::ZERO),
//!     LocationSample::new(GpsPoint::new(2.0, 2.0), 2.0, Duration::from_secs(3600)),
//! ])]);
//!
//! let distance = metrics::total_distance_meters(&trace);
//! assert!(distance > 150_000 && distance < 160_000);
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{LocationError, Result, TrackerError};

// Geographic utilities (distance, bounds, simplification)
pub mod geo_utils;

// Pure metrics over a trace
pub mod metrics;
pub use metrics::{AggregateMetrics, DistanceAccumulator, RunSummary};

// Tracker configuration
pub mod config;
pub use config::TrackerConfig;

// Synchronous run state machine
pub mod aggregator;
pub use aggregator::{RunAggregator, TrackerState};

// Location source contract
pub mod source;
pub use source::{LocationSink, LocationSource, ManualLocationSource, StreamLocationSource};

// Async live tracker
pub mod tracker;
pub use tracker::{FinishedRun, RunTracker, SnapshotSubscription};

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RunTracker"),
    );
}

/// Initialize logging. The host application owns the logger on this platform.
#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use run_tracker::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box for a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        geo_utils::compute_bounds(points)
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// One observation from the location source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub point: GpsPoint,
    /// Altitude in meters
    pub altitude: f64,
    /// Time since tracking for this run started
    pub elapsed: Duration,
}

impl LocationSample {
    pub fn new(point: GpsPoint, altitude: f64, elapsed: Duration) -> Self {
        Self {
            point,
            altitude,
            elapsed,
        }
    }
}

/// Samples collected while tracking was continuously enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    samples: Vec<LocationSample>,
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap already-collected samples, e.g. a segment restored from storage.
    pub fn from_samples(samples: Vec<LocationSample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[LocationSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first(&self) -> Option<&LocationSample> {
        self.samples.first()
    }

    pub fn last(&self) -> Option<&LocationSample> {
        self.samples.last()
    }

    /// Positions only, in order.
    pub fn points(&self) -> Vec<GpsPoint> {
        self.samples.iter().map(|s| s.point).collect()
    }

    /// Consecutive sample pairs. A segment with fewer than two samples yields none.
    pub fn pairs(&self) -> impl Iterator<Item = (&LocationSample, &LocationSample)> {
        self.samples.windows(2).map(|w| (&w[0], &w[1]))
    }

    pub(crate) fn push(&mut self, sample: LocationSample) {
        self.samples.push(sample);
    }
}

/// All segments of a run in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    segments: Vec<Segment>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True when the trace holds no samples (it may still hold empty segments).
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Every sample in chronological order, ignoring segment boundaries.
    pub fn samples(&self) -> impl Iterator<Item = &LocationSample> {
        self.segments.iter().flat_map(|s| s.samples.iter())
    }

    /// Consecutive pairs inside each segment. Never pairs across a pause.
    pub fn pairs(&self) -> impl Iterator<Item = (&LocationSample, &LocationSample)> {
        self.segments.iter().flat_map(Segment::pairs)
    }

    pub fn last_sample(&self) -> Option<&LocationSample> {
        self.segments.iter().rev().find_map(Segment::last)
    }

    pub fn bounds(&self) -> Option<Bounds> {
        geo_utils::compute_bounds(self.samples().map(|s| &s.point))
    }

    /// One simplified polyline per non-empty segment, for map previews.
    ///
    /// `tolerance` is in degrees; 0.0001 is roughly 11 meters.
    pub fn simplified_polylines(&self, tolerance: f64) -> Vec<Vec<GpsPoint>> {
        self.segments
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| geo_utils::simplify_polyline(&s.points(), tolerance))
            .collect()
    }

    pub(crate) fn open_segment(&mut self) {
        self.segments.push(Segment::new());
    }

    pub(crate) fn open_segment_mut(&mut self) -> Option<&mut Segment> {
        self.segments.last_mut()
    }
}

/// The run as published to subscribers at one point in time.
///
/// The trace is shared, never mutated after publication. While any snapshot
/// is alive the next append clones the trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSnapshot {
    pub trace: Arc<Trace>,
    /// Cumulative distance in meters at emission time
    pub distance_meters: u32,
}

impl RunSnapshot {
    /// Compute the full metric set for this snapshot's trace.
    pub fn metrics(&self) -> AggregateMetrics {
        AggregateMetrics::from_trace(&self.trace)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lat: f64, lng: f64, secs: u64) -> LocationSample {
        LocationSample::new(GpsPoint::new(lat, lng), 0.0, Duration::from_secs(secs))
    }

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_pairs_never_cross_segments() {
        let trace = Trace::from_segments(vec![
            Segment::from_samples(vec![sample(1.0, 1.0, 0), sample(1.1, 1.1, 1)]),
            Segment::from_samples(vec![sample(5.0, 5.0, 10)]),
            Segment::from_samples(vec![sample(6.0, 6.0, 20), sample(6.1, 6.1, 21)]),
        ]);

        assert_eq!(trace.sample_count(), 5);
        assert_eq!(trace.pairs().count(), 2);
        assert_eq!(trace.last_sample().unwrap().elapsed, Duration::from_secs(21));
    }

    #[test]
    fn test_trace_with_only_empty_segments_is_empty() {
        let trace = Trace::from_segments(vec![Segment::new(), Segment::new()]);
        assert!(trace.is_empty());
        assert!(trace.bounds().is_none());
        assert!(trace.last_sample().is_none());
        assert!(trace.simplified_polylines(0.0001).is_empty());
    }

    #[test]
    fn test_trace_bounds_and_center() {
        let trace = Trace::from_segments(vec![
            Segment::from_samples(vec![sample(1.0, 1.0, 0)]),
            Segment::from_samples(vec![sample(3.0, 5.0, 10)]),
        ]);
        let bounds = trace.bounds().unwrap();
        assert_eq!(bounds.center(), GpsPoint::new(2.0, 3.0));
    }

    #[test]
    fn test_trace_json_round_trip() {
        let trace = Trace::from_segments(vec![Segment::from_samples(vec![
            sample(1.0, 1.0, 0),
            sample(2.0, 2.0, 1),
        ])]);
        let json = serde_json::to_string(&trace).unwrap();
        let restored: Trace = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, trace);
    }
}
