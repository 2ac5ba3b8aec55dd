//! Run metrics: distance, speed and elevation gain over a trace.
//!
//! Everything here is a pure function of a [`Trace`] value. It works the same
//! on a snapshot of a live run, a finished run handed off to persistence, or a
//! trace restored from storage.
//!
//! Consecutive sample pairs are only ever taken inside a segment: a pause is
//! never counted as movement, climbing or speed.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use run_tracker::metrics::{max_speed_kmh, total_elevation_gain_meters};
//! use run_tracker::{GpsPoint, LocationSample, Segment, Trace};
//!
//! let trace = Trace::from_segments(vec![Segment::from_samples(vec![
//!     LocationSample::new(GpsPoint::new(51.5000, -0.12), 10.0, Duration::from_secs(0)),
//!     LocationSample::new(GpsPoint::new(51.5009, -0.12), 14.0, Duration::from_secs(30)),
//! ])]);
//!
//! assert_eq!(total_elevation_gain_meters(&trace), 4);
//! assert!(max_speed_kmh(&trace) > 11.0);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geo_utils::{duration_hours, haversine_distance};
use crate::{LocationSample, Trace};

/// Running sum of great-circle distance between consecutive samples.
///
/// [`total_distance_meters`] folds a whole trace through this same
/// accumulator, so a sum built one append at a time in trace order is
/// bit-for-bit the full recomputation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DistanceAccumulator {
    meters: f64,
}

impl DistanceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold every in-segment pair of a trace.
    pub fn from_trace(trace: &Trace) -> Self {
        let mut acc = Self::new();
        for (a, b) in trace.pairs() {
            acc.add_pair(a, b);
        }
        acc
    }

    /// Add the distance between two consecutive samples and return it.
    pub fn add_pair(&mut self, from: &LocationSample, to: &LocationSample) -> f64 {
        let delta = haversine_distance(&from.point, &to.point);
        self.meters += delta;
        delta
    }

    /// Unrounded total in meters.
    pub fn meters(&self) -> f64 {
        self.meters
    }

    /// Total rounded to whole meters.
    pub fn rounded_meters(&self) -> u32 {
        round_meters(self.meters)
    }
}

fn round_meters(meters: f64) -> u32 {
    meters.round() as u32
}

/// Total distance in meters, rounded once over the whole trace.
pub fn total_distance_meters(trace: &Trace) -> u32 {
    DistanceAccumulator::from_trace(trace).rounded_meters()
}

/// Speed between two samples in km/h.
///
/// Two samples with the same elapsed time give 0 rather than infinity.
pub fn pair_speed_kmh(from: &LocationSample, to: &LocationSample) -> f64 {
    let hours = duration_hours(to.elapsed.saturating_sub(from.elapsed));
    if hours == 0.0 {
        return 0.0;
    }
    haversine_distance(&from.point, &to.point) / 1000.0 / hours
}

/// Highest speed between any two consecutive samples, in km/h.
///
/// Returns 0.0 when no segment has at least two samples.
pub fn max_speed_kmh(trace: &Trace) -> f64 {
    trace
        .pairs()
        .map(|(a, b)| pair_speed_kmh(a, b))
        .fold(0.0, f64::max)
}

/// Sum of positive altitude deltas in meters, rounded once over the whole trace.
pub fn total_elevation_gain_meters(trace: &Trace) -> u32 {
    let gain: f64 = trace
        .pairs()
        .map(|(a, b)| (b.altitude - a.altitude).max(0.0))
        .sum();
    round_meters(gain)
}

/// The three aggregate values of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub distance_meters: u32,
    pub max_speed_kmh: f64,
    pub elevation_gain_meters: u32,
}

impl AggregateMetrics {
    #[cfg(not(feature = "parallel"))]
    pub fn from_trace(trace: &Trace) -> Self {
        Self {
            distance_meters: total_distance_meters(trace),
            max_speed_kmh: max_speed_kmh(trace),
            elevation_gain_meters: total_elevation_gain_meters(trace),
        }
    }

    /// The three passes only read the trace, so they run side by side.
    #[cfg(feature = "parallel")]
    pub fn from_trace(trace: &Trace) -> Self {
        let (distance_meters, (max_speed_kmh, elevation_gain_meters)) = rayon::join(
            || total_distance_meters(trace),
            || {
                rayon::join(
                    || self::max_speed_kmh(trace),
                    || total_elevation_gain_meters(trace),
                )
            },
        );
        Self {
            distance_meters,
            max_speed_kmh,
            elevation_gain_meters,
        }
    }
}

/// Aggregate metrics plus the derived values shown on a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub metrics: AggregateMetrics,
    /// Elapsed time of the last tracked sample
    pub duration: Duration,
    pub avg_speed_kmh: f64,
    /// Average pace, `None` until some distance has been covered
    pub avg_seconds_per_km: Option<f64>,
}

impl RunSummary {
    pub fn from_trace(trace: &Trace) -> Self {
        let metrics = AggregateMetrics::from_trace(trace);
        let duration = trace
            .last_sample()
            .map(|s| s.elapsed)
            .unwrap_or(Duration::ZERO);

        let km = metrics.distance_meters as f64 / 1000.0;
        let hours = duration_hours(duration);
        let avg_speed_kmh = if hours > 0.0 { km / hours } else { 0.0 };
        let avg_seconds_per_km = (km > 0.0).then(|| duration.as_secs_f64() / km);

        log::debug!(
            "[Metrics] Summary over {} samples: {} m in {:?}",
            trace.sample_count(),
            metrics.distance_meters,
            duration
        );
        Self {
            metrics,
            duration,
            avg_speed_kmh,
            avg_seconds_per_km,
        }
    }
}
