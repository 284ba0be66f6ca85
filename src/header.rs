//! Header record and derived axes for one block of DAS data.
//!
//! A [`Header`] is constructed fresh for every file read and never mutated
//! afterwards, except by the windowed-merge step which rewrites the
//! time/space extent to describe the subset actually returned. The
//! [`AxisSet`] is derived data: it is regenerated whenever the header
//! changes and is never persisted independently of the block it describes.

use chrono::{DateTime, Utc};
use tracing::warn;

/// Normalized per-block metadata, assembled from the file's attributes.
///
/// Field names follow the quantities of the PRODML-style layout rather than
/// the raw attribute names; see [`crate::metadata`] for the mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Sample rate of the stored data, Hz.
    pub sample_rate: f64,
    /// Sample rate at acquisition time, Hz. Differs from `sample_rate` once
    /// a file has been downsampled; needed to scale native optical units.
    pub original_sample_rate: f64,
    /// Reported channel spacing, meters.
    pub spatial_resolution: f64,
    /// Total fiber measure length, meters.
    pub measured_length: f64,
    /// Number of spatial channels.
    pub channel_count: usize,
    /// Number of time samples per channel.
    pub sample_count: usize,
    /// Timestamp of the first sample.
    pub start_time: DateTime<Utc>,
    /// Timestamp of the last sample.
    pub end_time: DateTime<Utc>,
    /// Distance along the fiber of the first stored channel, meters. The
    /// first ~200 m of fiber are internal to the interrogator, so this is
    /// commonly negative.
    pub start_distance: f64,
    /// Original start distance before any user cut; equals `start_distance`
    /// unless the writer trimmed leading channels.
    pub start_distance_absolute: f64,
    /// Distance along the fiber of the last stored channel, meters.
    pub stop_distance: f64,
    /// Requested channel spacing of 1 m is actually this many meters.
    pub fiber_length_multiplier: f64,
    /// Unit string of the stored samples.
    pub unit: String,
    /// Scaling already applied to the raw amplitudes; 1.0 means untouched
    /// native units.
    pub amplitude_scaling: f64,
    /// Gauge length, meters.
    pub gauge_length: f64,
}

impl Header {
    /// Effective channel step along the fiber, meters.
    pub fn channel_step(&self) -> f64 {
        self.spatial_resolution * self.fiber_length_multiplier
    }

    /// Distance axis derived from the header, one entry per channel.
    ///
    /// The end target is extended by half a step so the final channel is
    /// reached despite rounding accumulated over long (>30 km) fibers;
    /// without it the realized axis can fall one entry short of
    /// `stop_distance`.
    pub fn distance_axis(&self) -> Vec<f64> {
        let step = self.channel_step();
        if step <= 0.0 {
            return Vec::new();
        }
        let end = self.stop_distance + step / 2.0;
        let span = end - self.start_distance;
        if span <= 0.0 {
            return vec![self.start_distance];
        }
        let n = (span / step).ceil() as usize;
        (0..n).map(|k| self.start_distance + k as f64 * step).collect()
    }

    /// Sample count implied by the time extent and sample rate.
    pub fn expected_sample_count(&self) -> usize {
        let span = span_seconds(self.start_time, self.end_time);
        (span * self.sample_rate).round() as usize + 1
    }

    /// Check the `sample_count == round(span * fs) + 1` invariant.
    ///
    /// Violations are logged, not fatal; the stored count stays in force.
    pub fn check_sample_count(&self) {
        let expected = self.expected_sample_count();
        if expected.abs_diff(self.sample_count) > 1 {
            warn!(
                expected,
                stored = self.sample_count,
                "sample count disagrees with time extent and sample rate"
            );
        }
    }
}

/// Time and distance axes for one data block. Ephemeral; regenerate from the
/// header rather than carrying stale copies around.
#[derive(Debug, Clone)]
pub struct AxisSet {
    /// Seconds from the first sample, one entry per sample.
    pub relative: Vec<f64>,
    /// Absolute timestamp of each sample.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Distance along the fiber of each channel, meters.
    pub distances: Vec<f64>,
}

impl AxisSet {
    /// Rebuild all axes from a header.
    ///
    /// The relative time vector is generated by sample index, so its length
    /// matches `sample_count` exactly regardless of floating-point drift.
    pub fn from_header(header: &Header) -> Self {
        let fs = header.sample_rate;
        let relative: Vec<f64> = (0..header.sample_count).map(|i| i as f64 / fs).collect();
        let timestamps = relative
            .iter()
            .map(|&t| header.start_time + float_seconds(t))
            .collect();
        let mut distances = header.distance_axis();
        if distances.len() != header.channel_count {
            warn!(
                derived = distances.len(),
                stored = header.channel_count,
                "distance axis length disagrees with channel count; using stored count"
            );
            distances.truncate(header.channel_count);
            while distances.len() < header.channel_count {
                let next = distances.last().map_or(header.start_distance, |d| d + header.channel_step());
                distances.push(next);
            }
        }
        Self {
            relative,
            timestamps,
            distances,
        }
    }
}

/// Span between two timestamps as fractional seconds.
pub(crate) fn span_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start)
        .num_nanoseconds()
        .map_or_else(|| (end - start).num_milliseconds() as f64 * 1e-3, |ns| ns as f64 * 1e-9)
}

/// Fractional seconds as a chrono duration, rounded to whole nanoseconds.
pub(crate) fn float_seconds(secs: f64) -> chrono::Duration {
    chrono::Duration::nanoseconds((secs * 1e9).round() as i64)
}
