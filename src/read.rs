//! Windowed, channel-selected reads across many small files.
//!
//! A request names a time window and a channel selection; the reader opens
//! each candidate file's header, decides whether the file overlaps the
//! window, computes the exact sample sub-range it needs from that file, and
//! fills one pre-sized output block in file order. The first overlapping
//! file fixes the channel axis for the whole window; channel consistency
//! across the remaining files is assumed, not re-derived per file.
//!
//! Every file is opened twice — once for its header, once for its data —
//! and never concurrently.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hdf5::Dataset;
use ndarray::{s, Array2, Axis};
use tracing::{debug, warn};

use crate::error::{DasError, DasResult};
use crate::header::{float_seconds, span_seconds, AxisSet, Header};
use crate::metadata::{read_header, RAW_DATA_PATH};

/// Unit string written after conversion to strain rate.
pub const STRAIN_RATE_UNIT: &str = "(nm/m)/s";

/// Closed set of channel-selection modes.
///
/// Exactly one mode applies to a read; the selection is resolved into raw
/// channel indices once, from the first overlapping file's header, before
/// the file loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSelector {
    /// Every channel in the file.
    All,
    /// Channels between two fiber distances (meters), located by
    /// nearest-value lookup on the derived distance axis, optionally
    /// keeping only every `nth_channel`-th channel.
    DistanceRange {
        start: f64,
        stop: f64,
        nth_channel: usize,
    },
    /// Raw 0-based indices into the file's channel axis.
    Indices(Vec<usize>),
    /// Indices relative to the zero-distance channel. Index 0 maps to the
    /// channel closest to physical distance 0, correcting for the fiber
    /// internal to the interrogator.
    Mapped(Vec<i64>),
}

/// A block of samples with the header and axes describing it.
#[derive(Debug, Clone)]
pub struct DasBlock {
    /// Samples, indexed `[sample, channel]`.
    pub data: Array2<f64>,
    pub header: Header,
    pub axes: AxisSet,
}

/// Channel selection resolved against a concrete header.
#[derive(Debug, Clone)]
struct ResolvedChannels {
    raw: RawChannels,
    distances: Vec<f64>,
    /// Reported channel spacing of the selection (scaled by the subsampling
    /// factor for strided selections).
    spacing: f64,
}

#[derive(Debug, Clone)]
enum RawChannels {
    /// Contiguous inclusive index range, read as one hyperslab.
    Range(usize, usize),
    /// Explicit index list, read as a bounded hyperslab then subset.
    List(Vec<usize>),
}

impl ResolvedChannels {
    fn len(&self) -> usize {
        match &self.raw {
            RawChannels::Range(c0, c1) => c1 - c0 + 1,
            RawChannels::List(list) => list.len(),
        }
    }
}

/// Per-file read plan: which sample rows of which file end up in the window.
#[derive(Debug)]
struct FilePlan {
    path: PathBuf,
    header: Header,
    /// Inclusive sample-index range to pull from this file.
    start_index: usize,
    end_index: usize,
}

impl FilePlan {
    fn sample_count(&self) -> usize {
        self.end_index - self.start_index + 1
    }
}

/// Inclusive-boundary overlap rule between a request `[t_start, t_end]` and
/// a file `[t0, t1]`.
///
/// The mix of strict interior comparisons and exact-equality clauses is
/// deliberate and load-bearing: a file whose boundary merely touches the
/// request (`t1 == t_start`) is not included, while exact start/end
/// coincidence is. Do not "fix" without confirming intent.
fn overlaps(
    t_start: DateTime<Utc>,
    t_end: DateTime<Utc>,
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
) -> bool {
    (t_start < t0 && t0 < t_end)
        || (t_start < t1 && t1 < t_end)
        || (t0 < t_start && t_start < t1)
        || t0 == t_start
        || t1 == t_end
}

/// Nearest sample index for an offset of `seconds` into a file sampled at
/// `fs`, clamped to the valid index range.
fn nearest_sample(seconds: f64, fs: f64, sample_count: usize) -> usize {
    let idx = (seconds * fs).round();
    if idx <= 0.0 {
        0
    } else {
        (idx as usize).min(sample_count.saturating_sub(1))
    }
}

/// Read `[t_start, t_end]` from `candidates`, returning exactly the samples
/// and channels requested, stitched across file boundaries.
///
/// Candidate files whose metadata cannot be read are logged and skipped;
/// the read fails with `NoDataLoaded` only when no file overlaps at all.
pub fn read_window(
    t_start: DateTime<Utc>,
    t_end: DateTime<Utc>,
    candidates: &[PathBuf],
    selector: &ChannelSelector,
) -> DasResult<DasBlock> {
    let plans = plan_window(t_start, t_end, candidates);
    let Some(first) = plans.first() else {
        return Err(DasError::NoDataLoaded {
            candidates: candidates.len(),
            start: t_start.to_rfc3339(),
            end: t_end.to_rfc3339(),
        });
    };

    // First file fixes the channel axis for the whole window.
    let resolved = resolve_channels(selector, &first.header)?;
    let channel_count = resolved.len();
    let total_samples: usize = plans.iter().map(FilePlan::sample_count).sum();

    let mut data = Array2::<f64>::zeros((total_samples, channel_count));
    let mut offset = 0usize;
    for plan in &plans {
        let block = read_file_slab(plan, &resolved.raw)?;
        if block.ncols() != channel_count {
            return Err(DasError::Selection(format!(
                "{} has {} channels where the window's first file selected {}",
                plan.path.display(),
                block.ncols(),
                channel_count
            )));
        }
        let rows = block.nrows();
        data.slice_mut(s![offset..offset + rows, ..]).assign(&block);
        offset += rows;
    }

    let fs = first.header.sample_rate;
    let final_t0 = first.header.start_time + float_seconds(first.start_index as f64 / fs);
    #[allow(clippy::expect_used)]
    let last = plans.last().expect("non-empty plans");
    let final_t1 = last.header.start_time + float_seconds(last.end_index as f64 / fs);

    let mut header = first.header.clone();
    header.start_time = final_t0;
    header.end_time = final_t1;
    header.sample_count = total_samples;
    header.channel_count = channel_count;
    header.spatial_resolution = resolved.spacing;
    if let (Some(&d0), Some(&d1)) = (resolved.distances.first(), resolved.distances.last()) {
        header.start_distance = d0;
        header.stop_distance = d1;
    }

    // The distance axis stays as resolved from the lookup; only the time
    // axes are regenerated, index-by-index so the length is exact.
    let relative: Vec<f64> = (0..total_samples).map(|i| i as f64 / fs).collect();
    let timestamps = relative.iter().map(|&t| final_t0 + float_seconds(t)).collect();
    let axes = AxisSet {
        relative,
        timestamps,
        distances: resolved.distances,
    };

    debug!(
        samples = total_samples,
        channels = channel_count,
        files = plans.len(),
        "windowed read complete"
    );
    Ok(DasBlock { data, header, axes })
}

/// Header pass: decide per file whether and which rows to read.
fn plan_window(
    t_start: DateTime<Utc>,
    t_end: DateTime<Utc>,
    candidates: &[PathBuf],
) -> Vec<FilePlan> {
    let mut plans = Vec::new();
    for path in candidates {
        let header = match read_header(path) {
            Ok(header) => header,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable candidate");
                continue;
            }
        };
        let (t0, t1) = (header.start_time, header.end_time);
        if !overlaps(t_start, t_end, t0, t1) {
            continue;
        }
        let fs = header.sample_rate;
        let npts = header.sample_count;
        let start_index = if t_start > t0 {
            nearest_sample(span_seconds(t0, t_start), fs, npts)
        } else {
            0
        };
        let end_index = if t1 > t_end {
            nearest_sample(span_seconds(t0, t_end), fs, npts)
        } else {
            npts.saturating_sub(1)
        };
        if end_index < start_index {
            warn!(path = %path.display(), "degenerate sample range, skipping file");
            continue;
        }
        plans.push(FilePlan {
            path: path.clone(),
            header,
            start_index,
            end_index,
        });
    }
    plans
}

/// Resolve a selector into raw channel indices against one header.
fn resolve_channels(selector: &ChannelSelector, header: &Header) -> DasResult<ResolvedChannels> {
    let nchan = header.channel_count;
    let dd = aligned_distances(header);
    match selector {
        ChannelSelector::All => Ok(ResolvedChannels {
            raw: RawChannels::Range(0, nchan.saturating_sub(1)),
            distances: dd,
            spacing: header.spatial_resolution,
        }),
        ChannelSelector::DistanceRange {
            start,
            stop,
            nth_channel,
        } => {
            let c0 = nearest_distance(&dd, *start);
            let c1 = nearest_distance(&dd, *stop);
            if c1 < c0 {
                return Err(DasError::Selection(format!(
                    "distance range {start}..{stop} resolves to an empty channel range"
                )));
            }
            if *nth_channel > 1 {
                let list: Vec<usize> = (c0..=c1).step_by(*nth_channel).collect();
                let distances = list.iter().map(|&i| dd[i]).collect();
                Ok(ResolvedChannels {
                    raw: RawChannels::List(list),
                    distances,
                    spacing: header.spatial_resolution * *nth_channel as f64,
                })
            } else {
                Ok(ResolvedChannels {
                    raw: RawChannels::Range(c0, c1),
                    distances: dd[c0..=c1].to_vec(),
                    spacing: header.spatial_resolution,
                })
            }
        }
        ChannelSelector::Indices(indices) => {
            if indices.is_empty() {
                return Err(DasError::Selection("empty channel index list".into()));
            }
            for &i in indices {
                if i >= nchan {
                    return Err(DasError::Selection(format!(
                        "channel index {i} out of range for {nchan} channels"
                    )));
                }
            }
            let distances = indices.iter().map(|&i| dd[i]).collect();
            Ok(ResolvedChannels {
                raw: RawChannels::List(indices.clone()),
                distances,
                spacing: header.spatial_resolution,
            })
        }
        ChannelSelector::Mapped(mapped) => {
            if mapped.is_empty() {
                return Err(DasError::Selection("empty mapped index list".into()));
            }
            let correction = zero_offset_correction(header);
            let mut list = Vec::with_capacity(mapped.len());
            for &m in mapped {
                let raw = m + correction;
                if raw < 0 || raw as usize >= nchan {
                    return Err(DasError::Selection(format!(
                        "mapped index {m} (raw {raw}) out of range for {nchan} channels"
                    )));
                }
                list.push(raw as usize);
            }
            let distances = list.iter().map(|&i| dd[i]).collect();
            Ok(ResolvedChannels {
                raw: RawChannels::List(list),
                distances,
                spacing: header.spatial_resolution,
            })
        }
    }
}

/// Offset added to a mapped index to reach the raw index of the same
/// channel: minus the (rounded) index of distance zero counted from
/// `start_distance`.
pub fn zero_offset_correction(header: &Header) -> i64 {
    -(header.start_distance / header.channel_step()).round() as i64
}

/// Distance axis forced to the stored channel count, with a warning when the
/// derived axis disagrees (the realized shape is ground truth).
fn aligned_distances(header: &Header) -> Vec<f64> {
    let mut dd = header.distance_axis();
    if dd.len() != header.channel_count {
        warn!(
            derived = dd.len(),
            stored = header.channel_count,
            "distance axis length disagrees with channel count"
        );
        dd.truncate(header.channel_count);
        while dd.len() < header.channel_count {
            let next = dd.last().map_or(header.start_distance, |d| d + header.channel_step());
            dd.push(next);
        }
    }
    dd
}

/// Index of the axis entry nearest to `target`.
fn nearest_distance(dd: &[f64], target: f64) -> usize {
    let mut best = 0usize;
    let mut best_err = f64::INFINITY;
    for (i, &d) in dd.iter().enumerate() {
        let err = (d - target).abs();
        if err < best_err {
            best = i;
            best_err = err;
        }
    }
    best
}

/// Pull one file's planned rows, with channel subsetting, as `f64`.
fn read_file_slab(plan: &FilePlan, raw: &RawChannels) -> DasResult<Array2<f64>> {
    let file = hdf5::File::open(&plan.path)?;
    let dataset = file.dataset(RAW_DATA_PATH)?;
    let (r0, r1) = (plan.start_index, plan.end_index);
    match raw {
        RawChannels::Range(c0, c1) => read_rows(&dataset, r0, r1, *c0, *c1),
        RawChannels::List(list) => {
            // Bound the hyperslab to the touched channels, then subset.
            #[allow(clippy::expect_used)]
            let lo = *list.iter().min().expect("non-empty list");
            #[allow(clippy::expect_used)]
            let hi = *list.iter().max().expect("non-empty list");
            let bounded = read_rows(&dataset, r0, r1, lo, hi)?;
            let shifted: Vec<usize> = list.iter().map(|&i| i - lo).collect();
            Ok(bounded.select(Axis(1), &shifted))
        }
    }
}

/// Read a row/channel hyperslab as `f64`, whatever numeric type the block
/// was stored as. Raw interrogator files carry 16-bit integers; converted
/// archives carry `f32` or `f64`.
fn read_rows(
    dataset: &Dataset,
    r0: usize,
    r1: usize,
    c0: usize,
    c1: usize,
) -> DasResult<Array2<f64>> {
    if let Ok(block) = dataset.read_slice_2d::<f64, _>(s![r0..=r1, c0..=c1]) {
        return Ok(block);
    }
    if let Ok(block) = dataset.read_slice_2d::<f32, _>(s![r0..=r1, c0..=c1]) {
        return Ok(block.mapv(f64::from));
    }
    if let Ok(block) = dataset.read_slice_2d::<i16, _>(s![r0..=r1, c0..=c1]) {
        return Ok(block.mapv(f64::from));
    }
    Ok(dataset.read_slice_2d::<i32, _>(s![r0..=r1, c0..=c1])?.mapv(f64::from))
}

/// Read a whole block as `f64`; same stored-type tolerance as [`read_rows`].
fn read_full(dataset: &Dataset) -> DasResult<Array2<f64>> {
    if let Ok(block) = dataset.read_2d::<f64>() {
        return Ok(block);
    }
    if let Ok(block) = dataset.read_2d::<f32>() {
        return Ok(block.mapv(f64::from));
    }
    if let Ok(block) = dataset.read_2d::<i16>() {
        return Ok(block.mapv(f64::from));
    }
    Ok(dataset.read_2d::<i32>()?.mapv(f64::from))
}

/// Load one complete file: full block, header, axes.
pub fn load_file(path: &Path) -> DasResult<DasBlock> {
    let mut header = read_header(path)?;
    let file = hdf5::File::open(path)?;
    let data = read_full(&file.dataset(RAW_DATA_PATH)?)?;
    if data.nrows() != header.sample_count || data.ncols() != header.channel_count {
        warn!(
            path = %path.display(),
            rows = data.nrows(),
            cols = data.ncols(),
            header_samples = header.sample_count,
            header_channels = header.channel_count,
            "data shape disagrees with metadata; using realized shape"
        );
        header.sample_count = data.nrows();
        header.channel_count = data.ncols();
    }
    let axes = AxisSet::from_header(&header);
    Ok(DasBlock { data, header, axes })
}

/// Scale native optical units to strain rate, in place.
///
/// Raw interrogator amplitudes are proportional to strain rate but need
/// `116/8192 * fs/10` applied, with `fs` the original acquisition rate.
/// When the header says some scaling is already in force the data is left
/// untouched and a warning is emitted — double scaling is worse than none.
pub fn convert_to_strain_rate(data: &mut Array2<f64>, header: &mut Header) {
    if (header.amplitude_scaling - 1.0).abs() > 1e-4 {
        warn!(
            amplitude_scaling = header.amplitude_scaling,
            "units already scaled; skipping strain-rate conversion"
        );
        return;
    }
    let fs = header.original_sample_rate;
    let scale = 116.0 / 8192.0 * fs / 10.0;
    data.mapv_inplace(|v| v * scale);
    header.amplitude_scaling = scale;
    header.unit = STRAIN_RATE_UNIT.to_owned();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_header(nchan: usize) -> Header {
        Header {
            sample_rate: 1000.0,
            original_sample_rate: 1000.0,
            spatial_resolution: 1.0,
            measured_length: nchan as f64,
            channel_count: nchan,
            sample_count: 30_000,
            start_time: Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 29).unwrap()
                + chrono::Duration::milliseconds(999),
            start_distance: -200.0,
            start_distance_absolute: -200.0,
            stop_distance: -200.0 + (nchan as f64 - 1.0) * 1.02,
            fiber_length_multiplier: 1.02,
            unit: String::new(),
            amplitude_scaling: 1.0,
            gauge_length: 10.0,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 2, 1, h, m, s).unwrap()
    }

    #[test]
    fn overlap_interior_cases() {
        // file: 12:00:00 .. 12:00:30
        let (t0, t1) = (at(12, 0, 0), at(12, 0, 30));
        // request straddles file start
        assert!(overlaps(at(11, 59, 50), at(12, 0, 10), t0, t1));
        // request straddles file end
        assert!(overlaps(at(12, 0, 20), at(12, 0, 40), t0, t1));
        // request inside file
        assert!(overlaps(at(12, 0, 5), at(12, 0, 10), t0, t1));
        // request covers file
        assert!(overlaps(at(11, 59, 0), at(12, 1, 0), t0, t1));
    }

    #[test]
    fn overlap_exact_equality_cases() {
        let (t0, t1) = (at(12, 0, 0), at(12, 0, 30));
        assert!(overlaps(at(12, 0, 0), at(12, 0, 30), t0, t1));
        assert!(overlaps(at(12, 0, 0), at(12, 0, 10), t0, t1));
        assert!(overlaps(at(12, 0, 10), at(12, 0, 30), t0, t1));
    }

    #[test]
    fn overlap_rejects_disjoint_and_touching_start() {
        let (t0, t1) = (at(12, 0, 0), at(12, 0, 30));
        assert!(!overlaps(at(12, 1, 0), at(12, 2, 0), t0, t1));
        assert!(!overlaps(at(11, 58, 0), at(11, 59, 0), t0, t1));
        // file ending exactly at the request start has no interior overlap
        assert!(!overlaps(at(12, 0, 30), at(12, 1, 0), t0, t1));
    }

    #[test]
    fn nearest_sample_rounds_not_floors() {
        assert_eq!(nearest_sample(0.0014, 1000.0, 100), 1);
        assert_eq!(nearest_sample(0.0016, 1000.0, 100), 2);
        assert_eq!(nearest_sample(-0.5, 1000.0, 100), 0);
        assert_eq!(nearest_sample(5.0, 1000.0, 100), 99);
    }

    #[test]
    fn zero_offset_correction_matches_rounded_ratio() {
        let header = test_header(500);
        // start_distance = -200, step = 1.02
        assert_eq!(zero_offset_correction(&header), (200.0f64 / 1.02).round() as i64);
    }

    #[test]
    fn mapped_zero_resolves_to_correction_index() {
        let header = test_header(500);
        let resolved =
            resolve_channels(&ChannelSelector::Mapped(vec![0]), &header).unwrap();
        let expected = (200.0f64 / 1.02).round() as usize;
        match resolved.raw {
            RawChannels::List(list) => assert_eq!(list, vec![expected]),
            RawChannels::Range(..) => panic!("mapped selection must be a list"),
        }
        // the resolved channel sits within a half step of distance zero
        assert!(resolved.distances[0].abs() <= 0.51 * header.channel_step());
    }

    #[test]
    fn mapped_out_of_range_is_selection_error() {
        let header = test_header(100);
        let err = resolve_channels(&ChannelSelector::Mapped(vec![500]), &header).unwrap_err();
        assert!(matches!(err, DasError::Selection(_)));
    }

    #[test]
    fn distance_range_with_stride_scales_spacing() {
        let header = test_header(500);
        let selector = ChannelSelector::DistanceRange {
            start: 0.0,
            stop: 100.0,
            nth_channel: 2,
        };
        let resolved = resolve_channels(&selector, &header).unwrap();
        assert!((resolved.spacing - 2.0).abs() < 1e-12);
        match &resolved.raw {
            RawChannels::List(list) => {
                assert!(list.windows(2).all(|w| w[1] - w[0] == 2));
            }
            RawChannels::Range(..) => panic!("strided selection must be a list"),
        }
        let dd_step = resolved.distances[1] - resolved.distances[0];
        assert!((dd_step - 2.0 * header.channel_step()).abs() < 1e-9);
    }

    #[test]
    fn distance_range_plain_is_contiguous() {
        let header = test_header(500);
        let selector = ChannelSelector::DistanceRange {
            start: 0.0,
            stop: 50.0,
            nth_channel: 1,
        };
        let resolved = resolve_channels(&selector, &header).unwrap();
        assert!(matches!(resolved.raw, RawChannels::Range(..)));
        assert!((resolved.spacing - 1.0).abs() < 1e-12);
    }

    #[test]
    fn explicit_indices_validated_against_channel_count() {
        let header = test_header(10);
        let err =
            resolve_channels(&ChannelSelector::Indices(vec![3, 10]), &header).unwrap_err();
        assert!(matches!(err, DasError::Selection(_)));
    }

    #[test]
    fn conversion_scales_and_marks_header() {
        let mut header = test_header(4);
        let mut data = Array2::<f64>::ones((8, 4));
        convert_to_strain_rate(&mut data, &mut header);
        let expected = 116.0 / 8192.0 * 1000.0 / 10.0;
        assert!((data[[0, 0]] - expected).abs() < 1e-12);
        assert!((header.amplitude_scaling - expected).abs() < 1e-12);
        assert_eq!(header.unit, STRAIN_RATE_UNIT);
    }

    #[test]
    fn conversion_refuses_already_scaled_data() {
        let mut header = test_header(4);
        header.amplitude_scaling = 1.4;
        let mut data = Array2::<f64>::ones((8, 4));
        convert_to_strain_rate(&mut data, &mut header);
        assert_eq!(data[[0, 0]], 1.0);
        assert_eq!(header.amplitude_scaling, 1.4);
    }
}
