//! Header extraction from PRODML-style DAS files.
//!
//! Files written natively by the interrogator follow the PRODML layout for
//! their attributes; converted/stripped archives keep the same attribute
//! names in a reduced tree. The reader therefore does not assume a fixed
//! group structure: it walks every group in the file, collects every
//! attribute it finds, and maps the known names onto [`Header`] fields
//! through a declarative schema. Unknown attributes are ignored.
//!
//! Some archives carry a broken `PartStartTime` equal to the Unix epoch.
//! For those, the start time is recovered from the timestamp embedded in
//! the file name and the end time from the nominal 30-second block length.

use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use hdf5::types::{FixedAscii, FixedUnicode, VarLenAscii, VarLenUnicode};
use hdf5::{Attribute, Group};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::{DasError, DasResult};
use crate::header::{float_seconds, Header};

/// Path of the raw sample block inside every file, addressed `[sample, channel]`.
pub const RAW_DATA_PATH: &str = "Acquisition/Raw[0]/RawData";

/// Nominal length of one acquisition block, seconds. Used when the end time
/// must be reconstructed from a filename-recovered start time.
pub const NOMINAL_BLOCK_SECONDS: f64 = 30.0;

/// One attribute value, normalized to the three shapes the schema consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Float(f64),
    Int(i64),
    Text(String),
}

impl AttrValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Text(_) => None,
        }
    }

    fn as_usize(&self) -> Option<usize> {
        match self {
            AttrValue::Float(v) if *v >= 0.0 => Some(v.round() as usize),
            AttrValue::Int(v) if *v >= 0 => Some(*v as usize),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// One `(group path, attribute name, value)` triple from the scan.
#[derive(Debug, Clone)]
pub struct AttributeRecord {
    pub group: String,
    pub name: String,
    pub value: AttrValue,
}

/// Canonical header fields the schema can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    SampleRate,
    OriginalSampleRate,
    SpatialResolution,
    MeasuredLength,
    ChannelCount,
    SampleCount,
    StartTime,
    EndTime,
    StartDistance,
    StartDistanceAbsolute,
    StopDistance,
    FiberLengthMultiplier,
    Unit,
    AmplitudeScaling,
    GaugeLength,
}

/// Attribute-name → canonical-field schema. Custom extensions
/// (`OriginalDataRate`, `AmpScaling`) land on their own fields and override
/// the defaults derived from the stored values.
const SCHEMA: &[(&str, Field)] = &[
    ("OutputDataRate", Field::SampleRate),
    ("OriginalDataRate", Field::OriginalSampleRate),
    ("SpatialResolution", Field::SpatialResolution),
    ("MeasureLength", Field::MeasuredLength),
    ("NumberOfLoci", Field::ChannelCount),
    ("Count", Field::SampleCount),
    ("PartStartTime", Field::StartTime),
    ("PartEndTime", Field::EndTime),
    ("StartDistance", Field::StartDistance),
    ("OriginalStartDistance", Field::StartDistanceAbsolute),
    ("StopDistance", Field::StopDistance),
    ("FibreLengthMultiplier", Field::FiberLengthMultiplier),
    ("RawDataUnit", Field::Unit),
    ("AmpScaling", Field::AmplitudeScaling),
    ("GaugeLength", Field::GaugeLength),
];

#[derive(Debug, Default)]
struct HeaderDraft {
    sample_rate: Option<f64>,
    original_sample_rate: Option<f64>,
    spatial_resolution: Option<f64>,
    measured_length: Option<f64>,
    channel_count: Option<usize>,
    sample_count: Option<usize>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    start_distance: Option<f64>,
    start_distance_absolute: Option<f64>,
    stop_distance: Option<f64>,
    fiber_length_multiplier: Option<f64>,
    unit: Option<String>,
    amplitude_scaling: Option<f64>,
    gauge_length: Option<f64>,
}

impl HeaderDraft {
    fn apply(&mut self, field: Field, value: &AttrValue) {
        match field {
            // Sample rates are rounded to millihertz precision; the stored
            // float carries accumulated conversion noise below that.
            Field::SampleRate => self.sample_rate = value.as_f64().map(round_millihertz),
            Field::OriginalSampleRate => {
                self.original_sample_rate = value.as_f64().map(round_millihertz)
            }
            Field::SpatialResolution => self.spatial_resolution = value.as_f64(),
            Field::MeasuredLength => self.measured_length = value.as_f64(),
            Field::ChannelCount => self.channel_count = value.as_usize(),
            Field::SampleCount => self.sample_count = value.as_usize(),
            Field::StartTime => self.start_time = value.as_text().and_then(parse_timestamp),
            Field::EndTime => self.end_time = value.as_text().and_then(parse_timestamp),
            Field::StartDistance => self.start_distance = value.as_f64(),
            Field::StartDistanceAbsolute => self.start_distance_absolute = value.as_f64(),
            Field::StopDistance => self.stop_distance = value.as_f64(),
            Field::FiberLengthMultiplier => self.fiber_length_multiplier = value.as_f64(),
            Field::Unit => self.unit = value.as_text().map(str::to_owned),
            Field::AmplitudeScaling => self.amplitude_scaling = value.as_f64(),
            Field::GaugeLength => self.gauge_length = value.as_f64(),
        }
    }
}

fn round_millihertz(hz: f64) -> f64 {
    (hz * 1000.0).round() / 1000.0
}

/// Parse the fixed `YYYY-MM-DDTHH:MM:SS.ffffff+00:00` format.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(text.trim_end_matches('\0').trim(), "%Y-%m-%dT%H:%M:%S%.f%:z")
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Read and normalize the header record of one file.
///
/// Fails with a `Metadata` error when the file cannot be opened or the
/// required attributes (sample rate, spatial resolution, channel count) are
/// absent. All other fields are defaulted or reconstructed; disagreements
/// between the stored sample count and the time extent are logged.
pub fn read_header(path: &Path) -> DasResult<Header> {
    let file = hdf5::File::open(path).map_err(|e| DasError::metadata(path, e))?;
    let records = scan_group(&file, "")?;

    let mut draft = HeaderDraft::default();
    for record in &records {
        if let Some((_, field)) = SCHEMA.iter().find(|(name, _)| *name == record.name) {
            draft.apply(*field, &record.value);
        }
    }

    let sample_rate = draft
        .sample_rate
        .ok_or_else(|| DasError::metadata(path, "missing required attribute OutputDataRate"))?;
    let spatial_resolution = draft
        .spatial_resolution
        .ok_or_else(|| DasError::metadata(path, "missing required attribute SpatialResolution"))?;
    let channel_count = draft
        .channel_count
        .ok_or_else(|| DasError::metadata(path, "missing required attribute NumberOfLoci"))?;

    // Sample count: prefer the Count attribute, fall back to the dataset shape.
    let sample_count = match draft.sample_count {
        Some(n) => n,
        None => {
            let shape = file
                .dataset(RAW_DATA_PATH)
                .map_err(|e| DasError::metadata(path, e))?
                .shape();
            debug!(path = %path.display(), "Count attribute absent, using dataset shape");
            *shape
                .first()
                .ok_or_else(|| DasError::metadata(path, "raw data block has no shape"))?
        }
    };

    // Degenerate-timestamp recovery: an epoch-zero (or absent) start time is
    // the sentinel for stripped metadata; the file name carries the truth.
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    let (start_time, end_time) = match draft.start_time {
        Some(t0) if t0 != epoch => {
            let t1 = draft.end_time.unwrap_or_else(|| {
                t0 + float_seconds((sample_count.saturating_sub(1)) as f64 / sample_rate)
            });
            (t0, t1)
        }
        _ => {
            let t0 = timestamp_from_filename(path).ok_or_else(|| {
                DasError::metadata(path, "start time missing and not recoverable from file name")
            })?;
            let t1 = t0 + float_seconds(NOMINAL_BLOCK_SECONDS - 1.0 / sample_rate);
            warn!(
                path = %path.display(),
                start = %t0,
                "timestamps missing from metadata, recovered from file name"
            );
            (t0, t1)
        }
    };

    let start_distance = draft.start_distance.unwrap_or(0.0);
    let fiber_length_multiplier = draft.fiber_length_multiplier.unwrap_or(1.0);
    let stop_distance = draft.stop_distance.unwrap_or_else(|| {
        start_distance
            + (channel_count.saturating_sub(1)) as f64 * spatial_resolution * fiber_length_multiplier
    });

    let header = Header {
        sample_rate,
        original_sample_rate: draft.original_sample_rate.unwrap_or(sample_rate),
        spatial_resolution,
        measured_length: draft.measured_length.unwrap_or(stop_distance - start_distance),
        channel_count,
        sample_count,
        start_time,
        end_time,
        start_distance,
        start_distance_absolute: draft.start_distance_absolute.unwrap_or(start_distance),
        stop_distance,
        fiber_length_multiplier,
        unit: draft.unit.unwrap_or_default(),
        amplitude_scaling: draft.amplitude_scaling.unwrap_or(1.0),
        gauge_length: draft.gauge_length.unwrap_or(0.0),
    };
    header.check_sample_count();
    Ok(header)
}

/// Dump every attribute of every group in a file.
///
/// Debugging aid for unfamiliar archives; the schema above was learned from
/// exactly this kind of walk.
pub fn list_attributes(path: &Path) -> DasResult<Vec<AttributeRecord>> {
    let file = hdf5::File::open(path).map_err(|e| DasError::metadata(path, e))?;
    scan_group(&file, "")
}

/// Recursively collect the attributes of `group` and every group below it.
fn scan_group(group: &Group, prefix: &str) -> DasResult<Vec<AttributeRecord>> {
    let mut records = Vec::new();
    for name in group.attr_names()? {
        if let Ok(attr) = group.attr(&name) {
            if let Some(value) = read_attr_value(&attr) {
                records.push(AttributeRecord {
                    group: prefix.to_owned(),
                    name,
                    value,
                });
            }
        }
    }
    for member in group.member_names()? {
        let child_path = if prefix.is_empty() {
            member.clone()
        } else {
            format!("{prefix}/{member}")
        };
        if let Ok(child) = group.group(&member) {
            records.extend(scan_group(&child, &child_path)?);
        } else if let Ok(dataset) = group.dataset(&member) {
            // Datasets carry attributes too (Count, PartStartTime, ...).
            for name in dataset.attr_names()? {
                if let Ok(attr) = dataset.attr(&name) {
                    if let Some(value) = read_attr_value(&attr) {
                        records.push(AttributeRecord {
                            group: child_path.clone(),
                            name,
                            value,
                        });
                    }
                }
            }
        }
    }
    Ok(records)
}

/// Read one attribute, whatever numeric or string type it was stored as.
fn read_attr_value(attr: &Attribute) -> Option<AttrValue> {
    if let Ok(v) = attr.read_scalar::<f64>() {
        return Some(AttrValue::Float(v));
    }
    if let Ok(v) = attr.read_scalar::<f32>() {
        return Some(AttrValue::Float(v as f64));
    }
    if let Ok(v) = attr.read_scalar::<i64>() {
        return Some(AttrValue::Int(v));
    }
    if let Ok(v) = attr.read_scalar::<i32>() {
        return Some(AttrValue::Int(v as i64));
    }
    if let Ok(v) = attr.read_scalar::<u32>() {
        return Some(AttrValue::Int(v as i64));
    }
    if let Ok(v) = attr.read_scalar::<u64>() {
        return Some(AttrValue::Int(v as i64));
    }
    if let Ok(v) = attr.read_scalar::<VarLenUnicode>() {
        return Some(AttrValue::Text(v.to_string()));
    }
    if let Ok(v) = attr.read_scalar::<VarLenAscii>() {
        return Some(AttrValue::Text(v.to_string()));
    }
    if let Ok(v) = attr.read_scalar::<FixedUnicode<64>>() {
        return Some(AttrValue::Text(v.to_string()));
    }
    if let Ok(v) = attr.read_scalar::<FixedAscii<64>>() {
        return Some(AttrValue::Text(v.to_string()));
    }
    None
}

/// Extract the `..._YYYYMMDD_HHMMSS[.ffffff]...` token embedded in a file
/// name. The last occurrence wins, matching names that carry a date in both
/// a prefix and the timestamp proper.
pub fn timestamp_from_filename(path: &Path) -> Option<DateTime<Utc>> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let re = TOKEN.get_or_init(|| {
        #[allow(clippy::expect_used)]
        let re = Regex::new(r"(\d{8})_(\d{6})(?:\.(\d+))?").expect("static regex");
        re
    });
    let name = path.file_name()?.to_str()?;
    let caps = re.captures_iter(name).last()?;
    let date = NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y%m%d").ok()?;
    let time = NaiveTime::parse_from_str(caps.get(2)?.as_str(), "%H%M%S").ok()?;
    let mut stamp = Utc.from_utc_datetime(&date.and_time(time));
    if let Some(frac) = caps.get(3) {
        let digits = frac.as_str();
        let value: f64 = digits.parse().ok()?;
        let micros = value / 10f64.powi(digits.len() as i32) * 1e6;
        stamp += chrono::Duration::microseconds(micros.round() as i64);
    }
    Some(stamp)
}
