//! PRODML-style block persistence.
//!
//! Writes the reduced attribute tree consumed by [`crate::metadata`]: the
//! variable names match the interrogator's native PRODML layout, so the
//! same reader handles raw archives and files written here. This is not
//! the full PRODML standard — only the attributes the pipeline needs.
//!
//! The sample block is stored as `f32`: raw interrogator files use 16-bit
//! integers, but anything that has been filtered or downsampled needs the
//! extra precision.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use hdf5::types::VarLenUnicode;
use ndarray::Array2;

use crate::error::{DasError, DasResult};
use crate::header::Header;

/// Fixed ASCII timestamp layout of the Part*Time attributes.
const TIMESTAMP_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%.6f+00:00";

/// Persist one block and its header under `path`, overwriting any existing
/// file.
pub fn write_block(path: &Path, data: &Array2<f64>, header: &Header) -> DasResult<()> {
    let file = hdf5::File::create(path)?;

    let acquisition = file.create_group("Acquisition")?;
    acquisition
        .new_attr::<f64>()
        .create("GaugeLength")?
        .write_scalar(&header.gauge_length)?;

    let custom = acquisition.create_group("Custom")?;
    let user = custom.create_group("UserSettings")?;
    user.new_attr::<f64>()
        .create("SpatialResolution")?
        .write_scalar(&header.spatial_resolution)?;
    user.new_attr::<f64>()
        .create("MeasureLength")?
        .write_scalar(&header.measured_length)?;
    user.new_attr::<f64>()
        .create("StartDistance")?
        .write_scalar(&header.start_distance)?;
    user.new_attr::<f64>()
        .create("StopDistance")?
        .write_scalar(&header.stop_distance)?;

    let system = custom.create_group("SystemSettings")?;
    system
        .new_attr::<f64>()
        .create("FibreLengthMultiplier")?
        .write_scalar(&header.fiber_length_multiplier)?;

    let raw = acquisition.create_group("Raw[0]")?;
    raw.new_attr::<f64>()
        .create("OutputDataRate")?
        .write_scalar(&header.sample_rate)?;
    raw.new_attr::<f64>()
        .create("OriginalDataRate")?
        .write_scalar(&header.original_sample_rate)?;
    raw.new_attr::<f64>()
        .create("AmpScaling")?
        .write_scalar(&header.amplitude_scaling)?;
    raw.new_attr::<i64>()
        .create("NumberOfLoci")?
        .write_scalar(&(header.channel_count as i64))?;
    write_text_attr(&raw, "RawDataUnit", &header.unit)?;

    let block = data.mapv(|v| v as f32);
    let (rows, cols) = block.dim();
    let dataset = raw
        .new_dataset::<f32>()
        .shape((rows, cols))
        .chunk((rows.clamp(1, 4096), cols.max(1)))
        .create("RawData")?;
    dataset.write(block.view())?;

    dataset
        .new_attr::<i64>()
        .create("Count")?
        .write_scalar(&(header.sample_count as i64))?;
    write_dataset_text_attr(&dataset, "PartStartTime", &format_timestamp(header.start_time))?;
    write_dataset_text_attr(&dataset, "PartEndTime", &format_timestamp(header.end_time))?;

    Ok(())
}

/// Render a timestamp in the fixed ASCII layout shared by reader and writer.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_LAYOUT).to_string()
}

fn write_text_attr(group: &hdf5::Group, name: &str, value: &str) -> DasResult<()> {
    let text = VarLenUnicode::from_str(value)
        .map_err(|e| DasError::Encoding(format!("attribute {name} is not valid unicode: {e}")))?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&text)?;
    Ok(())
}

fn write_dataset_text_attr(dataset: &hdf5::Dataset, name: &str, value: &str) -> DasResult<()> {
    let text = VarLenUnicode::from_str(value)
        .map_err(|e| DasError::Encoding(format!("attribute {name} is not valid unicode: {e}")))?;
    dataset
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::read_header;
    use crate::read::load_file;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn test_header(rows: usize, cols: usize) -> Header {
        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 0).unwrap();
        Header {
            sample_rate: 100.0,
            original_sample_rate: 1000.0,
            spatial_resolution: 2.0,
            measured_length: 1000.0,
            channel_count: cols,
            sample_count: rows,
            start_time: t0,
            end_time: t0 + chrono::Duration::milliseconds(((rows - 1) * 10) as i64),
            start_distance: -40.0,
            start_distance_absolute: -40.0,
            stop_distance: -40.0 + (cols as f64 - 1.0) * 2.04,
            fiber_length_multiplier: 1.02,
            unit: "(nm/m)/s".into(),
            amplitude_scaling: 1.0,
            gauge_length: 10.0,
        }
    }

    #[test]
    fn timestamp_layout_is_thirty_two_ascii_chars() {
        let t = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 0).unwrap();
        let text = format_timestamp(t);
        assert_eq!(text, "2023-02-01T12:00:00.000000+00:00");
        assert_eq!(text.len(), 32);
    }

    #[test]
    fn header_round_trips_through_writer_and_reader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("block.h5");
        let header = test_header(50, 4);
        let data = Array2::from_shape_fn((50, 4), |(i, j)| (i * 4 + j) as f64);

        write_block(&path, &data, &header).unwrap();
        let read_back = read_header(&path).unwrap();

        assert_eq!(read_back.sample_rate, header.sample_rate);
        assert_eq!(read_back.original_sample_rate, header.original_sample_rate);
        assert_eq!(read_back.spatial_resolution, header.spatial_resolution);
        assert_eq!(read_back.channel_count, header.channel_count);
        assert_eq!(read_back.sample_count, header.sample_count);
        assert_eq!(read_back.start_time, header.start_time);
        assert_eq!(read_back.end_time, header.end_time);
        assert_eq!(read_back.fiber_length_multiplier, header.fiber_length_multiplier);
        assert_eq!(read_back.unit, header.unit);
        assert_eq!(read_back.gauge_length, header.gauge_length);
    }

    #[test]
    fn data_round_trips_at_f32_precision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("block.h5");
        let header = test_header(20, 3);
        let data = Array2::from_shape_fn((20, 3), |(i, j)| i as f64 * 0.5 - j as f64);

        write_block(&path, &data, &header).unwrap();
        let block = load_file(&path).unwrap();

        assert_eq!(block.data.dim(), (20, 3));
        for ((i, j), &v) in data.indexed_iter() {
            assert!((block.data[[i, j]] - v).abs() < 1e-5);
        }
    }
}
