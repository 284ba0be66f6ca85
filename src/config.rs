//! Configuration for the batch downsampler.
//!
//! Settings are loaded from a TOML file via the `config` crate. Everything
//! that used to be a constant at the top of a driver script — directories,
//! factor, worker count, overwrite policy — is explicit here, so two runs
//! with two files cannot fight over process-wide state.

use std::path::{Path, PathBuf};

use config::Config;
use serde::Deserialize;

use crate::error::{DasError, DasResult};

/// Batch driver settings.
///
/// ```toml
/// input_dir = "/data/site"
/// output_dir = "/data/site_downsampled"
/// factor = 2
/// workers = 6
///
/// [selection]
/// start = 0.0
/// stop = 8000.0
/// nth_channel = 2
/// ```
#[derive(Debug, Deserialize, Clone)]
pub struct BatchSettings {
    /// Archive root; epochs and day directories are found beneath it.
    pub input_dir: PathBuf,
    /// Output root; the epoch/day structure is mirrored here.
    pub output_dir: PathBuf,
    /// Integer decimation factor.
    #[serde(default = "default_factor")]
    pub factor: usize,
    /// Fixed worker-thread count.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Re-process files whose destination already exists.
    #[serde(default)]
    pub overwrite: bool,
    /// Forward-backward filtering (zero group delay, double cost).
    #[serde(default)]
    pub zero_phase: bool,
    /// Count files without processing anything.
    #[serde(default)]
    pub dry_run: bool,
    /// Seconds of extra data requested on both window ends before
    /// decimating, trimmed afterwards. Keeps filter transients out of the
    /// retained block.
    #[serde(default = "default_pad_seconds")]
    pub pad_seconds: f64,
    /// Optional channel selection by fiber distance.
    #[serde(default)]
    pub selection: Option<DistanceSelection>,
    /// File-name prefix of written blocks.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    /// Log filter used when the command line does not provide one.
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Channel selection by distance along the fiber, meters.
#[derive(Debug, Deserialize, Clone)]
pub struct DistanceSelection {
    pub start: f64,
    pub stop: f64,
    /// Keep every n-th channel within the range.
    #[serde(default = "default_nth_channel")]
    pub nth_channel: usize,
}

fn default_factor() -> usize {
    2
}

fn default_workers() -> usize {
    6
}

fn default_pad_seconds() -> f64 {
    29.0
}

fn default_output_prefix() -> String {
    "downsampled".to_owned()
}

fn default_nth_channel() -> usize {
    1
}

impl BatchSettings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> DasResult<Self> {
        let settings = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(DasError::Config)?;
        settings.try_deserialize().map_err(DasError::Config)
    }
}
