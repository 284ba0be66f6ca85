//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DasError`, used across the
//! reader, locator, decimation, and batch components. Using the `thiserror`
//! crate, it provides a centralized and consistent way to handle the
//! different failure classes of the pipeline:
//!
//! - **`Metadata`**: a single file could not be opened or is missing required
//!   attributes. Fatal to that file only; a multi-file window read logs it
//!   and moves on to the next candidate.
//! - **`NoFilesFound`**: the locator found nothing plausible for a time
//!   window. Fatal to the whole window request.
//! - **`NoDataLoaded`**: candidate files existed but none overlapped the
//!   requested window once their metadata was checked. Fatal to the whole
//!   window request.
//! - **`FilterDesign`**: the decimation filter could not converge to a
//!   numerically stable order. Fatal to that decimation call.
//! - **`Selection`**: a channel selection resolved outside the file's
//!   channel range or was otherwise inconsistent.
//!
//! Shape mismatches between realized arrays and metadata-derived expectations
//! are deliberately *not* errors: they are logged as warnings and the
//! realized array shape is treated as ground truth.
//!
//! By using `#[from]`, `DasError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the `?`
//! operator.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DasResult<T> = std::result::Result<T, DasError>;

#[derive(Error, Debug)]
pub enum DasError {
    #[error("Metadata error in {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    #[error("No files found for window {start} .. {end} under {root}")]
    NoFilesFound {
        root: PathBuf,
        start: String,
        end: String,
    },

    #[error("No data loaded: none of the {candidates} candidate files overlap {start} .. {end}")]
    NoDataLoaded {
        candidates: usize,
        start: String,
        end: String,
    },

    #[error("Filter design failed: {0}")]
    FilterDesign(String),

    #[error("Invalid channel selection: {0}")]
    Selection(String),

    #[error("Timestamp parse error: {0}")]
    Timestamp(String),

    #[error("Attribute encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DasError {
    /// Build a `Metadata` error for `path` from any displayable cause.
    pub fn metadata(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        DasError::Metadata {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_error_mentions_path_and_reason() {
        let err = DasError::metadata("/data/file.h5", "missing OutputDataRate");
        let msg = err.to_string();
        assert!(msg.contains("/data/file.h5"));
        assert!(msg.contains("missing OutputDataRate"));
    }

    #[test]
    fn filter_design_error_is_displayable() {
        let err = DasError::FilterDesign("order did not converge below 12".into());
        assert!(err.to_string().contains("order"));
    }
}
