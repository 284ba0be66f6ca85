//! # DAS Readers
//!
//! Windowed reading and anti-alias decimation of distributed acoustic
//! sensing (DAS) archives stored as many small PRODML-style HDF5 files.
//!
//! A deployment writes one file per ~30 seconds of acquisition, organized
//! in day directories whose naming drifted across epochs. This crate
//! resolves which files cover a requested time window, reconciles their
//! per-file metadata, stitches the exact sample/channel window into one
//! contiguous block, and downsamples blocks with a Chebyshev Type II
//! anti-alias filter while preserving the timestamp grid.
//!
//! ## Crate Structure
//!
//! - **`metadata`**: header extraction from one file's attributes, with
//!   filename-based timestamp recovery for stripped archives.
//! - **`locate`**: candidate-file resolution for a time window across the
//!   directory naming conventions of different deployments/epochs.
//! - **`read`**: the windowed reader — per-file overlap tests, sample-range
//!   and channel selection, stitching into one pre-sized block.
//! - **`decimate`**: anti-alias filter design and integer-factor
//!   downsampling.
//! - **`write`**: PRODML-style block persistence, consumed by the same
//!   reader.
//! - **`batch`**: parallel downsampling of a whole archive with per-item
//!   failure isolation.
//! - **`config`**: TOML settings for the batch driver.
//! - **`header`** / **`error`** / **`logging`**: the data model, the error
//!   taxonomy, and tracing setup.

pub mod batch;
pub mod config;
pub mod decimate;
pub mod error;
pub mod header;
pub mod locate;
pub mod logging;
pub mod metadata;
pub mod read;
pub mod write;

pub use batch::{BatchOrchestrator, BatchSummary};
pub use config::{BatchSettings, DistanceSelection};
pub use decimate::{decimated_index, downsample};
pub use error::{DasError, DasResult};
pub use header::{AxisSet, Header};
pub use locate::locate;
pub use metadata::{list_attributes, read_header, timestamp_from_filename};
pub use read::{convert_to_strain_rate, load_file, read_window, ChannelSelector, DasBlock};
pub use write::write_block;
