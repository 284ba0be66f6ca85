//! Batch downsampling across a whole archive.
//!
//! Walks every file under `input_dir/*epoch*/<day>/`, mirrors the epoch/day
//! structure under the output directory, and for each file: loads a window
//! padded by [`pad`](crate::config::BatchSettings::pad_seconds) seconds on
//! both ends, decimates, trims the padding on the decimated grid, and
//! writes the result. Padding keeps filter edge transients out of the
//! retained samples; trimming *after* decimation keeps the output timestamp
//! grid aligned with the input's.
//!
//! Files are independent, so the batch is embarrassingly parallel: a fixed
//! number of worker threads pull paths from a shared queue. One file's
//! failure is logged and counted, never fatal to the run. The only
//! idempotence mechanism is the skip-if-destination-exists check — it is
//! not transactional, and a crash mid-write can leave a corrupt partial
//! output file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use ndarray::s;
use tracing::{debug, error, info, warn};

use crate::config::BatchSettings;
use crate::decimate::{decimated_index, downsample};
use crate::error::{DasError, DasResult};
use crate::header::{float_seconds, span_seconds};
use crate::locate::locate;
use crate::metadata::read_header;
use crate::read::{read_window, ChannelSelector};
use crate::write::write_block;

/// Outcome counts of one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    /// Files discovered by the catalog walk.
    pub planned: usize,
    /// Files downsampled and written.
    pub processed: usize,
    /// Files skipped because their destination already existed.
    pub skipped: usize,
    /// Files that raised; see the log for details.
    pub failed: usize,
}

enum Outcome {
    Written,
    Skipped,
}

/// Drives the windowed reader and the decimation filter over a file catalog.
pub struct BatchOrchestrator {
    settings: BatchSettings,
}

impl BatchOrchestrator {
    pub fn new(settings: BatchSettings) -> Self {
        Self { settings }
    }

    /// Process the whole catalog. Returns counts; per-file errors are
    /// isolated and recorded, they do not abort the run.
    pub fn run(&self) -> DasResult<BatchSummary> {
        let jobs = self.collect_jobs()?;
        let planned = jobs.len();
        info!(planned, workers = self.worker_count(), "batch catalog assembled");

        if self.settings.dry_run {
            info!(planned, "dry run, nothing processed");
            return Ok(BatchSummary {
                planned,
                processed: 0,
                skipped: 0,
                failed: 0,
            });
        }

        let queue = SegQueue::new();
        for job in jobs {
            queue.push(job);
        }
        let processed = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..self.worker_count() {
                scope.spawn(|| {
                    while let Some(path) = queue.pop() {
                        match self.process_one(&path) {
                            Ok(Outcome::Written) => {
                                processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(Outcome::Skipped) => {
                                skipped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                error!(path = %path.display(), %err, "batch item failed");
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                });
            }
        });

        let summary = BatchSummary {
            planned,
            processed: processed.into_inner(),
            skipped: skipped.into_inner(),
            failed: failed.into_inner(),
        };
        info!(?summary, "batch complete");
        Ok(summary)
    }

    fn worker_count(&self) -> usize {
        self.settings.workers.max(1)
    }

    /// Epoch/day catalog walk. Falls back to treating `input_dir` itself as
    /// a single epoch when no `*epoch*` directory exists.
    fn collect_jobs(&self) -> DasResult<Vec<PathBuf>> {
        let root = &self.settings.input_dir;
        let mut epochs: Vec<PathBuf> = std::fs::read_dir(root)?
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter(|entry| entry.file_name().to_string_lossy().contains("epoch"))
            .map(|entry| entry.path())
            .collect();
        epochs.sort();
        if epochs.is_empty() {
            debug!(root = %root.display(), "no epoch directories, walking root as one epoch");
            epochs.push(root.clone());
        }

        let mut jobs = Vec::new();
        for epoch in &epochs {
            let mut days: Vec<PathBuf> = std::fs::read_dir(epoch)?
                .flatten()
                .filter(|entry| entry.path().is_dir())
                .map(|entry| entry.path())
                .collect();
            days.sort();
            for day in &days {
                let mut files: Vec<PathBuf> = std::fs::read_dir(day)?
                    .flatten()
                    .map(|entry| entry.path())
                    .filter(|path| path.is_file() && path.extension().is_some_and(|e| e == "h5"))
                    .collect();
                files.sort();
                jobs.extend(files);
            }
        }
        Ok(jobs)
    }

    /// Destination path mirroring the input's epoch/day components, named
    /// by the block's start time at millisecond precision.
    fn output_path_for(&self, input: &Path, start_token: &str) -> PathBuf {
        let mut dir = self.settings.output_dir.clone();
        let day = input.parent().and_then(Path::file_name);
        let epoch = input
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .filter(|name| name.to_string_lossy().contains("epoch"));
        if let Some(epoch) = epoch {
            dir.push(epoch);
        }
        if let Some(day) = day {
            dir.push(day);
        }
        dir.join(format!("{}_{}.h5", self.settings.output_prefix, start_token))
    }

    fn process_one(&self, input: &Path) -> DasResult<Outcome> {
        debug!(path = %input.display(), "downsampling");
        let target = read_header(input)?;
        let start_token = target.start_time.format("%Y%m%d_%H%M%S%.3f").to_string();
        let out_path = self.output_path_for(input, &start_token);

        if !self.settings.overwrite && out_path.exists() {
            info!(path = %out_path.display(), "destination exists, skipping");
            return Ok(Outcome::Skipped);
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Pad the request so filter transients land outside the block we
        // keep. The padding may only partially exist (first/last file of a
        // directory); the realized axis decides the trim indices below.
        let pad = float_seconds(self.settings.pad_seconds);
        let window_start = target.start_time - pad;
        let window_end = target.end_time + pad;
        let candidates = locate(window_start, window_end, &self.settings.input_dir)?;
        let selector = self
            .settings
            .selection
            .as_ref()
            .map_or(ChannelSelector::All, |sel| ChannelSelector::DistanceRange {
                start: sel.start,
                stop: sel.stop,
                nth_channel: sel.nth_channel,
            });
        let block = read_window(window_start, window_end, &candidates, &selector)?;

        let fs = block.header.sample_rate;
        let factor = self.settings.factor;
        let realized_t0 = block.header.start_time;
        let rows = block.data.nrows();

        // Boundary indices of the target block on the realized (padded)
        // axis. The end index gets +1 so the trimmed range is inclusive and
        // divides evenly for the decimation arithmetic.
        let start_index = nearest_row(span_seconds(realized_t0, target.start_time), fs, rows);
        let mut end_index = nearest_row(span_seconds(realized_t0, target.end_time), fs, rows) + 1;
        if end_index > rows {
            warn!(path = %input.display(), "less data than requested at the trailing edge");
            end_index = rows;
        }

        let decimated = downsample(&block.data, fs, factor, self.settings.zero_phase)?;
        let trim_start = decimated_index(start_index, factor);
        let trim_end = decimated_index(end_index, factor).min(decimated.nrows());
        let kept = decimated.slice(s![trim_start..trim_end, ..]).to_owned();
        if kept.is_empty() {
            return Err(DasError::NoDataLoaded {
                candidates: candidates.len(),
                start: target.start_time.to_rfc3339(),
                end: target.end_time.to_rfc3339(),
            });
        }

        let new_fs = fs / factor as f64;
        let mut header = block.header.clone();
        header.sample_rate = new_fs;
        header.original_sample_rate = fs;
        header.sample_count = kept.nrows();
        header.start_time = target.start_time;
        header.end_time =
            target.start_time + float_seconds((kept.nrows() - 1) as f64 / new_fs);

        write_block(&out_path, &kept, &header)?;
        debug!(path = %out_path.display(), samples = kept.nrows(), "written");
        Ok(Outcome::Written)
    }
}

/// Nearest row index for a time offset, clamped to the block.
fn nearest_row(seconds: f64, fs: f64, rows: usize) -> usize {
    let idx = (seconds * fs).round();
    if idx <= 0.0 {
        0
    } else {
        (idx as usize).min(rows.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistanceSelection;

    fn settings(input: &Path, output: &Path) -> BatchSettings {
        BatchSettings {
            input_dir: input.to_path_buf(),
            output_dir: output.to_path_buf(),
            factor: 2,
            workers: 2,
            overwrite: false,
            zero_phase: false,
            dry_run: false,
            pad_seconds: 29.0,
            selection: None,
            output_prefix: "downsampled".into(),
            log_level: None,
        }
    }

    #[test]
    fn output_path_mirrors_epoch_and_day() {
        let orch = BatchOrchestrator::new(settings(
            Path::new("/in"),
            Path::new("/out"),
        ));
        let input = Path::new("/in/site_epoch1/2023_02_01/das_20230201_120000.h5");
        let out = orch.output_path_for(input, "20230201_120000.000");
        assert_eq!(
            out,
            Path::new("/out/site_epoch1/2023_02_01/downsampled_20230201_120000.000.h5")
        );
    }

    #[test]
    fn output_path_without_epoch_component() {
        let orch = BatchOrchestrator::new(settings(
            Path::new("/in"),
            Path::new("/out"),
        ));
        let input = Path::new("/in/2023_02_01/das_20230201_120000.h5");
        let out = orch.output_path_for(input, "20230201_120000.000");
        assert_eq!(
            out,
            Path::new("/out/2023_02_01/downsampled_20230201_120000.000.h5")
        );
    }

    #[test]
    fn selection_maps_to_distance_range() {
        let mut s = settings(Path::new("/in"), Path::new("/out"));
        s.selection = Some(DistanceSelection {
            start: 0.0,
            stop: 8000.0,
            nth_channel: 2,
        });
        let selector = s
            .selection
            .as_ref()
            .map_or(ChannelSelector::All, |sel| ChannelSelector::DistanceRange {
                start: sel.start,
                stop: sel.stop,
                nth_channel: sel.nth_channel,
            });
        assert!(matches!(
            selector,
            ChannelSelector::DistanceRange { nth_channel: 2, .. }
        ));
    }

    #[test]
    fn nearest_row_clamps_both_ends() {
        assert_eq!(nearest_row(-1.0, 100.0, 50), 0);
        assert_eq!(nearest_row(0.104, 100.0, 50), 10);
        assert_eq!(nearest_row(10.0, 100.0, 50), 49);
    }
}
