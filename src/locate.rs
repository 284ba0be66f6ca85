//! Candidate-file resolution for a requested time window.
//!
//! Directory layouts are inconsistent across deployments and epochs: day
//! folders appear as `YYYY_MM_DD`, `YYYYMMDD` or `YYYY-MM-DD`, directly
//! under the archive root or nested one level below an epoch directory.
//! The locator is deliberately conservative — it prefers false positives,
//! which the windowed reader later filters by metadata, over silently
//! missing data.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, warn};

use crate::error::{DasError, DasResult};

/// Day-folder naming conventions observed across deployments.
const DATE_FORMATS: [&str; 3] = ["%Y_%m_%d", "%Y%m%d", "%Y-%m-%d"];

/// Slack applied to both window ends before enumerating days and minutes.
const SEARCH_PAD_MINUTES: i64 = 3;

/// Enumerate the files plausibly covering `[t_start, t_end]` under `root`.
///
/// The result is ordered by the minute token that matched (and therefore by
/// embedded timestamp for conventionally named archives), deduplicated, and
/// narrowed by file name only — opening headers and deciding real overlap is
/// the windowed reader's job.
pub fn locate(t_start: DateTime<Utc>, t_end: DateTime<Utc>, root: &Path) -> DasResult<Vec<PathBuf>> {
    let pad = Duration::minutes(SEARCH_PAD_MINUTES);
    let all_files = enumerate_candidates(t_start - pad, t_end + pad, root)?;
    debug!(count = all_files.len(), root = %root.display(), "enumerated candidate files");

    // Coarse textual narrowing: keep files whose *name* carries one of the
    // whole minutes spanned by the padded window.
    let mut seen = BTreeSet::new();
    let mut considered = Vec::new();
    let mut step = t_start - pad;
    let stop = t_end + pad;
    while step <= stop {
        let token = step.format("%Y%m%d_%H%M").to_string();
        for file in &all_files {
            let matches = file
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(&token));
            if matches && seen.insert(file.clone()) {
                considered.push(file.clone());
            }
        }
        step += Duration::minutes(1);
    }

    // Coarser file naming (e.g. 10-minute blocks) defeats the minute filter.
    // Retry at hour granularity with a day token, matched against the whole
    // path so dated directories qualify files with undated names.
    if considered.is_empty() {
        warn!("no files matched at minute granularity, retrying with day tokens");
        let mut step = t_start;
        while step < t_end {
            let token = step.format("%Y%m%d").to_string();
            for file in &all_files {
                let matches = file.to_str().is_some_and(|p| p.contains(&token));
                if matches && seen.insert(file.clone()) {
                    considered.push(file.clone());
                }
            }
            step += Duration::hours(1);
        }
    }

    if considered.is_empty() {
        return Err(DasError::NoFilesFound {
            root: root.to_path_buf(),
            start: t_start.to_rfc3339(),
            end: t_end.to_rfc3339(),
        });
    }
    Ok(considered)
}

/// Flat, deduplicated, sorted list of every `.h5` file in the directories a
/// window might touch: the root itself, day folders in all three naming
/// conventions, and the same day folders one level under any directory whose
/// name contains "epoch".
fn enumerate_candidates(
    padded_start: DateTime<Utc>,
    padded_end: DateTime<Utc>,
    root: &Path,
) -> DasResult<Vec<PathBuf>> {
    let mut files = BTreeSet::new();
    collect_h5_files(root, &mut files);

    let epoch_dirs = epoch_directories(root);

    for fmt in DATE_FORMATS {
        for day in days_between(padded_start.date_naive(), padded_end.date_naive()) {
            let dir_name = day.format(fmt).to_string();
            collect_h5_files(&root.join(&dir_name), &mut files);
            for epoch_dir in &epoch_dirs {
                collect_h5_files(&epoch_dir.join(&dir_name), &mut files);
            }
        }
    }

    Ok(files.into_iter().collect())
}

/// Subdirectories of `root` whose name contains the token "epoch", sorted.
fn epoch_directories(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
        .into_iter()
        .flatten()
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| entry.file_name().to_string_lossy().contains("epoch"))
        .map(|entry| entry.path())
        .collect();
    dirs.sort();
    dirs
}

/// Add every `*.h5` file directly inside `dir` to `out`. A missing or
/// unreadable directory contributes nothing.
fn collect_h5_files(dir: &Path, out: &mut BTreeSet<PathBuf>) {
    for entry in std::fs::read_dir(dir).into_iter().flatten().flatten() {
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "h5") {
            out.insert(path);
        }
    }
}

/// Inclusive day range.
fn days_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = start;
    while day <= end {
        days.push(day);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn finds_underscore_convention_day_directory() {
        let root = TempDir::new().unwrap();
        touch(&root.path().join("2023_02_01/das_20230201_120000.h5"));

        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 11, 59, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 1, 0).unwrap();
        let found = locate(t0, t1, root.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("2023_02_01/das_20230201_120000.h5"));
    }

    #[test]
    fn finds_files_under_epoch_directories() {
        let root = TempDir::new().unwrap();
        touch(&root.path().join("site_epoch2/20230201/das_20230201_120000.h5"));

        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 30).unwrap();
        let found = locate(t0, t1, root.path()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn deduplicates_across_naming_conventions() {
        // The same file reachable through the root listing and a dated
        // directory sweep must appear once.
        let root = TempDir::new().unwrap();
        touch(&root.path().join("das_20230201_120000.h5"));

        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 30).unwrap();
        let found = locate(t0, t1, root.path()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn minute_filter_drops_files_outside_window() {
        let root = TempDir::new().unwrap();
        touch(&root.path().join("2023_02_01/das_20230201_120000.h5"));
        touch(&root.path().join("2023_02_01/das_20230201_180000.h5"));

        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 30).unwrap();
        let found = locate(t0, t1, root.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].to_string_lossy().contains("120000"));
    }

    #[test]
    fn day_token_fallback_matches_directory_names() {
        // Ten-minute blocks named without a minute-aligned token still have
        // to be found through the dated directory.
        let root = TempDir::new().unwrap();
        touch(&root.path().join("20230201/block_0007.h5"));

        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 2, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 8, 0).unwrap();
        let found = locate(t0, t1, root.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("20230201/block_0007.h5"));
    }

    #[test]
    fn day_token_fallback_does_not_duplicate_over_hours() {
        let root = TempDir::new().unwrap();
        touch(&root.path().join("20230201/block_0007.h5"));

        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 6, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2023, 2, 1, 18, 0, 0).unwrap();
        let found = locate(t0, t1, root.path()).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn empty_root_is_no_files_found() {
        let root = TempDir::new().unwrap();
        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2023, 2, 1, 12, 0, 30).unwrap();
        let err = locate(t0, t1, root.path()).unwrap_err();
        assert!(matches!(err, DasError::NoFilesFound { .. }));
    }

    #[test]
    fn spans_a_day_boundary() {
        let root = TempDir::new().unwrap();
        touch(&root.path().join("2023_02_01/das_20230201_235930.h5"));
        touch(&root.path().join("2023_02_02/das_20230202_000000.h5"));

        let t0 = Utc.with_ymd_and_hms(2023, 2, 1, 23, 59, 30).unwrap();
        let t1 = Utc.with_ymd_and_hms(2023, 2, 2, 0, 0, 30).unwrap();
        let found = locate(t0, t1, root.path()).unwrap();
        assert_eq!(found.len(), 2);
    }
}
