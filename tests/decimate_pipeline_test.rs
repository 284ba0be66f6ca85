//! Properties of the decimation pipeline and its pad-then-trim composition
//! contract with the windowed reader.

use ndarray::{s, Array2};
use std::f64::consts::PI;

use das_readers::{decimated_index, downsample};

/// Single-bin amplitude estimate of `x` at `freq` (Hz) for rate `fs`.
fn tone_amplitude(x: &[f64], freq: f64, fs: f64) -> f64 {
    let n = x.len() as f64;
    let (mut re, mut im) = (0.0f64, 0.0f64);
    for (i, &v) in x.iter().enumerate() {
        let phase = 2.0 * PI * freq * i as f64 / fs;
        re += v * phase.cos();
        im += v * phase.sin();
    }
    2.0 * (re * re + im * im).sqrt() / n
}

#[test]
fn test_output_length_is_ceil_of_input_over_factor() {
    for (rows, factor) in [(1000usize, 2usize), (1001, 2), (999, 4), (30_000, 10)] {
        let data = Array2::<f64>::zeros((rows, 2));
        let out = downsample(&data, 1000.0, factor, false).unwrap();
        assert_eq!(out.nrows(), (rows + factor - 1) / factor);
        assert_eq!(out.ncols(), 2);
    }
}

#[test]
fn test_passband_tone_survives_stopband_tone_dies() {
    let fs = 1000.0;
    let n = 10_000;
    // 50 Hz is deep in the passband of a factor-2 decimation; 420 Hz is
    // above the new Nyquist of 250 Hz and must vanish.
    let data = Array2::from_shape_fn((n, 1), |(i, _)| {
        let t = i as f64 / fs;
        (2.0 * PI * 50.0 * t).sin() + 0.5 * (2.0 * PI * 420.0 * t).sin()
    });

    let out = downsample(&data, fs, 2, false).unwrap();
    let new_fs = fs / 2.0;
    // skip the filter transient at the head
    let settled: Vec<f64> = out.column(0).iter().skip(500).copied().collect();

    let kept = tone_amplitude(&settled, 50.0, new_fs);
    assert!((kept - 1.0).abs() < 0.12, "50 Hz amplitude {kept}");

    // 420 Hz aliases to 80 Hz after decimation by 2
    let aliased = tone_amplitude(&settled, 80.0, new_fs);
    assert!(aliased < 1e-3, "aliased amplitude {aliased}");
}

#[test]
fn test_zero_phase_costs_the_same_sample_count() {
    let data = Array2::from_shape_fn((4000, 2), |(i, _)| (i as f64 * 0.01).sin());
    let forward = downsample(&data, 500.0, 4, false).unwrap();
    let both_ways = downsample(&data, 500.0, 4, true).unwrap();
    assert_eq!(forward.dim(), both_ways.dim());
}

#[test]
fn test_pad_then_trim_matches_direct_decimation_length() {
    let fs = 100.0;
    let factor = 2usize;
    let core_rows = 3000usize; // 30 s
    let pad_rows = (29.0 * fs) as usize; // 29 s on each side

    let padded_rows = core_rows + 2 * pad_rows;
    let padded = Array2::from_shape_fn((padded_rows, 1), |(i, _)| {
        (2.0 * PI * 5.0 * i as f64 / fs).sin()
    });
    let core = padded.slice(s![pad_rows..pad_rows + core_rows, ..]).to_owned();

    let direct = downsample(&core, fs, factor, false).unwrap();

    let padded_out = downsample(&padded, fs, factor, false).unwrap();
    let trim_start = decimated_index(pad_rows, factor);
    let trim_end = decimated_index(pad_rows + core_rows, factor);
    let trimmed = padded_out.slice(s![trim_start..trim_end, ..]);

    // identical length up to an off-by-one at the trailing edge
    let diff = direct.nrows() as i64 - trimmed.nrows() as i64;
    assert!(diff.abs() <= 1, "direct {} vs trimmed {}", direct.nrows(), trimmed.nrows());
}

#[test]
fn test_padding_suppresses_edge_transients() {
    // The same core signal decimated with and without padding: far from the
    // edges the two agree, at the leading edge the unpadded version rings.
    let fs = 100.0;
    let factor = 2usize;
    let core_rows = 2000usize;
    let pad_rows = 500usize;

    let total = core_rows + 2 * pad_rows;
    let padded = Array2::from_shape_fn((total, 1), |(i, _)| {
        (2.0 * PI * 3.0 * i as f64 / fs).cos()
    });
    let core = padded.slice(s![pad_rows..pad_rows + core_rows, ..]).to_owned();

    let direct = downsample(&core, fs, factor, false).unwrap();
    let padded_out = downsample(&padded, fs, factor, false).unwrap();
    let trim_start = decimated_index(pad_rows, factor);

    // the unpadded filter starts cold: its first retained samples disagree
    // with the warmed-up padded run
    let cold = (direct[[0, 0]] - padded_out[[trim_start, 0]]).abs();
    assert!(cold > 1e-3, "expected a cold-start transient, got {cold}");

    // deep inside the window both runs have settled onto the same samples
    let mid = direct.nrows() / 2;
    let settled = (direct[[mid, 0]] - padded_out[[trim_start + mid, 0]]).abs();
    assert!(settled < 1e-6, "settled mismatch {settled}");
}
