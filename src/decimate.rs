//! Anti-alias filtering and integer-factor downsampling.
//!
//! Decimation filters a block with a steep Chebyshev Type II low pass whose
//! cutoff sits at the new Nyquist, then keeps every `factor`-th sample. The
//! Type II design guarantees no passband-adjacent energy survives above the
//! new Nyquist, which a Butterworth's gentle rolloff would not — at the cost
//! of a sharper, less linear transition band. Callers who care about signal
//! right at the new Nyquist should decimate less aggressively.
//!
//! Filters of very high order go numerically unstable, so the design loop
//! relaxes the passband edge by 1% per iteration until the estimated order
//! drops to 12 or below. The resulting cascade of second-order sections is
//! applied per channel, forward-only by default or forward-backward for
//! zero group delay at twice the cost.
//!
//! Callers composing decimation with windowed reads are expected to pad the
//! request on both ends and trim afterwards with [`decimated_index`]; see
//! the batch driver. Trimming before decimating desynchronizes the output
//! timestamp grid, and decimating without padding smears filter transients
//! into the retained window.

use std::f64::consts::{FRAC_PI_2, PI};

use biquad::{Biquad, Coefficients, DirectForm2Transposed};
use ndarray::{Array2, Axis};
use num_complex::Complex64;
use tracing::debug;

use crate::error::{DasError, DasResult};

/// Maximum passband ripple of the anti-alias filter, dB.
const PASSBAND_RIPPLE_DB: f64 = 1.0;
/// Minimum stopband attenuation of the anti-alias filter, dB.
const STOPBAND_ATTEN_DB: f64 = 96.0;
/// Largest filter order accepted as numerically stable.
const MAX_ORDER: usize = 12;
/// Bail-out for the passband relaxation loop.
const MAX_DESIGN_ITERATIONS: usize = 500;

/// Bilinear-transform sampling constant (2 * fs with fs = 2).
const FS2: f64 = 4.0;

/// Low-pass filter and keep every `factor`-th sample of every channel.
///
/// The output has `ceil(sample_count / factor)` rows. Deterministic: the
/// same input and factor always produce the same filter and the same
/// output; no state is carried across calls.
pub fn downsample(
    data: &Array2<f64>,
    sample_rate: f64,
    factor: usize,
    zero_phase: bool,
) -> DasResult<Array2<f64>> {
    if factor == 0 {
        return Err(DasError::FilterDesign("decimation factor must be >= 1".into()));
    }
    if factor == 1 {
        return Ok(data.clone());
    }
    debug!(
        from_hz = sample_rate,
        to_hz = sample_rate / factor as f64,
        factor,
        "downsampling"
    );

    let sections = design_decimation_filter(factor)?;
    let rows_in = data.nrows();
    let rows_out = (rows_in + factor - 1) / factor;
    let mut out = Array2::<f64>::zeros((rows_out, data.ncols()));

    for (j, col) in data.axis_iter(Axis(1)).enumerate() {
        let x = col.to_vec();
        let y = if zero_phase {
            filter_zero_phase(&sections, &x)
        } else {
            filter_forward(&sections, &x)
        };
        for (k, i) in (0..rows_in).step_by(factor).enumerate() {
            out[[k, j]] = y[i];
        }
    }
    Ok(out)
}

/// Map a pre-decimation boundary index onto the decimated grid (flooring).
///
/// This is the trim half of the pad-then-trim contract: pad the window
/// before decimating, then cut both boundary indices through this function.
pub fn decimated_index(index: usize, factor: usize) -> usize {
    index / factor
}

/// Design the anti-alias low pass for one decimation factor.
///
/// Target cutoff is the new Nyquist, `old_fs / factor / 2`, i.e. a
/// normalized stopband edge of `1/factor`. Starting from an absurdly high
/// order target, the passband edge shrinks 1% per iteration until the
/// estimated order is stable (≤ 12).
fn design_decimation_filter(factor: usize) -> DasResult<Vec<Coefficients<f64>>> {
    let ws = 1.0 / factor as f64;
    let mut wp = ws;
    let mut order = usize::MAX;
    let mut wn = ws;

    let mut iterations = 0;
    while order > MAX_ORDER {
        iterations += 1;
        if iterations > MAX_DESIGN_ITERATIONS {
            return Err(DasError::FilterDesign(format!(
                "no stable order <= {MAX_ORDER} found for decimation factor {factor}"
            )));
        }
        wp *= 0.99;
        (order, wn) = cheb2ord_lowpass(wp, ws, PASSBAND_RIPPLE_DB, STOPBAND_ATTEN_DB);
    }
    debug!(order, wn, "anti-alias filter designed");
    Ok(cheby2_lowpass_sections(order, STOPBAND_ATTEN_DB, wn))
}

/// Minimum Chebyshev II order meeting `rp` dB passband ripple at `wp` and
/// `rs` dB attenuation at `ws` (both normalized to Nyquist = 1), plus the
/// natural (stopband-edge) frequency to design with.
fn cheb2ord_lowpass(wp: f64, ws: f64, rp: f64, rs: f64) -> (usize, f64) {
    // Pre-warp to analog frequencies for the bilinear transform.
    let passb = (FRAC_PI_2 * wp).tan();
    let stopb = (FRAC_PI_2 * ws).tan();
    let nat = stopb / passb;

    let gstop = 10f64.powf(0.1 * rs);
    let gpass = 10f64.powf(0.1 * rp);
    let arg = ((gstop - 1.0) / (gpass - 1.0)).sqrt();
    let order = (arg.acosh() / nat.acosh()).ceil().max(1.0) as usize;

    // With the order fixed, place the stopband edge so the passband
    // requirement is met exactly, then de-warp.
    let natural = passb * (arg.acosh() / order as f64).cosh();
    let wn = (2.0 / PI) * natural.atan();
    (order, wn)
}

/// Chebyshev Type II low pass as DC-normalized second-order sections.
///
/// Analog prototype poles/zeros, scaled to the pre-warped cutoff, bilinear
/// transformed section by section. Each conjugate pole pair keeps the
/// conjugate zero pair of the same prototype angle, which makes the pairing
/// deterministic; an odd order contributes one first-order tail section.
fn cheby2_lowpass_sections(order: usize, rs: f64, wn: f64) -> Vec<Coefficients<f64>> {
    // Pre-warped analog cutoff: 2 * fs * tan(pi * wn / fs) with fs = 2.
    let warped = 4.0 * (FRAC_PI_2 * wn).tan();

    let de = 1.0 / (10f64.powf(0.1 * rs) - 1.0).sqrt();
    let mu = (1.0 / de).asinh() / order as f64;

    let mut sections = Vec::with_capacity((order + 1) / 2);
    let mut m = 1usize;
    while m < order {
        let theta = PI * m as f64 / (2.0 * order as f64);
        // Pole: unit-circle Butterworth point squeezed onto the Chebyshev
        // ellipse, then inverted (Type II), then scaled to the cutoff.
        let p0 = -Complex64::from_polar(1.0, theta);
        let pole = Complex64::new(mu.sinh() * p0.re, mu.cosh() * p0.im).inv() * warped;
        // Zero: purely imaginary, on the same prototype angle.
        let zero_freq = warped / theta.sin();
        sections.push(biquad_section(pole, zero_freq));
        m += 2;
    }
    if order % 2 == 1 {
        let real_pole = -warped / mu.sinh();
        sections.push(first_order_section(real_pole));
    }
    sections
}

/// Bilinear transform of one conjugate pole pair plus conjugate zero pair,
/// DC gain normalized to unity.
fn biquad_section(pole: Complex64, zero_freq: f64) -> Coefficients<f64> {
    // Analog section: (s^2 + wz^2) / (s^2 + B s + C)
    let b_s = -2.0 * pole.re;
    let c_s = pole.norm_sqr();
    let wz2 = zero_freq * zero_freq;
    let f2 = FS2 * FS2;

    let b0 = f2 + wz2;
    let b1 = 2.0 * (wz2 - f2);
    let b2 = f2 + wz2;
    let a0 = f2 + b_s * FS2 + c_s;
    let a1 = 2.0 * (c_s - f2);
    let a2 = f2 - b_s * FS2 + c_s;

    let dc = (a0 + a1 + a2) / (b0 + b1 + b2);
    Coefficients {
        a1: a1 / a0,
        a2: a2 / a0,
        b0: b0 * dc / a0,
        b1: b1 * dc / a0,
        b2: b2 * dc / a0,
    }
}

/// Bilinear transform of the odd-order real pole (zero at infinity),
/// DC gain normalized to unity.
fn first_order_section(real_pole: f64) -> Coefficients<f64> {
    // Analog section: 1 / (s + A)
    let a = -real_pole;
    let a0 = FS2 + a;
    let a1 = a - FS2;
    let dc = (a0 + a1) / 2.0;
    Coefficients {
        a1: a1 / a0,
        a2: 0.0,
        b0: dc / a0,
        b1: dc / a0,
        b2: 0.0,
    }
}

/// Run the cascade forward over one channel.
fn filter_forward(sections: &[Coefficients<f64>], input: &[f64]) -> Vec<f64> {
    let mut stages: Vec<DirectForm2Transposed<f64>> = sections
        .iter()
        .map(|&c| DirectForm2Transposed::<f64>::new(c))
        .collect();
    input
        .iter()
        .map(|&x| stages.iter_mut().fold(x, |acc, stage| stage.run(acc)))
        .collect()
}

/// Forward-backward pass for zero group delay.
///
/// The signal is odd-extended on both ends so the filter state has settled
/// before the retained samples begin, then filtered once in each direction.
fn filter_zero_phase(sections: &[Coefficients<f64>], input: &[f64]) -> Vec<f64> {
    let n = input.len();
    if n < 2 {
        return input.to_vec();
    }
    let padlen = (3 * (2 * sections.len() + 1)).min(n - 1);

    let mut extended = Vec::with_capacity(n + 2 * padlen);
    for i in (1..=padlen).rev() {
        extended.push(2.0 * input[0] - input[i]);
    }
    extended.extend_from_slice(input);
    for i in 0..padlen {
        extended.push(2.0 * input[n - 1] - input[n - 2 - i]);
    }

    let forward = filter_forward(sections, &extended);
    let reversed: Vec<f64> = forward.into_iter().rev().collect();
    let backward = filter_forward(sections, &reversed);
    backward
        .into_iter()
        .rev()
        .skip(padlen)
        .take(n)
        .collect()
}
