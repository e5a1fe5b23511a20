//! Second-order-section (biquad) filter bank and spectral estimation
//! (spec §4.3). Biquad coefficient construction is grounded on
//! `fundsp::biquad::BiquadCoefs::butter_lowpass`, extended here to bandpass
//! and notch sections using the RBJ Audio EQ Cookbook formulas; Welch PSD
//! estimation follows the Hann-window + `rustfft`/`realfft` pattern used by
//! the `brain_waves_fft` power-spectrum helper in the wider EEG tooling
//! ecosystem this crate draws on.

use crate::config::SignalConfig;
use crate::error::FilterConfigError;
use num_complex::Complex64;
use realfft::RealFftPlanner;
use rustfft::FftPlanner;
use std::f64::consts::{PI, TAU};

/// Coefficients of a single second-order IIR section, `a0` normalized to 1.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BiquadCoefs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoefs {
    /// Constant 0 dB peak-gain bandpass resonator.
    pub fn bandpass(fs: f64, center: f64, q: f64) -> Self {
        let w0 = TAU * center / fs;
        let alpha = w0.sin() / (2.0 * q);
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b0: alpha / a0,
            b1: 0.0,
            b2: -alpha / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Narrow notch (band-reject) section.
    pub fn notch(fs: f64, center: f64, q: f64) -> Self {
        let w0 = TAU * center / fs;
        let alpha = w0.sin() / (2.0 * q);
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b0: 1.0 / a0,
            b1: -2.0 * cos_w0 / a0,
            b2: 1.0 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
        }
    }
}

/// Direct Form I state for one biquad section, reset at the start of every
/// window (edge transients over a finite window are expected, spec §4.3).
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl BiquadState {
    #[inline]
    fn tick(&mut self, c: &BiquadCoefs, x0: f64) -> f64 {
        let y0 = c.b0 * x0 + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x0;
        self.y2 = self.y1;
        self.y1 = y0;
        y0
    }
}

/// A cascade of second-order sections.
pub type Sos = Vec<BiquadCoefs>;

/// Build a bandpass cascade of `(order / 2).max(1)` sections whose Q values
/// are staggered across the Butterworth pole angles, approximating a
/// higher-order Butterworth bandpass from repeated constant-gain
/// resonators. A documented simplification, not an exact Butterworth
/// realization; recorded in DESIGN.md.
fn bandpass_cascade(fs: f64, low: f64, high: f64, order: usize) -> Sos {
    let sections = (order / 2).max(1);
    let center = (low * high).sqrt();
    let bandwidth = (high - low).max(1e-6);
    let base_q = center / bandwidth;
    (0..sections)
        .map(|i| {
            let theta = PI * (2 * i + 1) as f64 / (4.0 * sections as f64);
            let q = (base_q / (2.0 * theta.sin())).max(1e-3);
            BiquadCoefs::bandpass(fs, center, q)
        })
        .collect()
}

fn apply_cascade_forward(sos: &Sos, x: &[f64]) -> Vec<f64> {
    let mut states = vec![BiquadState::default(); sos.len()];
    x.iter()
        .map(|&x0| {
            let mut v = x0;
            for (c, s) in sos.iter().zip(states.iter_mut()) {
                v = s.tick(c, v);
            }
            v
        })
        .collect()
}

/// Zero-phase (forward-backward) application of an SOS cascade over a
/// finite window (spec §4.3). If `x` is shorter than `3 * order * 2`
/// samples the filter bank has insufficient support; `x` is returned
/// unmodified with the `undersampled` flag set (the scheduler's window
/// invariant makes this unreachable in practice).
pub fn apply(sos: &Sos, x: &[f64], order: usize) -> (Vec<f64>, bool) {
    if x.len() < 3 * order * 2 {
        return (x.to_vec(), true);
    }
    let forward = apply_cascade_forward(sos, x);
    let mut reversed = forward;
    reversed.reverse();
    let mut backward = apply_cascade_forward(sos, &reversed);
    backward.reverse();
    (backward, false)
}

fn hann_window(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (TAU * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Welch's method: averaged periodogram with 50% overlap and a Hann window
/// (spec §4.3). Returns one-sided `(freqs, psd)`.
pub fn power_spectrum(x: &[f64], fs: f64, nperseg: usize) -> (Vec<f64>, Vec<f64>) {
    let n = x.len();
    if n == 0 || fs <= 0.0 {
        return (Vec::new(), Vec::new());
    }
    let nperseg = nperseg.clamp(2, n.max(2));
    let hop = (nperseg / 2).max(1);
    let window = hann_window(nperseg);
    let win_sq_sum: f64 = window.iter().map(|w| w * w).sum::<f64>().max(1e-300);

    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(nperseg);
    let bins = nperseg / 2 + 1;
    let mut accum = vec![0.0f64; bins];
    let mut input = r2c.make_input_vec();
    let mut output = r2c.make_output_vec();
    let mut segments = 0usize;

    let mut start = 0;
    while start + nperseg <= n {
        for i in 0..nperseg {
            input[i] = x[start + i] * window[i];
        }
        if r2c.process(&mut input, &mut output).is_ok() {
            for k in 0..bins {
                accum[k] += output[k].norm_sqr();
            }
            segments += 1;
        }
        start += hop;
    }

    if segments == 0 {
        for i in 0..n {
            input[i] = x[i] * window.get(i).copied().unwrap_or(0.0);
        }
        for v in input.iter_mut().skip(n) {
            *v = 0.0;
        }
        if r2c.process(&mut input, &mut output).is_ok() {
            for k in 0..bins {
                accum[k] += output[k].norm_sqr();
            }
            segments = 1;
        }
    }

    let scale = 1.0 / (segments.max(1) as f64 * fs * win_sq_sum);
    let mut psd = vec![0.0; bins];
    for (k, slot) in psd.iter_mut().enumerate() {
        let one_sided = if k == 0 || (nperseg % 2 == 0 && k == bins - 1) {
            1.0
        } else {
            2.0
        };
        *slot = accum[k] * scale * one_sided;
    }
    let freqs: Vec<f64> = (0..bins).map(|k| k as f64 * fs / nperseg as f64).collect();
    (freqs, psd)
}

/// Trapezoidal integration of `psd` over `[f_lo, f_hi]`, linearly
/// interpolating at the band edges.
pub fn band_power(freqs: &[f64], psd: &[f64], f_lo: f64, f_hi: f64) -> f64 {
    if freqs.len() < 2 || freqs.len() != psd.len() {
        return 0.0;
    }
    let interp = |f0: f64, f1: f64, p0: f64, p1: f64, f: f64| -> f64 {
        if (f1 - f0).abs() < 1e-12 {
            p0
        } else {
            p0 + (p1 - p0) * (f - f0) / (f1 - f0)
        }
    };
    let mut total = 0.0;
    for i in 0..freqs.len() - 1 {
        let (f0, f1) = (freqs[i], freqs[i + 1]);
        if f1 < f_lo || f0 > f_hi {
            continue;
        }
        let lo = f0.max(f_lo);
        let hi = f1.min(f_hi);
        if hi <= lo {
            continue;
        }
        let p_lo = interp(f0, f1, psd[i], psd[i + 1], lo);
        let p_hi = interp(f0, f1, psd[i], psd[i + 1], hi);
        total += 0.5 * (p_lo + p_hi) * (hi - lo);
    }
    total
}

/// Magnitude of the analytic signal (Hilbert envelope), computed per
/// window via a full-length complex FFT/IFFT (spec §9: "streaming Hilbert
/// vs windowed Hilbert" — this crate only promises a scalar window mean,
/// never point-wise continuity across window boundaries).
pub fn hilbert_envelope_mean(x: &[f64]) -> f64 {
    let n = x.len();
    if n == 0 {
        return 0.0;
    }
    let mut buf: Vec<Complex64> = x.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buf);

    let mut h = vec![0.0f64; n];
    h[0] = 1.0;
    if n % 2 == 0 {
        h[n / 2] = 1.0;
        for v in h.iter_mut().take(n / 2).skip(1) {
            *v = 2.0;
        }
    } else {
        for v in h.iter_mut().take(n.div_ceil(2)).skip(1) {
            *v = 2.0;
        }
    }
    for (c, hk) in buf.iter_mut().zip(h.iter()) {
        *c *= *hk;
    }

    let ifft = planner.plan_fft_inverse(n);
    ifft.process(&mut buf);
    let scale = 1.0 / n as f64;
    buf.iter().map(|c| (*c * scale).norm()).sum::<f64>() / n as f64
}

/// The immutable, precomputed filter cascades shared read-only across
/// windows (spec §4.3, §5 "Shared resources").
#[derive(Debug, Clone)]
pub struct FilterBank {
    pub fs: f64,
    pub order: usize,
    notch: Sos,
    bandpass_wide: Sos,
    alpha: Sos,
    beta: Sos,
}

impl FilterBank {
    pub fn new(signal: &SignalConfig) -> Result<Self, FilterConfigError> {
        for (name, (low, high)) in [
            ("bandpass", signal.bandpass),
            ("alpha_band", signal.alpha_band),
            ("beta_band", signal.beta_band),
        ] {
            if !(low > 0.0 && high > low) {
                return Err(FilterConfigError::InvalidBand { name, low, high });
            }
        }
        let max_cutoff = signal.max_cutoff();
        if signal.sampling_rate <= 2.0 * max_cutoff {
            return Err(FilterConfigError::NyquistViolation {
                fs: signal.sampling_rate,
                max_cutoff,
            });
        }

        Ok(Self {
            fs: signal.sampling_rate,
            order: signal.filter_order,
            notch: vec![BiquadCoefs::notch(
                signal.sampling_rate,
                signal.notch_freq,
                signal.notch_q,
            )],
            bandpass_wide: bandpass_cascade(
                signal.sampling_rate,
                signal.bandpass.0,
                signal.bandpass.1,
                signal.filter_order,
            ),
            alpha: bandpass_cascade(
                signal.sampling_rate,
                signal.alpha_band.0,
                signal.alpha_band.1,
                signal.filter_order,
            ),
            beta: bandpass_cascade(
                signal.sampling_rate,
                signal.beta_band.0,
                signal.beta_band.1,
                signal.filter_order,
            ),
        })
    }

    /// Subtract the mean, then apply the notch and wideband bandpass
    /// (spec §4.3 `preprocess`).
    pub fn preprocess(&self, x: &[f64]) -> (Vec<f64>, bool) {
        let mean = if x.is_empty() {
            0.0
        } else {
            x.iter().sum::<f64>() / x.len() as f64
        };
        let centered: Vec<f64> = x.iter().map(|v| v - mean).collect();
        let (notched, u1) = apply(&self.notch, &centered, self.order);
        let (wide, u2) = apply(&self.bandpass_wide, &notched, self.order);
        (wide, u1 || u2)
    }

    pub fn extract_alpha(&self, x: &[f64]) -> (Vec<f64>, bool) {
        apply(&self.alpha, x, self.order)
    }

    pub fn extract_beta(&self, x: &[f64]) -> (Vec<f64>, bool) {
        apply(&self.beta, x, self.order)
    }

    /// `power_spectrum` with the default `nperseg = min(N, fs)` (spec §4.3).
    pub fn default_power_spectrum(&self, x: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let nperseg = x.len().min(self.fs.round().max(2.0) as usize);
        power_spectrum(x, self.fs, nperseg)
    }
}
