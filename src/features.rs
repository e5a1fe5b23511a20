//! Per-window scalar feature extraction (spec §4.4). A pure function of
//! (preprocessed wideband signal, its alpha/beta derivatives, sample rate);
//! retains no state beyond the filter bank it borrows for the power
//! spectrum.

use crate::filter::{band_power, hilbert_envelope_mean, FilterBank};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandPowers {
    pub delta: f64,
    pub theta: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features {
    pub alpha_power: f64,
    pub beta_power: f64,
    pub band_powers: BandPowers,
    pub rms: f64,
    pub variance: f64,
    pub spectral_edge_95: f64,
    pub median_freq: f64,
    pub envelope_mean: f64,
}

fn mean_square(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64
}

fn sample_variance(x: &[f64]) -> f64 {
    if x.len() < 2 {
        return 0.0;
    }
    let mean = x.iter().sum::<f64>() / x.len() as f64;
    let sum_sq: f64 = x.iter().map(|v| (v - mean).powi(2)).sum();
    sum_sq / (x.len() - 1) as f64
}

/// Smallest frequency whose cumulative PSD mass reaches `fraction` of the
/// total (spec §4.4 `spectral_edge_95`/`median_freq`). Zero total power
/// returns 0 (guarded division, spec §4.4).
fn cumulative_edge(freqs: &[f64], psd: &[f64], fraction: f64) -> f64 {
    let total: f64 = psd.iter().sum();
    if total <= 0.0 || freqs.is_empty() {
        return 0.0;
    }
    let mut running = 0.0;
    for (f, p) in freqs.iter().zip(psd.iter()) {
        running += p;
        if running / total >= fraction {
            return *f;
        }
    }
    *freqs.last().unwrap()
}

/// Compute all per-channel features. `preprocessed` is post-notch,
/// post-wideband-bandpass (spec §9 resolves the ambiguity between raw and
/// preprocessed in favor of preprocessed for the spectral-edge features).
pub fn compute_features(
    bank: &FilterBank,
    preprocessed: &[f64],
    alpha_signal: &[f64],
    beta_signal: &[f64],
) -> Features {
    let alpha_power = mean_square(alpha_signal);
    let beta_power = mean_square(beta_signal);
    let rms = mean_square(preprocessed).sqrt();
    let variance = sample_variance(preprocessed);
    let envelope_mean = hilbert_envelope_mean(alpha_signal);

    let (freqs, psd) = bank.default_power_spectrum(preprocessed);
    let nyquist = bank.fs / 2.0;
    let band_powers = BandPowers {
        delta: band_power(&freqs, &psd, 0.5, 4.0),
        theta: band_power(&freqs, &psd, 4.0, 8.0),
        alpha: band_power(&freqs, &psd, 8.0, 12.0),
        beta: band_power(&freqs, &psd, 13.0, 30.0),
        gamma: band_power(&freqs, &psd, 30.0, 45.0_f64.min(nyquist)),
    };
    let spectral_edge_95 = cumulative_edge(&freqs, &psd, 0.95);
    let median_freq = cumulative_edge(&freqs, &psd, 0.5);

    Features {
        alpha_power,
        beta_power,
        band_powers,
        rms,
        variance,
        spectral_edge_95,
        median_freq,
        envelope_mean,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalConfig;
    use std::f64::consts::TAU;

    fn sine(fs: f64, freq: f64, n: usize, amplitude: f64) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (TAU * freq * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn constant_signal_has_zero_alpha_power() {
        let signal = SignalConfig::default();
        let bank = FilterBank::new(&signal).unwrap();
        let n = signal.window_len();
        let constant = vec![0.0; n];
        let (pre, _) = bank.preprocess(&constant);
        let (alpha, _) = bank.extract_alpha(&pre);
        let (beta, _) = bank.extract_beta(&pre);
        let features = compute_features(&bank, &pre, &alpha, &beta);
        assert!(features.alpha_power.abs() < 1e-9);
    }

    #[test]
    fn ten_hz_sine_yields_nonzero_alpha_power_and_edges() {
        let signal = SignalConfig::default();
        let bank = FilterBank::new(&signal).unwrap();
        let n = signal.window_len();
        let raw = sine(signal.sampling_rate, 10.0, n, 40.0);
        let (pre, _) = bank.preprocess(&raw);
        let (alpha, _) = bank.extract_alpha(&pre);
        let (beta, _) = bank.extract_beta(&pre);
        let features = compute_features(&bank, &pre, &alpha, &beta);
        assert!(features.alpha_power > 0.0);
        assert!(features.median_freq > 0.0);
        assert!(features.spectral_edge_95 >= features.median_freq);
        assert!(features.envelope_mean > 0.0);
    }
}
