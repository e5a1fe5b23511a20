//! Signal quality and artifact assessment (spec §4.5). Per-channel running
//! state is limited to a bounded history of recent window variances used
//! for the high-variance baseline; everything else is a pure function of
//! the current window.

use crate::config::ArtifactConfig;
use crate::filter::{band_power, FilterBank};
use crate::sample::ArtifactTag;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    pub snr_db: f64,
    pub artifact_tag: ArtifactTag,
    pub quality_score: f64,
}

#[derive(Debug, Clone, Default)]
struct ChannelHistory {
    variances: VecDeque<f64>,
}

impl ChannelHistory {
    fn median(&self) -> Option<f64> {
        if self.variances.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.variances.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        })
    }

    fn push(&mut self, variance: f64, capacity: usize) {
        if self.variances.len() == capacity {
            self.variances.pop_front();
        }
        self.variances.push_back(variance);
    }
}

/// Owns the running per-channel variance history used for the
/// high-variance baseline (spec §4.5). Both channels share one assessor
/// since they share the same artifact configuration.
#[derive(Debug, Clone, Default)]
pub struct QualityAssessor {
    left: ChannelHistory,
    right: ChannelHistory,
}

fn raw_variance(raw: &[f64]) -> f64 {
    if raw.len() < 2 {
        return 0.0;
    }
    let mean = raw.iter().sum::<f64>() / raw.len() as f64;
    raw.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (raw.len() - 1) as f64
}

fn saturation_fraction(raw: &[f64], adc_max: u16) -> f64 {
    if raw.is_empty() {
        return 0.0;
    }
    let hits = raw
        .iter()
        .filter(|&&v| v <= 0.0 || v >= adc_max as f64)
        .count();
    hits as f64 / raw.len() as f64
}

/// Core per-channel assessment, taking the channel's running history
/// directly so the two channels can be assessed on separate threads
/// (spec §5's worker-pool extension point) without fighting over `&mut
/// self`. `raw` is the unfiltered ADC samples, used both directly
/// (saturation/variance/low-signal) and as the basis for the
/// line-noise/SNR power spectrum; `alpha_power`/`beta_power` come from the
/// feature extractor for the same window.
fn assess_channel(
    history: &mut ChannelHistory,
    raw: &[f64],
    alpha_power: f64,
    beta_power: f64,
    bank: &FilterBank,
    config: &ArtifactConfig,
    line_freq: f64,
    adc_max: u16,
) -> QualityReport {
    if alpha_power.is_nan()
        || alpha_power.is_infinite()
        || beta_power.is_nan()
        || beta_power.is_infinite()
        || raw.iter().any(|v| !v.is_finite())
    {
        return QualityReport {
            snr_db: 0.0,
            artifact_tag: ArtifactTag::HighVariance,
            quality_score: 0.0,
        };
    }

    // Computed on the raw signal, not `preprocessed`: the notch/bandpass
    // cascade already attenuates exactly the line noise and
    // out-of-band energy this assessment exists to detect.
    let (freqs, psd) = bank.default_power_spectrum(raw);
    let noise_power = band_power(&freqs, &psd, 30.0, 40.0);
    let line_power = band_power(&freqs, &psd, line_freq - 1.0, line_freq + 1.0);

    let sat_fraction = saturation_fraction(raw, adc_max);
    let variance = raw_variance(raw);

    let running_median = history.median();
    history.push(variance, config.median_window);

    let saturation = sat_fraction > config.saturation_threshold;
    let muscle = beta_power > config.muscle_beta_threshold;
    let line_noise_ratio = line_power / (alpha_power + 1e-12);
    let line_noise = line_noise_ratio > config.line_noise_threshold_ratio;
    let high_variance = running_median
        .map(|m| variance > config.variance_multiplier * m)
        .unwrap_or(false);
    let low_signal = variance < config.low_signal_variance_threshold;

    let mut artifact_tag = ArtifactTag::Clean;
    for (tripped, tag) in [
        (saturation, ArtifactTag::Saturation),
        (muscle, ArtifactTag::MuscleArtifact),
        (line_noise, ArtifactTag::LineNoise),
        (high_variance, ArtifactTag::HighVariance),
        (low_signal, ArtifactTag::LowSignal),
    ] {
        if tripped {
            artifact_tag = ArtifactTag::strongest(artifact_tag, tag);
        }
    }

    let snr_db = if noise_power <= 0.0 {
        60.0
    } else {
        (10.0 * (alpha_power / noise_power).log10()).clamp(-120.0, 60.0)
    };

    let artifact_indicator = if artifact_tag.is_clean() { 0.0 } else { 1.0 };
    let snr_penalty = if snr_db < 10.0 { (10.0 - snr_db) * 3.0 } else { 0.0 };
    let quality_score = (100.0
        - sat_fraction * 40.0
        - artifact_indicator * 25.0
        - snr_penalty
        - line_noise_ratio * 20.0)
        .clamp(0.0, 100.0);

    QualityReport {
        snr_db,
        artifact_tag,
        quality_score,
    }
}

impl QualityAssessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assess one channel's window. `left_channel` selects which channel's
    /// running history to use.
    pub fn assess(
        &mut self,
        left_channel: bool,
        raw: &[f64],
        alpha_power: f64,
        beta_power: f64,
        bank: &FilterBank,
        config: &ArtifactConfig,
        line_freq: f64,
        adc_max: u16,
    ) -> QualityReport {
        let history = if left_channel { &mut self.left } else { &mut self.right };
        assess_channel(history, raw, alpha_power, beta_power, bank, config, line_freq, adc_max)
    }

    /// Assess both channels for one window. When `parallel` is set, the two
    /// channels run on separate threads via `std::thread::scope` (spec §5's
    /// documented worker-pool extension point: still at most one window in
    /// flight, still returned/emitted in order) since each channel's
    /// running history is a disjoint field and needs no synchronization.
    #[allow(clippy::too_many_arguments)]
    pub fn assess_pair(
        &mut self,
        left_raw: &[f64],
        right_raw: &[f64],
        left_alpha_power: f64,
        right_alpha_power: f64,
        left_beta_power: f64,
        right_beta_power: f64,
        bank: &FilterBank,
        config: &ArtifactConfig,
        line_freq: f64,
        adc_max: u16,
        parallel: bool,
    ) -> (QualityReport, QualityReport) {
        if !parallel {
            let left = assess_channel(
                &mut self.left,
                left_raw,
                left_alpha_power,
                left_beta_power,
                bank,
                config,
                line_freq,
                adc_max,
            );
            let right = assess_channel(
                &mut self.right,
                right_raw,
                right_alpha_power,
                right_beta_power,
                bank,
                config,
                line_freq,
                adc_max,
            );
            return (left, right);
        }

        let QualityAssessor { left, right } = self;
        std::thread::scope(|scope| {
            let right_handle = scope.spawn(|| {
                assess_channel(
                    right,
                    right_raw,
                    right_alpha_power,
                    right_beta_power,
                    bank,
                    config,
                    line_freq,
                    adc_max,
                )
            });
            let left_report = assess_channel(
                left,
                left_raw,
                left_alpha_power,
                left_beta_power,
                bank,
                config,
                line_freq,
                adc_max,
            );
            let right_report = right_handle.join().expect("quality assessment thread panicked");
            (left_report, right_report)
        })
    }
}
