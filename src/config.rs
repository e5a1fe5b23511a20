//! Typed, immutable engine configuration (spec §4.8, §9 "Dynamic
//! configuration <-> typed config record").
//!
//! Every option is a field of [`EngineConfig`], constructed exclusively
//! through [`EngineConfigBuilder`]. `build()` validates bands and sample
//! rate and fails fast with [`FilterConfigError`] rather than letting a bad
//! value surface mid-run. There is no global/static config: components
//! receive the slices they need at construction, per spec's "Global mutable
//! configuration" redesign note.

use crate::error::FilterConfigError;

/// Endpoint selection for the frame source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    Auto,
    Named(String),
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: PortSelector,
    pub baud_rate: u32,
    pub timeout_s: f64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_s: f64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: PortSelector::Auto,
            baud_rate: 115_200,
            timeout_s: 1.0,
            max_reconnect_attempts: 5,
            reconnect_delay_s: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub sampling_rate: f64,
    pub window_size_s: f64,
    pub window_overlap: f64,
    pub notch_freq: f64,
    pub notch_q: f64,
    pub bandpass: (f64, f64),
    pub alpha_band: (f64, f64),
    pub beta_band: (f64, f64),
    pub filter_order: usize,
    pub adc_max: u16,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 250.0,
            window_size_s: 2.0,
            window_overlap: 0.5,
            notch_freq: 50.0,
            notch_q: 30.0,
            bandpass: (1.0, 40.0),
            alpha_band: (8.0, 12.0),
            beta_band: (13.0, 30.0),
            filter_order: 4,
            adc_max: crate::sample::DEFAULT_ADC_MAX,
        }
    }
}

impl SignalConfig {
    /// N = round(fs * window_seconds).
    pub fn window_len(&self) -> usize {
        (self.sampling_rate * self.window_size_s).round() as usize
    }

    /// H = max(1, round(N * (1 - overlap))).
    pub fn hop_len(&self) -> usize {
        let n = self.window_len() as f64;
        ((n * (1.0 - self.window_overlap)).round() as usize).max(1)
    }

    /// Smallest window length that gives the filter cascades enough support:
    /// N >= 4 * sections * max(1, fs / lowest_cutoff), per spec §3, where
    /// `sections = (filter_order / 2).max(1)` matches `bandpass_cascade`'s
    /// own second-order-section count. The wideband bandpass's 1 Hz knee is
    /// excluded here: its bandwidth (and hence Q) is so wide that it settles
    /// far faster than its low corner alone would suggest;
    /// `alpha_band`/`beta_band`/`notch_freq` are the narrowband sections
    /// that actually dictate settling time.
    pub fn min_window_len(&self) -> usize {
        let lowest_cutoff = [self.alpha_band.0, self.beta_band.0, self.notch_freq]
            .into_iter()
            .fold(f64::INFINITY, f64::min)
            .max(1e-9);
        let ratio = (self.sampling_rate / lowest_cutoff).max(1.0);
        let sections = (self.filter_order / 2).max(1) as f64;
        (4.0 * sections * ratio).ceil() as usize
    }

    pub fn max_cutoff(&self) -> f64 {
        [
            self.bandpass.1,
            self.alpha_band.1,
            self.beta_band.1,
            self.notch_freq,
        ]
        .into_iter()
        .fold(0.0_f64, f64::max)
    }
}

#[derive(Debug, Clone)]
pub struct DecisionConfig {
    pub li_left_threshold: f64,
    pub li_right_threshold: f64,
    pub calibration_samples: usize,
    pub adaptive_threshold: bool,
    pub adaptive_k: f64,
    pub smoothing_window: usize,
    pub quality_gate: f64,
    pub strict_gating: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            li_left_threshold: -0.15,
            li_right_threshold: 0.15,
            calibration_samples: 100,
            adaptive_threshold: true,
            adaptive_k: 1.0,
            smoothing_window: 5,
            quality_gate: 40.0,
            strict_gating: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub saturation_threshold: f64,
    pub low_signal_variance_threshold: f64,
    pub muscle_beta_threshold: f64,
    pub variance_multiplier: f64,
    pub median_window: usize,
    pub line_noise_threshold_ratio: f64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            saturation_threshold: 0.02,
            low_signal_variance_threshold: 1.0,
            muscle_beta_threshold: 100.0,
            variance_multiplier: 3.0,
            median_window: 30,
            line_noise_threshold_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub enable_csv: bool,
    pub filename: String,
    pub flush_interval_records: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_csv: true,
            filename: "eeg_data_log.csv".to_string(),
            flush_interval_records: 10,
        }
    }
}

/// A fully validated, immutable snapshot of every recognized option
/// (spec §4.8). Build via [`EngineConfigBuilder`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub serial: SerialConfig,
    pub signal: SignalConfig,
    pub decision: DecisionConfig,
    pub artifact: ArtifactConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    serial: SerialConfig,
    signal: SignalConfig,
    decision: DecisionConfig,
    artifact: ArtifactConfig,
    logging: LoggingConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            serial: SerialConfig::default(),
            signal: SignalConfig::default(),
            decision: DecisionConfig::default(),
            artifact: ArtifactConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn port(mut self, port: PortSelector) -> Self {
        self.serial.port = port;
        self
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.serial.baud_rate = baud_rate;
        self
    }

    pub fn sampling_rate(mut self, hz: f64) -> Self {
        self.signal.sampling_rate = hz;
        self
    }

    pub fn window_size_s(mut self, seconds: f64) -> Self {
        self.signal.window_size_s = seconds;
        self
    }

    pub fn window_overlap(mut self, overlap: f64) -> Self {
        self.signal.window_overlap = overlap;
        self
    }

    pub fn notch_freq(mut self, hz: f64) -> Self {
        self.signal.notch_freq = hz;
        self
    }

    pub fn signal(mut self, signal: SignalConfig) -> Self {
        self.signal = signal;
        self
    }

    pub fn decision(mut self, decision: DecisionConfig) -> Self {
        self.decision = decision;
        self
    }

    pub fn artifact(mut self, artifact: ArtifactConfig) -> Self {
        self.artifact = artifact;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Validate and freeze the configuration. Fails fast (spec §7, exit 2)
    /// rather than letting an invalid band or an undersized window reach
    /// the scheduler loop.
    pub fn build(self) -> Result<EngineConfig, FilterConfigError> {
        let s = &self.signal;

        for (name, (low, high)) in [
            ("bandpass", s.bandpass),
            ("alpha_band", s.alpha_band),
            ("beta_band", s.beta_band),
        ] {
            if !(low > 0.0 && high > low) {
                return Err(FilterConfigError::InvalidBand { name, low, high });
            }
        }

        let max_cutoff = s.max_cutoff();
        if s.sampling_rate <= 2.0 * max_cutoff {
            return Err(FilterConfigError::NyquistViolation {
                fs: s.sampling_rate,
                max_cutoff,
            });
        }

        let n = s.window_len();
        let required = s.min_window_len();
        if n < required {
            return Err(FilterConfigError::WindowTooShort { n, required });
        }

        Ok(EngineConfig {
            serial: self.serial,
            signal: self.signal,
            decision: self.decision,
            artifact: self.artifact,
            logging: self.logging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let cfg = EngineConfigBuilder::new().build().unwrap();
        assert_eq!(cfg.signal.window_len(), 500);
        assert_eq!(cfg.signal.hop_len(), 250);
    }

    #[test]
    fn nyquist_violation_is_rejected() {
        let err = EngineConfigBuilder::new()
            .sampling_rate(50.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, FilterConfigError::NyquistViolation { .. }));
    }

    #[test]
    fn undersized_window_is_rejected() {
        let err = EngineConfigBuilder::new()
            .window_size_s(0.05)
            .build()
            .unwrap_err();
        assert!(matches!(err, FilterConfigError::WindowTooShort { .. }));
    }

    #[test]
    fn invalid_band_is_rejected() {
        let mut signal = SignalConfig::default();
        signal.alpha_band = (12.0, 8.0);
        let err = EngineConfigBuilder::new().signal(signal).build().unwrap_err();
        assert!(matches!(err, FilterConfigError::InvalidBand { .. }));
    }
}
