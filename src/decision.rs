//! Lateralization decision engine (spec §4.6): turns a pair of per-channel
//! alpha powers into a classified, calibrated, confidence-scored
//! [`Decision`].
//!
//! Replaces the "global running-average state" anti-pattern named in spec
//! §9 with an owned [`DecisionEngine`] that a caller constructs once and
//! feeds one window at a time; no thread-local or static accumulator.
//! Direction smoothing (the majority-vote deque over already-classified
//! directions, spec §4.6 step 6) is a separate stage owned by the
//! scheduler's `DirectionSmoother`, not this engine — classification here
//! always runs on the raw per-window LI.

use crate::config::DecisionConfig;
use crate::sample::Direction;
use std::collections::VecDeque;

/// Capacity of the bookkeeping LI history (spec §4.6 preamble), distinct
/// from the bounded calibration buffer.
const LI_HISTORY_CAPACITY: usize = 200;

/// EWMA smoothing factor for the per-channel running alpha reference.
const ALPHA_EWMA_RATE: f64 = 0.05;

/// The lateralization index for one window: `(right_alpha - left_alpha) /
/// (right_alpha + left_alpha)`, in `[-1.0, 1.0]`. Negative favors the left
/// hemisphere (spec §4.6 `compute_li`).
pub fn lateralization_index(left_alpha_power: f64, right_alpha_power: f64) -> f64 {
    let sum = left_alpha_power + right_alpha_power;
    if sum <= 1e-12 {
        return 0.0;
    }
    ((right_alpha_power - left_alpha_power) / sum).clamp(-1.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub li: f64,
    pub direction: Direction,
    pub confidence: f64,
    pub calibrated: bool,
}

/// Owns the calibration statistics and per-instance thresholds. One
/// instance per run (spec §4.6); `recalibrate` resets calibration without
/// discarding configuration.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: DecisionConfig,
    /// LI values collected while `!calibrated`, bounded to
    /// `calibration_samples`. Frozen once full; only `recalibrate()` clears
    /// it, so thresholds don't keep drifting on a long-running stream.
    calibration_buffer: VecDeque<f64>,
    li_left_threshold: f64,
    li_right_threshold: f64,
    calibrated: bool,
    /// Bookkeeping history of LI values (spec §4.6 preamble), capacity 200.
    /// Not consulted for classification; kept for diagnostics/future
    /// consumers the way the per-channel EWMAs below are.
    li_history: VecDeque<f64>,
    left_alpha_ewma: f64,
    right_alpha_ewma: f64,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        let li_left_threshold = config.li_left_threshold;
        let li_right_threshold = config.li_right_threshold;
        Self {
            config,
            calibration_buffer: VecDeque::new(),
            li_left_threshold,
            li_right_threshold,
            calibrated: false,
            li_history: VecDeque::new(),
            left_alpha_ewma: 0.0,
            right_alpha_ewma: 0.0,
        }
    }

    /// Discard calibration state, keeping the configured baseline
    /// thresholds (spec §4.6 `recalibrate`). LI history and alpha EWMAs are
    /// bookkeeping, not calibration state, and survive recalibration.
    pub fn recalibrate(&mut self) {
        self.calibration_buffer.clear();
        self.li_left_threshold = self.config.li_left_threshold;
        self.li_right_threshold = self.config.li_right_threshold;
        self.calibrated = false;
        log::info!("decision engine recalibrated, thresholds reset to configured baseline");
    }

    pub fn li_history(&self) -> &VecDeque<f64> {
        &self.li_history
    }

    pub fn alpha_ewma(&self) -> (f64, f64) {
        (self.left_alpha_ewma, self.right_alpha_ewma)
    }

    /// Fill the bounded calibration buffer until full, then freeze
    /// (spec §4.6 step 3). Does nothing once `calibrated` or when adaptive
    /// thresholds are disabled.
    fn adapt_thresholds(&mut self, li: f64) {
        if !self.config.adaptive_threshold || self.calibrated {
            return;
        }
        self.calibration_buffer.push_back(li);
        let samples = self.config.calibration_samples.max(1);
        if self.calibration_buffer.len() < samples {
            return;
        }
        let mean = self.calibration_buffer.iter().sum::<f64>() / self.calibration_buffer.len() as f64;
        let variance = if self.calibration_buffer.len() < 2 {
            0.0
        } else {
            self.calibration_buffer
                .iter()
                .map(|v| (v - mean).powi(2))
                .sum::<f64>()
                / (self.calibration_buffer.len() - 1) as f64
        };
        let k = self.config.adaptive_k * variance.sqrt();
        self.li_left_threshold = mean - k;
        self.li_right_threshold = mean + k;
        self.calibrated = true;
        log::info!(
            "calibration complete: thresholds=({:.3}, {:.3})",
            self.li_left_threshold,
            self.li_right_threshold
        );
    }

    /// Feed one window's per-hemisphere alpha power and produce a decision.
    /// `quality_ok` is the caller's fully-resolved gate decision (quality
    /// score vs. `quality_gate`, combined with artifact tags under
    /// `strict_gating`, per spec §4.6 step 2). A gated-out window emits
    /// [`Direction::Unknown`] and never feeds calibration or bookkeeping.
    pub fn decide(&mut self, left_alpha_power: f64, right_alpha_power: f64, quality_ok: bool) -> Decision {
        let li = lateralization_index(left_alpha_power, right_alpha_power);

        if !quality_ok {
            return Decision {
                li,
                direction: Direction::Unknown,
                confidence: 0.0,
                calibrated: self.calibrated,
            };
        }

        self.adapt_thresholds(li);

        let direction = if li <= self.li_left_threshold {
            Direction::Left
        } else if li >= self.li_right_threshold {
            Direction::Right
        } else {
            Direction::Neutral
        };

        let span = (self.li_right_threshold - self.li_left_threshold).max(1e-6);
        let distance = match direction {
            Direction::Left => self.li_left_threshold - li,
            Direction::Right => li - self.li_right_threshold,
            _ => 0.0,
        };
        let confidence = (distance / span).clamp(0.0, 1.0);

        if self.li_history.len() == LI_HISTORY_CAPACITY {
            self.li_history.pop_front();
        }
        self.li_history.push_back(li);
        self.left_alpha_ewma =
            ALPHA_EWMA_RATE * left_alpha_power + (1.0 - ALPHA_EWMA_RATE) * self.left_alpha_ewma;
        self.right_alpha_ewma =
            ALPHA_EWMA_RATE * right_alpha_power + (1.0 - ALPHA_EWMA_RATE) * self.right_alpha_ewma;

        Decision {
            li,
            direction,
            confidence,
            calibrated: self.calibrated,
        }
    }
}
