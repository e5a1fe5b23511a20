//! Realtime scheduler (spec §4.7): pulls samples, maintains the dual ring
//! buffers, and on every hop dispatches a window through the filter bank,
//! feature extractor, quality assessor, and decision engine, fanning the
//! resulting [`WindowRecord`] out to every configured sink.

use crate::config::{ArtifactConfig, DecisionConfig, SignalConfig};
use crate::decision::{Decision, DecisionEngine};
use crate::error::{FatalKind, RunOutcome};
use crate::features::{compute_features, Features};
use crate::filter::FilterBank;
use crate::quality::{QualityAssessor, QualityReport};
use crate::ring_buffer::RingBuffer;
use crate::sample::Direction;
use crate::sink::RecordSink;
use crate::source::{FrameSource, PortLister, PortOpener, ReadOutcome};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One emitted window's worth of results (spec §3 `WindowRecord`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowRecord {
    pub window_index: u64,
    pub timestamp: f64,
    pub sample_count: u64,
    pub left_alpha_power: f64,
    pub right_alpha_power: f64,
    pub decision: Decision,
    pub smoothed_direction: Direction,
    pub quality_score: f64,
    pub left_quality: QualityReport,
    pub right_quality: QualityReport,
}

/// Majority-vote direction smoother over the last `capacity` raw
/// directions; ties resolve to NEUTRAL (spec §4.6 step 6).
struct DirectionSmoother {
    history: VecDeque<Direction>,
    capacity: usize,
}

impl DirectionSmoother {
    fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn push_and_vote(&mut self, direction: Direction) -> Direction {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(direction);

        let mut left = 0;
        let mut right = 0;
        let mut neutral = 0;
        let mut unknown = 0;
        for d in &self.history {
            match d {
                Direction::Left => left += 1,
                Direction::Right => right += 1,
                Direction::Neutral => neutral += 1,
                Direction::Unknown => unknown += 1,
            }
        }
        let max = left.max(right).max(neutral).max(unknown);
        let winners = [
            (left == max, Direction::Left),
            (right == max, Direction::Right),
            (neutral == max, Direction::Neutral),
            (unknown == max, Direction::Unknown),
        ]
        .into_iter()
        .filter(|(tied, _)| *tied)
        .count();
        if winners > 1 {
            Direction::Neutral
        } else if left == max {
            Direction::Left
        } else if right == max {
            Direction::Right
        } else if unknown == max {
            Direction::Unknown
        } else {
            Direction::Neutral
        }
    }
}

/// Preprocess one channel's raw window and extract its scalar features.
/// A pure function of `(bank, raw)`, so left and right can run on separate
/// threads (spec §5's worker-pool extension point) with no shared state.
fn compute_channel_features(bank: &FilterBank, raw: &[f64]) -> Features {
    let (pre, _) = bank.preprocess(raw);
    let (alpha, _) = bank.extract_alpha(&pre);
    let (beta, _) = bank.extract_beta(&pre);
    compute_features(bank, &pre, &alpha, &beta)
}

/// Returns the current wall-clock time as fractional seconds since the
/// Unix epoch (spec §6 CSV `timestamp`).
fn wall_clock_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Owns the ring buffers, filter bank, decision engine, quality assessor,
/// and sinks for one run (spec §4.7, §5 "single-threaded cooperative").
pub struct RealtimeScheduler<O: PortOpener, L: PortLister> {
    source: FrameSource<O, L>,
    bank: FilterBank,
    decision_engine: DecisionEngine,
    quality: QualityAssessor,
    smoother: DirectionSmoother,
    artifact_config: ArtifactConfig,
    left_buffer: RingBuffer,
    right_buffer: RingBuffer,
    window_len: usize,
    hop_len: usize,
    new_since_last_window: usize,
    line_freq: f64,
    adc_max: u16,
    quality_gate: f64,
    strict_gating: bool,
    sinks: Vec<Box<dyn RecordSink>>,
    sink_disabled: Vec<bool>,
    window_index: u64,
    samples_seen: u64,
    slow_window_streak: u32,
}

impl<O: PortOpener, L: PortLister> RealtimeScheduler<O, L> {
    pub fn new(
        source: FrameSource<O, L>,
        signal: &SignalConfig,
        decision: DecisionConfig,
        artifact: ArtifactConfig,
        line_freq: f64,
        sinks: Vec<Box<dyn RecordSink>>,
    ) -> Result<Self, crate::error::FilterConfigError> {
        let bank = FilterBank::new(signal)?;
        let window_len = signal.window_len();
        let hop_len = signal.hop_len();
        let capacity = (2 * window_len).max(window_len + hop_len);
        let quality_gate = decision.quality_gate;
        let strict_gating = decision.strict_gating;
        let sink_disabled = vec![false; sinks.len()];
        log::info!("engine configured: window_len={window_len} hop_len={hop_len} fs={}", signal.sampling_rate);
        Ok(Self {
            source,
            bank,
            decision_engine: DecisionEngine::new(decision.clone()),
            quality: QualityAssessor::new(),
            smoother: DirectionSmoother::new(decision.smoothing_window),
            artifact_config: artifact,
            left_buffer: RingBuffer::new(capacity),
            right_buffer: RingBuffer::new(capacity),
            window_len,
            hop_len,
            new_since_last_window: 0,
            line_freq,
            adc_max: signal.adc_max,
            quality_gate,
            strict_gating,
            sinks,
            sink_disabled,
            window_index: 0,
            samples_seen: 0,
            slow_window_streak: 0,
        })
    }

    /// Process one window. `parallel` is spec §5's documented worker-pool
    /// extension point (`Scheduler::run`'s `parallel_feature_quality`
    /// parameter): when set, Features and QualityReport for the two
    /// channels are computed via `std::thread::scope` instead of
    /// sequentially. Either way, at most one window is ever in flight and
    /// windows are still emitted in order.
    fn process_window(&mut self, parallel: bool) -> WindowRecord {
        let started = Instant::now();

        let left_raw = self.left_buffer.snapshot_last(self.window_len).unwrap();
        let right_raw = self.right_buffer.snapshot_last(self.window_len).unwrap();
        self.left_buffer.advance(self.hop_len);
        self.right_buffer.advance(self.hop_len);
        self.new_since_last_window = self.new_since_last_window.saturating_sub(self.hop_len);

        let bank = &self.bank;
        let (left_features, right_features) = if parallel {
            std::thread::scope(|scope| {
                let right_handle = scope.spawn(|| compute_channel_features(bank, &right_raw));
                let left_features = compute_channel_features(bank, &left_raw);
                let right_features = right_handle.join().expect("feature extraction thread panicked");
                (left_features, right_features)
            })
        } else {
            (
                compute_channel_features(bank, &left_raw),
                compute_channel_features(bank, &right_raw),
            )
        };

        let (left_quality, right_quality) = self.quality.assess_pair(
            &left_raw,
            &right_raw,
            left_features.alpha_power,
            right_features.alpha_power,
            left_features.beta_power,
            right_features.beta_power,
            &self.bank,
            &self.artifact_config,
            self.line_freq,
            self.adc_max,
            parallel,
        );

        let quality_score = left_quality.quality_score.min(right_quality.quality_score);
        let artifacts_clean = left_quality.artifact_tag.is_clean() && right_quality.artifact_tag.is_clean();
        let quality_ok = quality_score >= self.quality_gate && (!self.strict_gating || artifacts_clean);

        let decision = self.decision_engine.decide(
            left_features.alpha_power,
            right_features.alpha_power,
            quality_ok,
        );
        let smoothed_direction = self.smoother.push_and_vote(decision.direction);

        self.window_index += 1;

        let record = WindowRecord {
            window_index: self.window_index,
            timestamp: wall_clock_seconds(),
            sample_count: self.samples_seen,
            left_alpha_power: left_features.alpha_power,
            right_alpha_power: right_features.alpha_power,
            decision,
            smoothed_direction,
            quality_score,
            left_quality,
            right_quality,
        };

        let elapsed = started.elapsed();
        let budget = Duration::from_secs_f64(self.hop_len as f64 / self.bank.fs);
        if elapsed >= budget {
            self.slow_window_streak += 1;
            if self.slow_window_streak == 3 {
                log::warn!("processing_behind: window took {elapsed:?}, budget {budget:?}");
            }
        } else {
            self.slow_window_streak = 0;
        }

        record
    }

    /// Writes `record` to every sink that hasn't yet failed (spec §9
    /// "polymorphic sinks"). A sink that errors is logged once and marked
    /// disabled; it is skipped for the rest of the run rather than retried.
    /// Returns `true` once every configured sink has been disabled, i.e.
    /// output has become entirely unobservable and the run should stop.
    fn dispatch(&mut self, record: &WindowRecord) -> bool {
        for (sink, disabled) in self.sinks.iter_mut().zip(self.sink_disabled.iter_mut()) {
            if *disabled {
                continue;
            }
            if let Err(e) = sink.write_record(record) {
                log::error!("sink write failed, disabling for remainder of run: {e}");
                *disabled = true;
            }
        }
        !self.sink_disabled.is_empty() && self.sink_disabled.iter().all(|d| *d)
    }

    /// Run until `deadline` elapses or the source disconnects terminally
    /// (spec §4.7, §5 cancellation). Returns how the run ended.
    ///
    /// `parallel_feature_quality` is spec §5's documented worker-pool
    /// extension point: when `true`, each window's Features and
    /// QualityReport for the two channels are computed concurrently via
    /// `std::thread::scope` rather than sequentially. It changes nothing
    /// about ordering or how many windows are in flight (still one), only
    /// how that one window's per-channel work is scheduled.
    pub fn run(
        &mut self,
        deadline: Option<Duration>,
        parallel_feature_quality: bool,
        sleep: &dyn Fn(Duration),
    ) -> RunOutcome {
        if let Err(e) = self.source.connect() {
            return RunOutcome::FatalError {
                kind: FatalKind::Source,
                detail: e.to_string(),
            };
        }

        let start = Instant::now();
        loop {
            if let Some(d) = deadline {
                if start.elapsed() >= d {
                    break;
                }
            }

            match self.source.read_sample(sleep) {
                ReadOutcome::Sample(sample) => {
                    self.left_buffer.push(sample.left as f64);
                    self.right_buffer.push(sample.right as f64);
                    self.new_since_last_window += 1;
                    self.samples_seen += 1;

                    if self.left_buffer.len() >= self.window_len
                        && self.new_since_last_window >= self.hop_len
                    {
                        let record = self.process_window(parallel_feature_quality);
                        if self.dispatch(&record) {
                            return RunOutcome::FatalError {
                                kind: FatalKind::Sink,
                                detail: "all sinks disabled after write failures".to_string(),
                            };
                        }
                    }
                }
                ReadOutcome::Empty => {
                    sleep(Duration::from_millis(1));
                }
                ReadOutcome::Corrupt => {}
                ReadOutcome::Disconnected => {
                    for sink in self.sinks.iter_mut() {
                        let _ = sink.close();
                    }
                    return RunOutcome::FatalError {
                        kind: FatalKind::Source,
                        detail: "source disconnected".to_string(),
                    };
                }
            }
        }

        for sink in self.sinks.iter_mut() {
            let _ = sink.close();
        }
        RunOutcome::Completed {
            windows_emitted: self.window_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortSelector, SerialConfig, SignalConfig};
    use crate::error::SourceError;
    use crate::source::Transport;
    use std::f64::consts::TAU;
    use std::io::Cursor;

    /// Succeeds once with `payload`, then fails every subsequent `open()`.
    /// Used instead of an always-succeeding opener so a source exhaustion
    /// genuinely happens rather than relying on `run`'s deadline to cut off
    /// an opener that would otherwise replay the same bytes forever.
    struct CsvBytesOpener {
        payload: Vec<u8>,
        opened: std::cell::Cell<bool>,
    }

    impl PortOpener for CsvBytesOpener {
        fn open(
            &self,
            _name: &str,
            _baud: u32,
            _timeout: Duration,
        ) -> Result<Box<dyn Transport>, SourceError> {
            if self.opened.replace(true) {
                Err(SourceError::PermissionDenied("gone".to_string()))
            } else {
                Ok(Box::new(Cursor::new(self.payload.clone())))
            }
        }
    }

    struct NoLister;
    impl PortLister for NoLister {
        fn list(&self) -> Vec<(String, String)> {
            Vec::new()
        }
    }

    struct VecSink {
        records: std::rc::Rc<std::cell::RefCell<Vec<WindowRecord>>>,
    }

    impl RecordSink for VecSink {
        fn write_record(&mut self, record: &WindowRecord) -> Result<(), crate::error::SinkError> {
            self.records.borrow_mut().push(*record);
            Ok(())
        }
        fn flush(&mut self) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
    }

    fn csv_payload(fs: f64, freq: f64, n: usize, amplitude: f64, offset: f64) -> Vec<u8> {
        let mut buf = String::new();
        for i in 0..n {
            let v = offset + amplitude * (TAU * freq * i as f64 / fs).sin();
            let adc = v.round().clamp(0.0, 1023.0) as u16;
            buf.push_str(&format!("{i},{adc},{adc}\n"));
        }
        buf.into_bytes()
    }

    fn no_sleep(_d: Duration) {}

    #[test]
    fn balanced_sine_both_channels_emits_neutral_windows() {
        let signal = SignalConfig::default();
        let n = signal.window_len() * 3;
        let payload = csv_payload(signal.sampling_rate, 10.0, n, 40.0, 512.0);

        let source = FrameSource::new(
            CsvBytesOpener {
                payload,
                opened: std::cell::Cell::new(false),
            },
            NoLister,
            SerialConfig {
                port: PortSelector::Named("fake".to_string()),
                max_reconnect_attempts: 0,
                reconnect_delay_s: 0.0,
                ..SerialConfig::default()
            },
            signal.adc_max,
        );

        let records = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = Box::new(VecSink {
            records: records.clone(),
        });
        let mut scheduler = RealtimeScheduler::new(
            source,
            &signal,
            DecisionConfig {
                adaptive_threshold: false,
                ..DecisionConfig::default()
            },
            ArtifactConfig::default(),
            signal.notch_freq,
            vec![sink],
        )
        .unwrap();

        let outcome = scheduler.run(None, false, &no_sleep);
        assert!(matches!(outcome, RunOutcome::FatalError { kind: FatalKind::Source, .. }));
        let emitted = records.borrow();
        assert!(!emitted.is_empty());
        for record in emitted.iter() {
            assert!(record.decision.li.abs() <= 1.0);
            assert!((0.0..=100.0).contains(&record.quality_score));
        }
    }

    struct FailingSink;
    impl RecordSink for FailingSink {
        fn write_record(&mut self, _record: &WindowRecord) -> Result<(), crate::error::SinkError> {
            Err(crate::error::SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
        fn flush(&mut self) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), crate::error::SinkError> {
            Ok(())
        }
    }

    #[test]
    fn run_ends_fatal_once_every_sink_is_disabled() {
        let signal = SignalConfig::default();
        let n = signal.window_len() * 3;
        let payload = csv_payload(signal.sampling_rate, 10.0, n, 40.0, 512.0);

        let source = FrameSource::new(
            CsvBytesOpener {
                payload,
                opened: std::cell::Cell::new(false),
            },
            NoLister,
            SerialConfig {
                port: PortSelector::Named("fake".to_string()),
                max_reconnect_attempts: 0,
                reconnect_delay_s: 0.0,
                ..SerialConfig::default()
            },
            signal.adc_max,
        );

        let mut scheduler = RealtimeScheduler::new(
            source,
            &signal,
            DecisionConfig {
                adaptive_threshold: false,
                ..DecisionConfig::default()
            },
            ArtifactConfig::default(),
            signal.notch_freq,
            vec![Box::new(FailingSink)],
        )
        .unwrap();

        let outcome = scheduler.run(None, false, &no_sleep);
        match outcome {
            RunOutcome::FatalError { kind, .. } => assert_eq!(kind, FatalKind::Sink),
            other => panic!("expected a sink fatal error, got {other:?}"),
        }
    }

    #[test]
    fn direction_smoother_returns_majority_and_ties_to_neutral() {
        let mut smoother = DirectionSmoother::new(4);
        smoother.push_and_vote(Direction::Right);
        smoother.push_and_vote(Direction::Right);
        smoother.push_and_vote(Direction::Left);
        let vote = smoother.push_and_vote(Direction::Right);
        assert_eq!(vote, Direction::Right);
    }

    #[test]
    fn direction_smoother_resolves_tie_to_neutral() {
        let mut smoother = DirectionSmoother::new(2);
        smoother.push_and_vote(Direction::Left);
        let vote = smoother.push_and_vote(Direction::Right);
        assert_eq!(vote, Direction::Neutral);
    }
}
