//! Error taxonomy for the acquisition, filter, sink and engine boundaries.
//!
//! Kinds follow spec §7: transient/recoverable source conditions never
//! propagate past [`crate::source::FrameSource`]; only construction-time and
//! fatal runtime conditions become a [`SourceError`]/[`FilterConfigError`]
//! that reach the scheduler.

use std::io;

/// Errors surfaced by the frame source once its own reconnect policy gives up.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no matching serial endpoint found during auto-detect")]
    NoEndpointFound,
    #[error("permission denied opening endpoint {0}")]
    PermissionDenied(String),
    #[error("reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

/// Construction-time errors for the filter bank / engine config. Always fail
/// before the scheduler loop starts (spec §7, exit code 2).
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterConfigError {
    #[error("invalid {name} band: low={low} high={high}")]
    InvalidBand {
        name: &'static str,
        low: f64,
        high: f64,
    },
    #[error("sampling rate {fs} Hz does not satisfy Nyquist for cutoff {max_cutoff} Hz")]
    NyquistViolation { fs: f64, max_cutoff: f64 },
    #[error("window of {n} samples is shorter than the {required}-sample filter support floor")]
    WindowTooShort { n: usize, required: usize },
}

/// Errors from a [`crate::sink::RecordSink`]. Logged at ERROR and the
/// offending sink is disabled for the remainder of the run; never fatal.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),
}

/// Why the scheduler stopped pulling samples and the run ended. `Config`
/// isn't a variant here: construction-time config/filter-bank failures are
/// `FilterConfigError`, surfaced directly from `EngineConfigBuilder::build`/
/// `FilterBank::new` before a scheduler (and hence a `RunOutcome`) exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    Source,
    Sink,
}

/// Outcome of [`crate::scheduler::RealtimeScheduler::run`].
#[derive(Debug)]
pub enum RunOutcome {
    Completed { windows_emitted: u64 },
    FatalError { kind: FatalKind, detail: String },
}
