//! Frame source: reads `t_us,left,right\n` lines from a serial transport
//! and produces [`Sample`]s, owning its own reconnect policy (spec §4.1).
//!
//! Grounded in the `bitalino_rs` driver's `Read + Write + Send` transport
//! abstraction and `anyhow`/`log` error style, generalized here to a
//! explicit state machine and `ReadOutcome` result type rather than
//! exceptions (spec §9 "exception-driven control flow").

use crate::config::{PortSelector, SerialConfig};
use crate::error::SourceError;
use crate::sample::Sample;
use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;

/// Substrings/descriptors recognized during auto-detect (spec §4.1).
const KNOWN_DESCRIPTORS: &[&str] = &["Arduino", "CH340", "FTDI", "USB Serial"];

/// Any byte transport the source can read lines from and that can be
/// closed by being dropped. Lets tests substitute an in-memory stream for
/// a real `serialport::SerialPort`.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Abstraction over opening a named or auto-detected endpoint; lets tests
/// substitute a mock transport without a real serial device present.
pub trait PortOpener {
    fn open(&self, name: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Transport>, SourceError>;
}

/// Abstraction over endpoint enumeration for auto-detect.
pub trait PortLister {
    /// Returns `(name, description)` pairs, in a stable, deterministic order.
    fn list(&self) -> Vec<(String, String)>;
}

/// Real serial backend built on `serialport`.
pub struct SerialPortBackend;

impl PortOpener for SerialPortBackend {
    fn open(&self, name: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Transport>, SourceError> {
        let port = serialport::new(name, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => SourceError::NoEndpointFound,
                _ => SourceError::PermissionDenied(format!("{name}: {e}")),
            })?;
        Ok(Box::new(port))
    }
}

impl PortLister for SerialPortBackend {
    fn list(&self) -> Vec<(String, String)> {
        serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|p| {
                let desc = match p.port_type {
                    serialport::SerialPortType::UsbPort(info) => info
                        .product
                        .clone()
                        .unwrap_or_else(|| format!("{:04x}:{:04x}", info.vid, info.pid)),
                    _ => String::new(),
                };
                (p.port_name, desc)
            })
            .collect()
    }
}

/// Pick the lowest-indexed endpoint whose descriptor matches a known
/// microcontroller substring (spec §4.1 auto-detect).
fn auto_detect(ports: &[(String, String)]) -> Option<String> {
    ports
        .iter()
        .find(|(_, desc)| KNOWN_DESCRIPTORS.iter().any(|needle| desc.contains(needle)))
        .map(|(name, _)| name.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Result of one non-blocking read attempt (spec §9 `ReadOutcome`).
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Sample(Sample),
    Empty,
    Corrupt,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SourceCounters {
    pub packets_received: u64,
    pub packets_corrupted: u64,
    pub bytes_read: u64,
}

/// Parse one CSV line into a sample; returns `None` for anything
/// malformed or out of ADC range (spec §4.1 parsing).
fn parse_line(line: &str, adc_max: u16) -> Option<Sample> {
    let mut fields = line.trim().split(',');
    let t_us: u64 = fields.next()?.trim().parse().ok()?;
    let left: u16 = fields.next()?.trim().parse().ok()?;
    let right: u16 = fields.next()?.trim().parse().ok()?;
    let sample = Sample::new(t_us, left, right);
    if sample.in_range(adc_max) {
        Some(sample)
    } else {
        None
    }
}

/// Owns the transport, reconnect policy, and parse counters for one run
/// (spec §4.1). `opener`/`lister` are injected so tests can run without a
/// real serial device.
pub struct FrameSource<O: PortOpener, L: PortLister> {
    opener: O,
    lister: L,
    config: SerialConfig,
    adc_max: u16,
    state: SourceState,
    transport: Option<BufReader<Box<dyn Transport>>>,
    resolved_name: Option<String>,
    reconnect_attempt: u32,
    pub counters: SourceCounters,
}

impl<O: PortOpener, L: PortLister> FrameSource<O, L> {
    pub fn new(opener: O, lister: L, config: SerialConfig, adc_max: u16) -> Self {
        Self {
            opener,
            lister,
            config,
            adc_max,
            state: SourceState::Disconnected,
            transport: None,
            resolved_name: None,
            reconnect_attempt: 0,
            counters: SourceCounters::default(),
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn resolved_name(&self) -> Option<&str> {
        self.resolved_name.as_deref()
    }

    fn resolve_endpoint(&self) -> Result<String, SourceError> {
        match &self.config.port {
            PortSelector::Named(name) => Ok(name.clone()),
            PortSelector::Auto => {
                let ports = self.lister.list();
                auto_detect(&ports).ok_or(SourceError::NoEndpointFound)
            }
        }
    }

    /// Open the endpoint and transition to CONNECTED (spec §4.1 state
    /// machine). Idempotent while already connected.
    pub fn connect(&mut self) -> Result<(), SourceError> {
        if self.state == SourceState::Connected {
            return Ok(());
        }
        self.state = SourceState::Connecting;
        let result = (|| {
            let name = self.resolve_endpoint()?;
            let timeout = Duration::from_secs_f64(self.config.timeout_s.max(0.0));
            let transport = self.opener.open(&name, self.config.baud_rate, timeout)?;
            self.resolved_name = Some(name);
            Ok(transport)
        })();
        match result {
            Ok(transport) => {
                self.transport = Some(BufReader::new(transport));
                self.state = SourceState::Connected;
                self.reconnect_attempt = 0;
                log::info!("connected to {}", self.resolved_name.as_deref().unwrap_or("?"));
                Ok(())
            }
            Err(e) => {
                self.state = SourceState::Disconnected;
                log::warn!("connect failed: {e}");
                Err(e)
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.transport = None;
        self.state = SourceState::Disconnected;
        log::info!("disconnected");
    }

    /// Close and retry with exponential backoff (spec §4.1). On exhaustion
    /// the source becomes terminally DISCONNECTED and returns the fatal
    /// error; callers must stop reading from it.
    fn reconnect(&mut self, sleep: &dyn Fn(Duration)) -> Result<(), SourceError> {
        self.transport = None;
        self.state = SourceState::Reconnecting;
        if self.reconnect_attempt >= self.config.max_reconnect_attempts {
            self.state = SourceState::Disconnected;
            return Err(SourceError::ReconnectExhausted {
                attempts: self.reconnect_attempt,
            });
        }
        let delay = (self.config.reconnect_delay_s * 2f64.powi(self.reconnect_attempt.min(5) as i32))
            .min(30.0);
        log::warn!(
            "reconnecting (attempt {}/{}) after {delay:.1}s backoff",
            self.reconnect_attempt + 1,
            self.config.max_reconnect_attempts
        );
        sleep(Duration::from_secs_f64(delay));
        self.reconnect_attempt += 1;
        match self.connect() {
            Ok(()) => Ok(()),
            Err(_) => {
                self.state = SourceState::Reconnecting;
                Ok(())
            }
        }
    }

    /// Non-blocking: read at most one complete line. Returns `Empty` if no
    /// full line is currently available, `Corrupt` for a malformed or
    /// out-of-range line (counted, never propagated), or `Disconnected`
    /// once reconnection is exhausted (spec §4.1, §9 `ReadOutcome`).
    pub fn read_sample(&mut self, sleep: &dyn Fn(Duration)) -> ReadOutcome {
        if self.transport.is_none() {
            // RECONNECTING leaves the transport empty between attempts; only
            // a terminal DISCONNECTED (exhausted, or never connected) means
            // give up. Anything else must keep retrying up to
            // max_reconnect_attempts rather than quitting after one gap.
            if self.state != SourceState::Reconnecting {
                return ReadOutcome::Disconnected;
            }
            return match self.reconnect(sleep) {
                Ok(()) => ReadOutcome::Empty,
                Err(_) => ReadOutcome::Disconnected,
            };
        }
        let reader = self.transport.as_mut().expect("checked above");

        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => {
                if self.reconnect(sleep).is_err() {
                    return ReadOutcome::Disconnected;
                }
                ReadOutcome::Empty
            }
            Ok(n) => {
                self.counters.bytes_read += n as u64;
                if line.trim().is_empty() {
                    return ReadOutcome::Empty;
                }
                match parse_line(&line, self.adc_max) {
                    Some(sample) => {
                        self.counters.packets_received += 1;
                        ReadOutcome::Sample(sample)
                    }
                    None => {
                        self.counters.packets_corrupted += 1;
                        log::debug!("dropped corrupt line: {:?}", line.trim());
                        ReadOutcome::Corrupt
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                ReadOutcome::Empty
            }
            Err(_) => {
                if self.reconnect(sleep).is_err() {
                    return ReadOutcome::Disconnected;
                }
                ReadOutcome::Empty
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct FixedOpener {
        payload: Vec<u8>,
    }

    impl PortOpener for FixedOpener {
        fn open(&self, _name: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn Transport>, SourceError> {
            Ok(Box::new(Cursor::new(self.payload.clone())))
        }
    }

    struct FailingOpener;
    impl PortOpener for FailingOpener {
        fn open(&self, _name: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn Transport>, SourceError> {
            Err(SourceError::NoEndpointFound)
        }
    }

    struct NamedLister;
    impl PortLister for NamedLister {
        fn list(&self) -> Vec<(String, String)> {
            vec![
                ("/dev/ttyS0".to_string(), "generic".to_string()),
                ("/dev/ttyUSB0".to_string(), "Arduino Uno".to_string()),
            ]
        }
    }

    struct EmptyLister;
    impl PortLister for EmptyLister {
        fn list(&self) -> Vec<(String, String)> {
            Vec::new()
        }
    }

    fn no_sleep(_d: Duration) {}

    #[test]
    fn auto_detect_picks_matching_descriptor() {
        let ports = NamedLister.list();
        assert_eq!(auto_detect(&ports).as_deref(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn parse_line_rejects_out_of_range_values() {
        assert!(parse_line("100,2000,10", 1023).is_none());
    }

    #[test]
    fn parse_line_accepts_well_formed_row() {
        let sample = parse_line("100,512,600", 1023).unwrap();
        assert_eq!(sample.left, 512);
        assert_eq!(sample.right, 600);
    }

    #[test]
    fn read_sample_yields_corrupt_for_malformed_line_without_disconnecting() {
        let mut source = FrameSource::new(
            FixedOpener {
                payload: b"garbage\n100,200,300\n".to_vec(),
            },
            EmptyLister,
            SerialConfig {
                port: PortSelector::Named("fake".to_string()),
                ..SerialConfig::default()
            },
            1023,
        );
        source.connect().unwrap();
        let first = source.read_sample(&no_sleep);
        assert_eq!(first, ReadOutcome::Corrupt);
        let second = source.read_sample(&no_sleep);
        assert_eq!(second, ReadOutcome::Sample(Sample::new(100, 200, 300)));
        assert_eq!(source.counters.packets_corrupted, 1);
        assert_eq!(source.counters.packets_received, 1);
    }

    #[test]
    fn connect_without_endpoint_match_fails_fast() {
        let mut source = FrameSource::new(
            FailingOpener,
            EmptyLister,
            SerialConfig::default(),
            1023,
        );
        let err = source.connect().unwrap_err();
        assert!(matches!(err, SourceError::NoEndpointFound));
    }

    struct OnceThenFailOpener {
        opened: std::cell::Cell<bool>,
    }

    impl PortOpener for OnceThenFailOpener {
        fn open(&self, _name: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn Transport>, SourceError> {
            if self.opened.replace(true) {
                Err(SourceError::PermissionDenied("gone".to_string()))
            } else {
                Ok(Box::new(Cursor::new(Vec::new())))
            }
        }
    }

    struct FlakyOpener {
        calls: std::cell::Cell<u32>,
        fail_count: u32,
        payload: Vec<u8>,
    }

    impl PortOpener for FlakyOpener {
        fn open(&self, _name: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn Transport>, SourceError> {
            let n = self.calls.get();
            self.calls.set(n + 1);
            if n == 0 {
                Ok(Box::new(Cursor::new(Vec::new())))
            } else if n <= self.fail_count {
                Err(SourceError::PermissionDenied("still gone".to_string()))
            } else {
                Ok(Box::new(Cursor::new(self.payload.clone())))
            }
        }
    }

    #[test]
    fn reconnect_retries_past_a_single_failed_attempt() {
        let mut source = FrameSource::new(
            FlakyOpener {
                calls: std::cell::Cell::new(0),
                fail_count: 1,
                payload: b"100,200,300\n".to_vec(),
            },
            EmptyLister,
            SerialConfig {
                port: PortSelector::Named("fake".to_string()),
                max_reconnect_attempts: 5,
                reconnect_delay_s: 0.0,
                ..SerialConfig::default()
            },
            1023,
        );
        source.connect().unwrap();
        // EOF on the empty cursor starts reconnecting; the opener fails the
        // first retry, so the source must survive past attempt 1 instead of
        // reporting DISCONNECTED before max_reconnect_attempts is reached.
        assert_eq!(source.read_sample(&no_sleep), ReadOutcome::Empty);
        assert_eq!(source.read_sample(&no_sleep), ReadOutcome::Empty);
        assert_eq!(
            source.read_sample(&no_sleep),
            ReadOutcome::Sample(Sample::new(100, 200, 300))
        );
        assert_eq!(source.state(), SourceState::Connected);
    }

    #[test]
    fn exhausted_reconnect_reports_disconnected() {
        let mut source = FrameSource::new(
            OnceThenFailOpener {
                opened: std::cell::Cell::new(false),
            },
            EmptyLister,
            SerialConfig {
                port: PortSelector::Named("fake".to_string()),
                max_reconnect_attempts: 1,
                reconnect_delay_s: 0.0,
                ..SerialConfig::default()
            },
            1023,
        );
        source.connect().unwrap();
        // EOF on the empty cursor triggers one reconnect attempt, whose
        // open() call fails; that exhausts the single configured attempt.
        let _ = source.read_sample(&no_sleep);
        let outcome = source.read_sample(&no_sleep);
        assert_eq!(outcome, ReadOutcome::Disconnected);
    }
}
