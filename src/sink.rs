//! Record sinks (spec §9 "polymorphic sinks"): CSV writer and console
//! writer share one capability set instead of a class hierarchy, per
//! `RecordSink`. Grounded in the `csv` + `serde` writer pattern used for
//! log export in the wider DAQ tooling this crate draws on.

use crate::error::SinkError;
use crate::scheduler::WindowRecord;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Shared capability set for anything that can receive [`WindowRecord`]s
/// (spec §9). `write_record` may fail transiently; the scheduler disables
/// a sink after a failure rather than treating it as fatal (spec §7
/// SinkError handling).
pub trait RecordSink {
    fn write_record(&mut self, record: &WindowRecord) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;
}

const CSV_HEADER: &[&str] = &[
    "timestamp",
    "sample_count",
    "left_alpha_power",
    "right_alpha_power",
    "lateralization_index",
    "attention_direction",
    "confidence",
    "smoothed_direction",
    "quality_score",
    "left_snr_db",
    "right_snr_db",
    "left_artifact",
    "right_artifact",
];

/// Formats a value to 6 significant digits (spec §6), not 6 decimal
/// places: small alpha-power values still carry meaningful digits.
fn six_significant(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return format!("{v}");
    }
    let magnitude = v.abs().log10().floor() as i32;
    let decimals = (5 - magnitude).max(0) as usize;
    format!("{v:.decimals$}")
}

/// Append-only CSV sink (spec §6, §4.8 `logging.*`). Writes the header row
/// only when creating a new file; flushes every `flush_interval_records`
/// writes and on `close`.
pub struct CsvSink {
    writer: csv::Writer<File>,
    flush_interval: usize,
    pending: usize,
}

impl CsvSink {
    pub fn create(path: impl AsRef<Path>, flush_interval: usize) -> Result<Self, SinkError> {
        let file = File::create(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;
        Ok(Self {
            writer,
            flush_interval: flush_interval.max(1),
            pending: 0,
        })
    }
}

impl RecordSink for CsvSink {
    fn write_record(&mut self, record: &WindowRecord) -> Result<(), SinkError> {
        self.writer.write_record(&[
            six_significant(record.timestamp),
            record.sample_count.to_string(),
            six_significant(record.left_alpha_power),
            six_significant(record.right_alpha_power),
            six_significant(record.decision.li),
            record.decision.direction.as_str().to_string(),
            six_significant(record.decision.confidence),
            record.smoothed_direction.as_str().to_string(),
            six_significant(record.quality_score),
            six_significant(record.left_quality.snr_db),
            six_significant(record.right_quality.snr_db),
            record.left_quality.artifact_tag.as_str().to_string(),
            record.right_quality.artifact_tag.as_str().to_string(),
        ])?;
        self.pending += 1;
        if self.pending >= self.flush_interval {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        self.pending = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()
    }
}

/// Line-oriented human-readable sink, mainly for interactive runs without
/// `--config` CSV export (spec §9: a second `RecordSink` variant, not a
/// CSV subclass).
pub struct ConsoleSink<W: Write> {
    out: W,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: std::io::stdout() }
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> RecordSink for ConsoleSink<W> {
    fn write_record(&mut self, record: &WindowRecord) -> Result<(), SinkError> {
        writeln!(
            self.out,
            "n={} li={:.3} dir={} conf={:.2} q={:.1} L={} R={}",
            record.sample_count,
            record.decision.li,
            record.decision.direction,
            record.decision.confidence,
            record.quality_score,
            record.left_quality.artifact_tag,
            record.right_quality.artifact_tag,
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Decision;
    use crate::quality::QualityReport;
    use crate::sample::{ArtifactTag, Direction};

    fn sample_record() -> WindowRecord {
        WindowRecord {
            window_index: 0,
            timestamp: 1_700_000_000.123_456,
            sample_count: 500,
            left_alpha_power: 12.5,
            right_alpha_power: 30.0,
            decision: Decision {
                li: 0.41,
                direction: Direction::Right,
                confidence: 0.8,
                calibrated: false,
            },
            smoothed_direction: Direction::Right,
            quality_score: 91.2,
            left_quality: QualityReport {
                snr_db: 18.0,
                artifact_tag: ArtifactTag::Clean,
                quality_score: 91.2,
            },
            right_quality: QualityReport {
                snr_db: 20.0,
                artifact_tag: ArtifactTag::Clean,
                quality_score: 91.2,
            },
        }
    }

    #[test]
    fn console_sink_writes_one_line_per_record() {
        let mut buf = Vec::new();
        let mut sink = ConsoleSink::new(&mut buf);
        sink.write_record(&sample_record()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("dir=RIGHT"));
        assert_eq!(text.matches('\n').count(), 1);
    }

    #[test]
    fn six_significant_keeps_digits_for_small_values() {
        assert_eq!(six_significant(0.0001234567), "0.000123457");
    }

    #[test]
    fn csv_sink_writes_header_and_row() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut sink = CsvSink::create(file.path(), 1).unwrap();
        sink.write_record(&sample_record()).unwrap();
        sink.close().unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER.join(","));
        assert!(lines.next().unwrap().contains("RIGHT"));
    }
}
