//! Telemetry log of decoded samples.
//!
//! One line per sampling tick, no header:
//!
//! ```text
//! timestamp pressure1 pressure2 humidity temperature
//! ```
//!
//! Fields are separated by a single space and printed with exactly two
//! decimals. With a single pressure channel the second column is `0.00`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::AppResult;
use crate::sensor::PhysicalSample;

/// Format one telemetry line, newline included.
pub fn format_line(sample: &PhysicalSample) -> String {
    let p1 = sample.pressures.first().copied().unwrap_or(0.0);
    let p2 = sample.pressures.get(1).copied().unwrap_or(0.0);
    format!(
        "{:.2} {:.2} {:.2} {:.2} {:.2}\n",
        sample.timestamp, p1, p2, sample.humidity, sample.temperature
    )
}

/// Destination of telemetry lines.
pub trait TelemetrySink: Send {
    /// Append one sample.
    fn record(&mut self, sample: &PhysicalSample) -> AppResult<()>;

    /// Push buffered lines to the underlying writer.
    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Writes telemetry lines to any [`Write`]r.
pub struct LineTelemetry<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> LineTelemetry<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Give the writer back.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl LineTelemetry<BufWriter<File>> {
    /// Create (truncate) a telemetry file.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> TelemetrySink for LineTelemetry<W> {
    fn record(&mut self, sample: &PhysicalSample) -> AppResult<()> {
        self.writer.write_all(format_line(sample).as_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
