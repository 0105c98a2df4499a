//! Sensor sampling worker.
//!
//! Each tick reads `window` analog codes per pressure channel and one
//! humidity/temperature transaction, decodes them, publishes the sample on a
//! watch channel and appends a telemetry line.
//!
//! A failed or timed-out transaction is not an error: the sample is decoded
//! through the sentinel and flagged. A failed analog read ends that channel's
//! window early; a channel with no code at all decodes to NaN.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ticker, with_timeout};
use crate::core::CancellationToken;
use crate::sensor::{
    DigitalTransaction, PhysicalSample, RawSample, SampleDecoder, SensorTransport,
    TRANSACTION_LEN,
};
use crate::telemetry::TelemetrySink;

/// Sampling parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingConfig {
    /// Time between ticks
    pub period: Duration,
    /// Number of pressure channels (analog inputs 0..channels)
    pub channels: usize,
    /// Bus address of the humidity/temperature chip
    pub address: u8,
    /// Bound on every individual read
    pub io_timeout: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(250),
            channels: 2,
            address: crate::sensor::HUMIDITY_SENSOR_ADDRESS,
            io_timeout: Duration::from_millis(500),
        }
    }
}

/// What the sampling worker did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SamplingReport {
    /// Samples decoded and published
    pub samples: u64,
    /// Samples whose humidity/temperature came from the sentinel
    pub sentinel_samples: u64,
    /// Failed or timed-out reads
    pub read_failures: u64,
    /// Telemetry lines that could not be written
    pub telemetry_failures: u64,
    /// Most recent sample
    pub last_sample: Option<PhysicalSample>,
}

/// Sensor sampling worker.
pub struct SamplingLoop {
    sensor: Box<dyn SensorTransport>,
    decoder: SampleDecoder,
    config: SamplingConfig,
    telemetry: Option<Box<dyn TelemetrySink>>,
    publisher: watch::Sender<Option<PhysicalSample>>,
    epoch: Instant,
}

impl SamplingLoop {
    /// Create the worker. Timestamps are seconds since `epoch`.
    pub fn new(
        sensor: Box<dyn SensorTransport>,
        decoder: SampleDecoder,
        config: SamplingConfig,
        publisher: watch::Sender<Option<PhysicalSample>>,
        epoch: Instant,
    ) -> Self {
        Self {
            sensor,
            decoder,
            config,
            telemetry: None,
            publisher,
            epoch,
        }
    }

    /// Also write each sample to `sink`.
    pub fn with_telemetry(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    async fn acquire(&mut self, report: &mut SamplingReport) -> RawSample {
        let timestamp = self.epoch.elapsed().as_secs_f64();
        let window = self.decoder.window();
        let timeout = self.config.io_timeout;

        let mut analog = Vec::with_capacity(self.config.channels);
        for channel in 0..self.config.channels {
            let mut codes = Vec::with_capacity(window);
            for _ in 0..window {
                match with_timeout("sensor", timeout, self.sensor.read_analog(channel)).await {
                    Ok(code) => codes.push(code),
                    Err(e) => {
                        report.read_failures += 1;
                        warn!(channel, error = %e, "Analog read failed");
                        break;
                    }
                }
            }
            analog.push(codes);
        }

        let digital = match with_timeout(
            "sensor",
            timeout,
            self.sensor.transaction(self.config.address, TRANSACTION_LEN),
        )
        .await
        {
            Ok(bytes) => DigitalTransaction::from_bytes(&bytes),
            Err(e) => {
                report.read_failures += 1;
                warn!(error = %e, "Humidity/temperature transaction failed");
                DigitalTransaction::Missing
            }
        };

        RawSample {
            timestamp,
            analog,
            digital,
        }
    }

    fn publish(&mut self, sample: PhysicalSample, report: &mut SamplingReport) {
        report.samples += 1;
        if sample.sentinel {
            report.sentinel_samples += 1;
            debug!(timestamp = sample.timestamp, "Sentinel humidity/temperature");
        }
        if let Some(sink) = self.telemetry.as_mut() {
            if let Err(e) = sink.record(&sample) {
                report.telemetry_failures += 1;
                warn!(error = %e, "Telemetry write failed");
            }
        }
        self.publisher.send_replace(Some(sample.clone()));
        report.last_sample = Some(sample);
    }

    /// Run until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) -> SamplingReport {
        let mut report = SamplingReport::default();
        let mut ticker = ticker(self.config.period);
        info!(
            period = ?self.config.period,
            channels = self.config.channels,
            window = self.decoder.window(),
            "Sampling started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let raw = tokio::select! {
                _ = token.cancelled() => break,
                raw = self.acquire(&mut report) => raw,
            };
            let sample = self.decoder.decode(&raw);
            self.publish(sample, &mut report);
        }

        if let Some(sink) = self.telemetry.as_mut() {
            if let Err(e) = sink.flush() {
                warn!(error = %e, "Telemetry flush failed");
            }
        }
        info!(samples = report.samples, sentinel = report.sentinel_samples, "Sampling stopped");
        report
    }
}
