//! Image acquisition worker.
//!
//! Polls the [`TriggerGate`]. While requests are pending it grabs a frame, and
//! only once the frame is in hand consumes one request and saves it. A failed
//! grab leaves the request pending for the next poll.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::{ticker, with_timeout};
use crate::camera::{image_stats, Camera, FrameSink, ImageStats};
use crate::core::{CancellationToken, TriggerGate};

/// What the acquisition worker did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AcquisitionReport {
    /// Frames written to the sink
    pub frames_saved: u64,
    /// Grabs that failed or timed out
    pub grab_failures: u64,
    /// Frames grabbed but not written
    pub save_failures: u64,
    /// Statistics of the last saved frame
    pub last_stats: Option<ImageStats>,
}

/// Image acquisition worker.
pub struct AcquisitionLoop {
    camera: Box<dyn Camera>,
    sink: Box<dyn FrameSink>,
    gate: Arc<TriggerGate>,
    poll_period: Duration,
    grab_timeout: Duration,
}

impl AcquisitionLoop {
    /// Create the worker.
    pub fn new(
        camera: Box<dyn Camera>,
        sink: Box<dyn FrameSink>,
        gate: Arc<TriggerGate>,
        poll_period: Duration,
        grab_timeout: Duration,
    ) -> Self {
        Self {
            camera,
            sink,
            gate,
            poll_period,
            grab_timeout,
        }
    }

    /// Service pending requests; returns when none is left, a grab fails, or
    /// the token is cancelled.
    async fn service(&mut self, report: &mut AcquisitionReport, token: &CancellationToken) {
        while self.gate.should_save() && !token.is_cancelled() {
            let name = self.camera.name().to_string();
            let frame = match with_timeout(&name, self.grab_timeout, self.camera.grab()).await {
                Ok(frame) => frame,
                Err(e) => {
                    report.grab_failures += 1;
                    warn!(camera = %name, error = %e, "Grab failed, request left pending");
                    return;
                }
            };
            if !self.gate.try_consume() {
                return;
            }

            let index = report.frames_saved + report.save_failures;
            let stats = image_stats(&frame);
            match self.sink.save(index, &frame) {
                Ok(()) => {
                    report.frames_saved += 1;
                    report.last_stats = Some(stats);
                    info!(
                        index,
                        luminance = stats.luminance,
                        sharpness = stats.sharpness,
                        source = ?self.gate.last_source(),
                        "Frame saved"
                    );
                }
                Err(e) => {
                    report.save_failures += 1;
                    warn!(index, error = %e, "Frame save failed");
                }
            }
        }
    }

    /// Run until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) -> AcquisitionReport {
        let mut report = AcquisitionReport::default();
        let mut ticker = ticker(self.poll_period);
        info!(camera = %self.camera.name(), "Acquisition started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.service(&mut report, &token) => {}
            }
        }

        info!(
            frames = report.frames_saved,
            grab_failures = report.grab_failures,
            "Acquisition stopped"
        );
        report
    }
}
