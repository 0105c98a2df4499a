//! Regulation worker.
//!
//! Owns the [`RegulationController`]. Every tick it takes the latest published
//! sample, evaluates the controller and publishes a [`RegulationState`]
//! snapshot for the actuation worker. Pump feedback (faults, syringe fill)
//! arrives on an mpsc channel and is applied between ticks.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use super::actuation::ActuationFeedback;
use super::ticker;
use crate::core::{CancellationToken, TriggerGate, TriggerSource};
use crate::regulation::{HoldReason, RegulationController, RegulationState};
use crate::sensor::{PhysicalSample, Reading};

/// What the regulation worker did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RegulationReport {
    /// Controller ticks evaluated
    pub ticks: u64,
    /// Command changes
    pub transitions: u64,
    /// Ticks that held for lack of a usable reading
    pub no_data_ticks: u64,
    /// Pump faults reported by the actuation worker
    pub faults: u64,
    /// Capture requests made on command changes
    pub capture_requests: u64,
    /// Controller state when the worker stopped
    pub final_state: RegulationState,
}

/// Regulation worker.
pub struct RegulationLoop {
    controller: RegulationController,
    period: Duration,
    samples: watch::Receiver<Option<PhysicalSample>>,
    states: watch::Sender<RegulationState>,
    feedback: mpsc::Receiver<ActuationFeedback>,
    capture_gate: Option<Arc<TriggerGate>>,
}

impl RegulationLoop {
    /// Create the worker.
    pub fn new(
        controller: RegulationController,
        period: Duration,
        samples: watch::Receiver<Option<PhysicalSample>>,
        states: watch::Sender<RegulationState>,
        feedback: mpsc::Receiver<ActuationFeedback>,
    ) -> Self {
        Self {
            controller,
            period,
            samples,
            states,
            feedback,
            capture_gate: None,
        }
    }

    /// Request a capture every time the command changes.
    pub fn with_capture_on_transition(mut self, gate: Arc<TriggerGate>) -> Self {
        self.capture_gate = Some(gate);
        self
    }

    fn tick(&mut self, report: &mut RegulationReport) {
        let channel = self.controller.channel();
        let reading = self
            .samples
            .borrow()
            .as_ref()
            .map(|sample| sample.reading(channel))
            .unwrap_or(Reading {
                value: f64::NAN,
                sentinel: true,
            });

        let decision = self.controller.update(reading, Instant::now().into_std());
        report.ticks += 1;
        if decision.hold_reason == Some(HoldReason::NoData) {
            report.no_data_ticks += 1;
        }
        if decision.changed {
            if let Some(gate) = &self.capture_gate {
                gate.request_save(TriggerSource::Regulation);
                report.capture_requests += 1;
            }
        }
        self.states.send_replace(self.controller.state());
    }

    fn apply_feedback(&mut self, feedback: ActuationFeedback, report: &mut RegulationReport) {
        match feedback {
            ActuationFeedback::Fault(fault) => {
                report.faults += 1;
                self.controller.report_fault(&fault, Instant::now().into_std());
                self.states.send_replace(self.controller.state());
            }
            ActuationFeedback::SyringeFill(fraction) => self.controller.set_syringe_fill(fraction),
        }
    }

    /// Run until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) -> RegulationReport {
        let mut report = RegulationReport::default();
        let mut ticker = ticker(self.period);
        let mut feedback_open = true;
        info!(
            target_value = self.controller.params().target,
            channel = ?self.controller.channel(),
            direction = ?self.controller.params().direction,
            "Regulation started"
        );

        loop {
            // Feedback first: a fault must be applied before the next decision.
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                feedback = self.feedback.recv(), if feedback_open => match feedback {
                    Some(feedback) => self.apply_feedback(feedback, &mut report),
                    None => {
                        warn!("Actuation feedback channel closed");
                        feedback_open = false;
                    }
                },
                _ = ticker.tick() => self.tick(&mut report),
            }
        }

        report.transitions = self.controller.transitions();
        report.final_state = self.controller.state();
        info!(ticks = report.ticks, transitions = report.transitions, "Regulation stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActuationFault;
    use crate::regulation::{Command, RegulationParams};

    fn sample(p: f64) -> PhysicalSample {
        PhysicalSample {
            timestamp: 0.0,
            pressures: vec![p],
            humidity: 40.0,
            temperature: 20.0,
            sentinel: false,
        }
    }

    fn params() -> RegulationParams {
        RegulationParams {
            target: 100.0,
            tolerance: 5.0,
            ..RegulationParams::default()
        }
    }

    #[tokio::test]
    async fn test_follows_published_samples() {
        let (sample_tx, sample_rx) = watch::channel(Some(sample(80.0)));
        let (state_tx, mut state_rx) = watch::channel(RegulationState::default());
        let (_fb_tx, fb_rx) = mpsc::channel(8);
        let gate = Arc::new(TriggerGate::new());
        let token = CancellationToken::new();

        let worker = RegulationLoop::new(
            RegulationController::new(params()),
            Duration::from_millis(5),
            sample_rx,
            state_tx,
            fb_rx,
        )
        .with_capture_on_transition(gate.clone());
        let handle = tokio::spawn(worker.run(token.clone()));

        state_rx
            .wait_for(|s| s.last_command == Command::Inject)
            .await
            .unwrap();
        sample_tx.send_replace(Some(sample(120.0)));
        state_rx
            .wait_for(|s| s.last_command == Command::Withdraw)
            .await
            .unwrap();

        token.cancel();
        let report = handle.await.unwrap();
        assert!(report.transitions >= 2);
        assert_eq!(report.capture_requests, report.transitions);
        assert_eq!(gate.stats().requested, report.capture_requests);
    }

    #[tokio::test]
    async fn test_holds_without_samples_and_after_fault() {
        let (_sample_tx, sample_rx) = watch::channel(None);
        let (state_tx, mut state_rx) = watch::channel(RegulationState::default());
        let (fb_tx, fb_rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        let worker = RegulationLoop::new(
            RegulationController::new(params()),
            Duration::from_millis(5),
            sample_rx,
            state_tx,
            fb_rx,
        );
        let handle = tokio::spawn(worker.run(token.clone()));

        state_rx.wait_for(|s| s.tick >= 2).await.unwrap();
        assert_eq!(state_rx.borrow().last_command, Command::Hold);

        fb_tx
            .send(ActuationFeedback::Fault(ActuationFault::Stalled))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let report = handle.await.unwrap();
        assert_eq!(report.faults, 1);
        assert!(report.no_data_ticks >= 2);
        assert_eq!(report.final_state.last_command, Command::Hold);
    }
}
