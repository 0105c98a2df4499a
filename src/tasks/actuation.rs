//! Pump actuation worker.
//!
//! Two modes:
//!
//! - **regulation**: follow the latest [`RegulationState`] snapshot. A change of
//!   command stops the pump and, for inject/withdraw, restarts it in the new
//!   direction as an open-ended move. The pump is polled every period and the
//!   syringe fill is reported back.
//! - **sequence**: execute a [`Sequence`] move by move, waiting for each move to
//!   reach its target volume within its timeout, then dwelling.
//!
//! Pump errors become [`ActuationFault`]s, sent back to the regulation worker
//! and counted; the worker carries on. In regulation mode a fault latches the
//! pump in hold until the controller publishes a state that includes it, so a
//! stale inject/withdraw is never re-applied. On exit the pump is stopped.
//!
//! Every pump operation is bounded by `op_timeout`, which covers a whole
//! operation (a PhD Ultra start is a dozen queries) rather than one query. A
//! start that times out is followed by a best-effort stop, since the pump may
//! be left half configured.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ticker, with_timeout};
use crate::core::CancellationToken;
use crate::error::{ActuationFault, DaqError};
use crate::pump::{into_fault, PlannedMove, Pump, PumpDirection, PumpStatus, Sequence, Syringe};
use crate::regulation::{Command, RegulationState};

/// Message from the actuation worker to the regulation worker.
#[derive(Clone, Debug, PartialEq)]
pub enum ActuationFeedback {
    /// A pump command failed
    Fault(ActuationFault),
    /// Current syringe fill fraction in [0, 1]
    SyringeFill(f64),
}

/// What the actuation worker did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ActuationReport {
    /// Commands sent to the pump (starts and stops)
    pub commands: u64,
    /// Sequence moves that reached their target
    pub steps_completed: u64,
    /// Sequence moves planned
    pub steps_planned: u64,
    /// Faults, in order
    pub faults: Vec<String>,
    /// Net volume injected over the run (µl)
    pub net_injected_ul: f64,
}

/// Pump actuation worker.
pub struct ActuationLoop {
    pump: Box<dyn Pump>,
    syringe: Syringe,
    poll_period: Duration,
    op_timeout: Duration,
    feedback: Option<mpsc::Sender<ActuationFeedback>>,
    faults_delivered: u64,
    fault_latched: bool,
    report: ActuationReport,
}

impl ActuationLoop {
    /// Create the worker. `op_timeout` bounds each pump operation.
    pub fn new(pump: Box<dyn Pump>, syringe: Syringe, poll_period: Duration, op_timeout: Duration) -> Self {
        Self {
            pump,
            syringe,
            poll_period,
            op_timeout,
            feedback: None,
            faults_delivered: 0,
            fault_latched: false,
            report: ActuationReport::default(),
        }
    }

    /// Send faults and syringe fill to the regulation worker.
    pub fn with_feedback(mut self, feedback: mpsc::Sender<ActuationFeedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    fn notify(&self, feedback: ActuationFeedback) {
        if let Some(tx) = &self.feedback {
            // Feedback is advisory; a full or closed channel only drops it.
            let _ = tx.try_send(feedback);
        }
    }

    async fn record_fault(&mut self, fault: ActuationFault) {
        warn!(pump = %self.pump.name(), %fault, "Actuation fault");
        self.report.faults.push(fault.to_string());
        self.fault_latched = true;
        if let Some(tx) = &self.feedback {
            // Faults are never dropped: the regulation worker drains the
            // channel until it is cancelled, and a closed channel errors at once.
            if tx.send(ActuationFeedback::Fault(fault)).await.is_ok() {
                self.faults_delivered += 1;
            }
        }
    }

    async fn start(&mut self, direction: PumpDirection, volume_ul: Option<f64>, rate_ul_min: f64) -> bool {
        self.report.commands += 1;
        let name = self.pump.name().to_string();
        let result = with_timeout(
            &name,
            self.op_timeout,
            self.pump.start(direction, volume_ul, rate_ul_min),
        )
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                let timed_out = matches!(e, DaqError::Timeout { .. });
                self.record_fault(into_fault(e)).await;
                if timed_out {
                    self.stop().await;
                }
                false
            }
        }
    }

    async fn stop(&mut self) {
        self.report.commands += 1;
        let name = self.pump.name().to_string();
        if let Err(e) = with_timeout(&name, self.op_timeout, self.pump.stop()).await {
            self.record_fault(into_fault(e)).await;
        }
    }

    async fn poll(&mut self) -> Option<PumpStatus> {
        let name = self.pump.name().to_string();
        match with_timeout(&name, self.op_timeout, self.pump.poll()).await {
            Ok(reading) => {
                self.report.net_injected_ul = reading.net_injected_ul();
                self.notify(ActuationFeedback::SyringeFill(
                    self.syringe.fill_fraction(reading.net_injected_ul()),
                ));
                Some(reading.status)
            }
            Err(e) => {
                warn!(pump = %name, error = %e, "Pump poll failed");
                None
            }
        }
    }

    async fn apply(&mut self, command: Command, applied: Command, rate_ul_min: f64) -> Command {
        if applied != Command::Hold {
            self.stop().await;
            if self.fault_latched {
                return Command::Hold;
            }
        }
        let direction = match command {
            Command::Hold => return Command::Hold,
            Command::Inject => PumpDirection::Inject,
            Command::Withdraw => PumpDirection::Withdraw,
        };
        if self.start(direction, None, rate_ul_min).await {
            debug!(?command, rate_ul_min, "Regulation move started");
            command
        } else {
            Command::Hold
        }
    }

    /// Follow regulation commands until `token` is cancelled.
    pub async fn run_regulation(
        mut self,
        mut states: watch::Receiver<RegulationState>,
        rate_ul_min: f64,
        token: CancellationToken,
    ) -> ActuationReport {
        let mut ticker = ticker(self.poll_period);
        let mut applied = Command::Hold;
        info!(pump = %self.pump.name(), rate_ul_min, "Actuation started (regulation)");

        loop {
            let mut published = false;
            tokio::select! {
                _ = token.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        debug!("Regulation state publisher dropped");
                        break;
                    }
                    published = true;
                }
                _ = ticker.tick() => {
                    match self.poll().await {
                        Some(PumpStatus::Stalled) if applied != Command::Hold => {
                            applied = Command::Hold;
                            self.record_fault(ActuationFault::Stalled).await;
                        }
                        Some(PumpStatus::TargetReached | PumpStatus::Idle) => {
                            // The syringe ran out or someone stopped the pump.
                            applied = Command::Hold;
                        }
                        _ => {}
                    }
                }
            }

            let (wanted, acknowledged) = {
                let state = states.borrow_and_update();
                (state.last_command, state.faults)
            };
            if self.fault_latched {
                // Without a controller link any later publication releases the latch.
                let released = if self.feedback.is_some() {
                    acknowledged >= self.faults_delivered
                } else {
                    published
                };
                if !released {
                    continue;
                }
                debug!(faults = acknowledged, ?wanted, "Fault acknowledged by regulation");
                self.fault_latched = false;
            }
            if wanted != applied && !token.is_cancelled() {
                applied = self.apply(wanted, applied, rate_ul_min).await;
            }
        }

        self.stop().await;
        info!(commands = self.report.commands, faults = self.report.faults.len(), "Actuation stopped");
        self.report
    }

    /// Wait for a started move to finish. Returns `false` on cancellation.
    async fn follow_move(&mut self, mv: &PlannedMove, token: &CancellationToken) -> bool {
        let started = Instant::now();
        loop {
            if token.sleep(self.poll_period).await {
                return false;
            }
            match self.poll().await {
                Some(PumpStatus::TargetReached | PumpStatus::Idle) => {
                    self.report.steps_completed += 1;
                    let name = self.pump.name().to_string();
                    let elapsed = with_timeout(&name, self.op_timeout, self.pump.elapsed(mv.direction))
                        .await
                        .ok()
                        .flatten();
                    info!(
                        step = mv.index,
                        repetition = mv.repetition,
                        volume_ul = mv.volume_ul,
                        elapsed_s = ?elapsed,
                        "Move complete"
                    );
                    return true;
                }
                Some(PumpStatus::Stalled) => {
                    self.record_fault(ActuationFault::Stalled).await;
                    self.stop().await;
                    return true;
                }
                _ => {}
            }
            if started.elapsed() > mv.timeout {
                self.record_fault(ActuationFault::StepTimeout(mv.timeout)).await;
                self.stop().await;
                return true;
            }
        }
    }

    /// Execute `sequence`, stopping early if `token` is cancelled.
    pub async fn run_sequence(mut self, sequence: Sequence, token: CancellationToken) -> ActuationReport {
        let plan = sequence.plan();
        self.report.steps_planned = plan.len() as u64;
        info!(
            pump = %self.pump.name(),
            moves = plan.len(),
            nominal = ?sequence.total_duration(),
            "Actuation started (sequence)"
        );

        for mv in &plan {
            if token.is_cancelled() {
                break;
            }
            debug!(
                step = mv.index,
                direction = ?mv.direction,
                volume_ul = mv.volume_ul,
                rate_ul_min = mv.rate_ul_min,
                "Starting move"
            );
            if self.start(mv.direction, Some(mv.volume_ul), mv.rate_ul_min).await
                && !self.follow_move(mv, &token).await
            {
                break;
            }
            if !mv.dwell.is_zero() && token.sleep(mv.dwell).await {
                break;
            }
        }

        if token.is_cancelled() {
            self.stop().await;
            info!(completed = self.report.steps_completed, "Sequence aborted");
        } else {
            info!(completed = self.report.steps_completed, "Sequence complete");
        }
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{MockPump, PumpCall, SimulatedPlant};
    use crate::pump::SequenceBuilder;

    fn syringe() -> Syringe {
        Syringe {
            capacity_ul: 1000.0,
            initial_ul: 500.0,
        }
    }

    fn worker(pump: MockPump) -> ActuationLoop {
        ActuationLoop::new(
            Box::new(pump),
            syringe(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_regulation_mode_follows_commands() {
        let pump = MockPump::new(SimulatedPlant::default(), syringe());
        let calls = pump.calls();
        let (state_tx, state_rx) = watch::channel(RegulationState::default());
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker(pump).run_regulation(state_rx, 600.0, token.clone()));

        state_tx.send_replace(RegulationState {
            last_command: Command::Inject,
            ..RegulationState::default()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        state_tx.send_replace(RegulationState {
            last_command: Command::Withdraw,
            ..RegulationState::default()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        let report = handle.await.unwrap();

        let calls = calls.lock().clone();
        assert_eq!(
            calls[0],
            PumpCall::Start {
                direction: PumpDirection::Inject,
                volume_ul: None,
                rate_ul_min: 600.0
            }
        );
        assert_eq!(calls[1], PumpCall::Stop);
        assert!(matches!(
            calls[2],
            PumpCall::Start {
                direction: PumpDirection::Withdraw,
                ..
            }
        ));
        assert_eq!(calls.last(), Some(&PumpCall::Stop));
        assert!(report.faults.is_empty());
    }

    #[tokio::test]
    async fn test_regulation_mode_reports_faults() {
        let pump = MockPump::new(SimulatedPlant::default(), syringe()).with_stalls(1);
        let (state_tx, state_rx) = watch::channel(RegulationState::default());
        let (fb_tx, mut fb_rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            worker(pump)
                .with_feedback(fb_tx)
                .run_regulation(state_rx, 600.0, token.clone()),
        );

        state_tx.send_replace(RegulationState {
            last_command: Command::Inject,
            ..RegulationState::default()
        });

        loop {
            match fb_rx.recv().await {
                Some(ActuationFeedback::Fault(fault)) => {
                    assert_eq!(fault, ActuationFault::Stalled);
                    break;
                }
                Some(ActuationFeedback::SyringeFill(_)) => continue,
                None => panic!("feedback closed"),
            }
        }
        token.cancel();
        let report = handle.await.unwrap();
        assert_eq!(report.faults.len(), 1);
    }

    #[tokio::test]
    async fn test_stall_holds_until_fault_is_acknowledged() {
        let pump = MockPump::new(SimulatedPlant::default(), syringe())
            .with_stall_after(Duration::from_millis(20));
        let calls = pump.calls();
        let starts = || {
            calls
                .lock()
                .iter()
                .filter(|c| matches!(c, PumpCall::Start { .. }))
                .count()
        };
        let inject = |faults| RegulationState {
            last_command: Command::Inject,
            faults,
            ..RegulationState::default()
        };
        let (state_tx, state_rx) = watch::channel(RegulationState::default());
        let (fb_tx, mut fb_rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            worker(pump)
                .with_feedback(fb_tx)
                .run_regulation(state_rx, 600.0, token.clone()),
        );

        state_tx.send_replace(inject(0));
        loop {
            match fb_rx.recv().await {
                Some(ActuationFeedback::Fault(fault)) => {
                    assert_eq!(fault, ActuationFault::Stalled);
                    break;
                }
                Some(ActuationFeedback::SyringeFill(_)) => continue,
                None => panic!("feedback closed"),
            }
        }
        assert_eq!(starts(), 1);

        // Published before the controller saw the fault: must not restart
        state_tx.send_replace(inject(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(starts(), 1);

        // The controller holds, and later decides to inject again
        state_tx.send_replace(RegulationState {
            last_command: Command::Hold,
            faults: 1,
            ..RegulationState::default()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(starts(), 1);
        state_tx.send_replace(inject(1));
        tokio::time::timeout(Duration::from_secs(1), async {
            while starts() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        let report = handle.await.unwrap();
        assert_eq!(report.faults, vec![ActuationFault::Stalled.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_stops_pump() {
        let pump = MockPump::new(SimulatedPlant::default(), syringe())
            .with_start_latency(Duration::from_secs(5));
        let calls = pump.calls();
        let sequence = SequenceBuilder::new()
            .volumes(vec![10.0])
            .rates(vec![600.0])
            .directions(vec![PumpDirection::Inject])
            .build()
            .unwrap();

        let report = worker(pump)
            .run_sequence(sequence, CancellationToken::new())
            .await;
        assert_eq!(report.steps_completed, 0);
        assert_eq!(report.faults.len(), 1);
        assert!(report.faults[0].contains("did not respond"), "{}", report.faults[0]);
        assert_eq!(
            *calls.lock(),
            vec![
                PumpCall::Start {
                    direction: PumpDirection::Inject,
                    volume_ul: Some(10.0),
                    rate_ul_min: 600.0
                },
                PumpCall::Stop
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_mode_runs_all_moves() {
        let pump = MockPump::new(SimulatedPlant::default(), syringe());
        let calls = pump.calls();
        let sequence = SequenceBuilder::new()
            .volumes(vec![10.0])
            .rates(vec![600.0])
            .directions(vec![PumpDirection::Inject, PumpDirection::Withdraw])
            .repeat(2)
            .dwell(Duration::from_millis(100))
            .build()
            .unwrap();

        let report = worker(pump)
            .run_sequence(sequence, CancellationToken::new())
            .await;
        assert_eq!(report.steps_planned, 4);
        assert_eq!(report.steps_completed, 4);
        assert!(report.faults.is_empty());
        assert!(report.net_injected_ul.abs() < 1e-6);

        let starts = calls
            .lock()
            .iter()
            .filter(|c| matches!(c, PumpCall::Start { .. }))
            .count();
        assert_eq!(starts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_skips_move_beyond_capacity() {
        let pump = MockPump::new(SimulatedPlant::default(), syringe());
        let sequence = SequenceBuilder::new()
            .volumes(vec![600.0, 100.0])
            .rates(vec![6000.0])
            .directions(vec![PumpDirection::Inject])
            .build()
            .unwrap();

        let report = worker(pump)
            .run_sequence(sequence, CancellationToken::new())
            .await;
        assert_eq!(report.steps_completed, 1);
        assert_eq!(report.faults.len(), 1);
        assert!(report.faults[0].contains("available"));
    }

    #[tokio::test]
    async fn test_sequence_stops_on_cancel() {
        let pump = MockPump::new(SimulatedPlant::default(), syringe());
        let calls = pump.calls();
        let sequence = SequenceBuilder::new()
            .volumes(vec![100.0])
            .rates(vec![1.0]) // 100 minutes
            .directions(vec![PumpDirection::Inject])
            .build()
            .unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker(pump).run_sequence(sequence, token.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.steps_completed, 0);
        assert_eq!(calls.lock().last(), Some(&PumpCall::Stop));
    }
}
