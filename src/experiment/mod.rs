//! Experiment orchestration.
//!
//! An [`Experiment`] owns one run: it spawns the workers described in
//! [`crate::tasks`], wires their channels together and shares one
//! [`CancellationToken`] and one [`TriggerGate`] between them.
//!
//! ```text
//!  SamplingLoop ──watch<PhysicalSample>──► RegulationLoop ──watch<RegulationState>──► ActuationLoop ──► pump
//!                                              ▲    │                                      │
//!                                              │    └──────── request_save ────┐           │
//!                                              └────────── mpsc<ActuationFeedback> ◄───────┘
//!  schedule / stdin ───────── request_save ──────────────► TriggerGate ◄── AcquisitionLoop ──► camera, sink
//! ```
//!
//! The run ends when the token is cancelled: by the caller, by the run time
//! limit, or by a pump sequence that finished. [`Experiment::join`] then
//! collects every worker's report into a [`RunReport`].
//!
//! # Example
//!
//! ```rust,ignore
//! let plan = ExperimentPlan::from_settings(&settings)?;
//! let experiment = Experiment::start(plan, devices)?;
//! tokio::signal::ctrl_c().await?;
//! experiment.cancel();
//! let report = experiment.join().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::camera::{Camera, FrameSink};
use crate::config::{PumpModeSetting, Settings};
use crate::core::{CancellationToken, GateStats, TriggerGate};
use crate::error::{AppResult, DaqError};
use crate::pump::{Pump, Sequence, Syringe};
use crate::regulation::{RegulationController, RegulationParams, RegulationState};
use crate::sensor::{PhysicalSample, SampleDecoder, SensorTransport};
use crate::tasks::{
    triggers, AcquisitionLoop, AcquisitionReport, ActuationLoop, ActuationReport, RegulationLoop,
    RegulationReport, SamplingConfig, SamplingLoop, SamplingReport,
};
use crate::telemetry::TelemetrySink;

/// Capacity of the actuation feedback channel.
const FEEDBACK_CAPACITY: usize = 32;

/// Instruments and sinks used by a run.
pub struct Devices {
    /// Sensor board
    pub sensor: Box<dyn SensorTransport>,
    /// Syringe pump, if attached
    pub pump: Option<Box<dyn Pump>>,
    /// Camera, if frames are acquired
    pub camera: Option<Box<dyn Camera>>,
    /// Where saved frames go; required with a camera
    pub frame_sink: Option<Box<dyn FrameSink>>,
    /// Telemetry output
    pub telemetry: Option<Box<dyn TelemetrySink>>,
}

/// What the pump does during a run.
#[derive(Clone, Debug, PartialEq)]
pub enum PumpMode {
    /// Pump not driven
    Idle,
    /// Closed-loop regulation
    Regulation {
        /// Controller parameters
        params: RegulationParams,
        /// Pump rate while injecting or withdrawing (µl/min)
        rate_ul_min: f64,
        /// Controller period
        period: Duration,
        /// Request a capture when the command changes
        capture_on_transition: bool,
    },
    /// Open-loop sequence
    Sequence {
        /// Moves to execute
        sequence: Sequence,
        /// Cancel the run once the sequence is done
        finish_run: bool,
    },
}

/// Everything needed to start a run, apart from the devices.
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentPlan {
    /// Sensor decoding
    pub decoder: SampleDecoder,
    /// Sampling worker parameters
    pub sampling: SamplingConfig,
    /// Syringe geometry
    pub syringe: Syringe,
    /// Pump status poll period
    pub pump_poll: Duration,
    /// Bound on each pump operation
    pub pump_op_timeout: Duration,
    /// Pump behaviour
    pub pump_mode: PumpMode,
    /// How often pending capture requests are checked
    pub camera_poll: Duration,
    /// Bound on each grab
    pub grab_timeout: Duration,
    /// Scheduled capture times (s since start)
    pub capture_times: Vec<f64>,
    /// Run time limit
    pub max_time: Option<Duration>,
}

impl ExperimentPlan {
    /// Derive the plan from validated settings.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let pump_mode = if settings.pump.enabled {
            match settings.pump.mode {
                PumpModeSetting::Idle => PumpMode::Idle,
                PumpModeSetting::Regulation => PumpMode::Regulation {
                    params: settings.regulation.params(),
                    rate_ul_min: settings.regulation.rate_ul_min,
                    period: Duration::from_millis(settings.regulation.period_ms),
                    capture_on_transition: settings.regulation.capture_on_transition,
                },
                PumpModeSetting::Sequence => PumpMode::Sequence {
                    sequence: settings.sequence.build()?,
                    finish_run: settings.sequence.finish_run,
                },
            }
        } else {
            PumpMode::Idle
        };

        Ok(Self {
            decoder: SampleDecoder::new(
                settings.sensor.kind,
                settings.sensor.vref,
                settings.sensor.smoothing,
            ),
            sampling: settings.sensor.sampling(),
            syringe: settings.pump.syringe(),
            pump_poll: Duration::from_millis(settings.pump.poll_ms),
            pump_op_timeout: settings.pump.op_timeout(),
            pump_mode,
            camera_poll: Duration::from_millis(settings.camera.poll_ms),
            grab_timeout: Duration::from_millis(settings.camera.grab_timeout_ms),
            capture_times: settings.capture.schedule.times(),
            max_time: settings.run.max_time(),
        })
    }
}

/// Everything the workers reported, plus run bookkeeping.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock end
    pub finished_at: DateTime<Utc>,
    /// Run duration (s)
    pub duration_s: f64,
    /// Sampling worker
    pub sampling: SamplingReport,
    /// Regulation worker, if regulating
    pub regulation: Option<RegulationReport>,
    /// Actuation worker, if a pump was driven
    pub actuation: Option<ActuationReport>,
    /// Acquisition worker, if a camera was used
    pub acquisition: Option<AcquisitionReport>,
    /// Capture requests made by the schedule
    pub scheduled_captures: u64,
    /// Capture requests made and serviced
    pub triggers: GateStats,
    /// Total device faults and failed reads
    pub faults: u64,
}

#[derive(Default)]
struct Workers {
    sampling: Option<JoinHandle<SamplingReport>>,
    regulation: Option<JoinHandle<RegulationReport>>,
    actuation: Option<JoinHandle<ActuationReport>>,
    acquisition: Option<JoinHandle<AcquisitionReport>>,
    schedule: Option<JoinHandle<u64>>,
    deadline: Option<JoinHandle<()>>,
}

/// A running experiment.
pub struct Experiment {
    token: CancellationToken,
    gate: Arc<TriggerGate>,
    epoch: Instant,
    started_at: DateTime<Utc>,
    samples: watch::Receiver<Option<PhysicalSample>>,
    states: Option<watch::Receiver<RegulationState>>,
    workers: Workers,
}

impl Experiment {
    /// Spawn the workers of a run. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`DaqError::Configuration`] when the plan needs a device that is not
    /// provided (a pump mode without a pump, a camera without a frame sink).
    pub fn start(plan: ExperimentPlan, devices: Devices) -> AppResult<Self> {
        let Devices {
            sensor,
            pump,
            camera,
            frame_sink,
            telemetry,
        } = devices;

        if pump.is_none() && plan.pump_mode != PumpMode::Idle {
            return Err(DaqError::Configuration(
                "pump mode requires a pump but none is attached".into(),
            ));
        }
        let acquisition_devices = match (camera, frame_sink) {
            (Some(camera), Some(sink)) => Some((camera, sink)),
            (None, _) => None,
            (Some(_), None) => {
                return Err(DaqError::Configuration(
                    "camera enabled without a frame sink".into(),
                ))
            }
        };

        let token = CancellationToken::new();
        let gate = Arc::new(TriggerGate::new());
        let epoch = Instant::now();
        let started_at = Utc::now();
        let mut workers = Workers::default();

        let (sample_tx, samples) = watch::channel(None);
        let mut sampling = SamplingLoop::new(sensor, plan.decoder, plan.sampling, sample_tx, epoch);
        if let Some(telemetry) = telemetry {
            sampling = sampling.with_telemetry(telemetry);
        }
        workers.sampling = Some(tokio::spawn(sampling.run(token.clone())));

        let mut states = None;
        if let Some(pump) = pump {
            let actuation = ActuationLoop::new(pump, plan.syringe, plan.pump_poll, plan.pump_op_timeout);
            match plan.pump_mode {
                PumpMode::Idle => {}
                PumpMode::Regulation {
                    params,
                    rate_ul_min,
                    period,
                    capture_on_transition,
                } => {
                    let (state_tx, state_rx) = watch::channel(RegulationState::default());
                    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_CAPACITY);
                    let mut regulation = RegulationLoop::new(
                        RegulationController::new(params),
                        period,
                        samples.clone(),
                        state_tx,
                        feedback_rx,
                    );
                    if capture_on_transition {
                        regulation = regulation.with_capture_on_transition(gate.clone());
                    }
                    workers.regulation = Some(tokio::spawn(regulation.run(token.clone())));
                    workers.actuation = Some(tokio::spawn(
                        actuation
                            .with_feedback(feedback_tx)
                            .run_regulation(state_rx.clone(), rate_ul_min, token.clone()),
                    ));
                    states = Some(state_rx);
                }
                PumpMode::Sequence {
                    sequence,
                    finish_run,
                } => {
                    let token = token.clone();
                    workers.actuation = Some(tokio::spawn(async move {
                        let report = actuation.run_sequence(sequence, token.clone()).await;
                        if finish_run && !token.is_cancelled() {
                            info!("Pump sequence finished, ending run");
                            token.cancel();
                        }
                        report
                    }));
                }
            }
        }

        if let Some((camera, sink)) = acquisition_devices {
            let acquisition =
                AcquisitionLoop::new(camera, sink, gate.clone(), plan.camera_poll, plan.grab_timeout);
            workers.acquisition = Some(tokio::spawn(acquisition.run(token.clone())));
        }

        if !plan.capture_times.is_empty() {
            workers.schedule = Some(tokio::spawn(triggers::run_schedule(
                plan.capture_times,
                gate.clone(),
                epoch,
                token.clone(),
            )));
        }

        if let Some(max_time) = plan.max_time {
            let token = token.clone();
            workers.deadline = Some(tokio::spawn(async move {
                if !token.sleep(max_time).await {
                    info!(max_time = ?max_time, "Run time limit reached");
                    token.cancel();
                }
            }));
        }

        info!(started_at = %started_at, "Experiment started");
        Ok(Self {
            token,
            gate,
            epoch,
            started_at,
            samples,
            states,
            workers,
        })
    }

    /// The run's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The run's capture request gate, for extra trigger producers.
    pub fn gate(&self) -> Arc<TriggerGate> {
        self.gate.clone()
    }

    /// Latest published samples.
    pub fn samples(&self) -> watch::Receiver<Option<PhysicalSample>> {
        self.samples.clone()
    }

    /// Latest controller snapshots, when regulating.
    pub fn regulation_states(&self) -> Option<watch::Receiver<RegulationState>> {
        self.states.clone()
    }

    /// Seconds since the run started.
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Ask every worker to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the run to end and collect the reports.
    ///
    /// Does not cancel by itself: call [`cancel`](Self::cancel) first, or
    /// rely on the time limit or a finishing sequence.
    ///
    /// # Errors
    ///
    /// [`DaqError::ShutdownFailed`] if any worker panicked.
    pub async fn join(self) -> AppResult<RunReport> {
        let Workers {
            sampling,
            regulation,
            actuation,
            acquisition,
            schedule,
            deadline,
        } = self.workers;
        let mut failures = Vec::new();

        let sampling = collect("sampling", sampling, &mut failures).await.unwrap_or_default();
        let regulation = collect("regulation", regulation, &mut failures).await;
        let actuation = collect("actuation", actuation, &mut failures).await;
        let acquisition = collect("acquisition", acquisition, &mut failures).await;
        let scheduled_captures = collect("schedule", schedule, &mut failures).await.unwrap_or(0);

        // The deadline timer outlives a run that ended early.
        self.token.cancel();
        collect("deadline", deadline, &mut failures).await;

        if !failures.is_empty() {
            return Err(DaqError::ShutdownFailed(failures));
        }

        let faults = sampling.read_failures
            + regulation.as_ref().map_or(0, |r| r.faults)
            + actuation.as_ref().map_or(0, |a| a.faults.len() as u64)
            + acquisition
                .as_ref()
                .map_or(0, |a| a.grab_failures + a.save_failures);

        let finished_at = Utc::now();
        let report = RunReport {
            started_at: self.started_at,
            finished_at,
            duration_s: self.epoch.elapsed().as_secs_f64(),
            sampling,
            regulation,
            actuation,
            acquisition,
            scheduled_captures,
            triggers: self.gate.stats(),
            faults,
        };
        info!(
            duration_s = report.duration_s,
            samples = report.sampling.samples,
            faults = report.faults,
            "Experiment finished"
        );
        Ok(report)
    }
}

async fn collect<T>(
    name: &str,
    handle: Option<JoinHandle<T>>,
    failures: &mut Vec<DaqError>,
) -> Option<T> {
    match handle?.await {
        Ok(report) => Some(report),
        Err(e) => {
            error!(task = name, error = %e, "Worker terminated abnormally");
            failures.push(DaqError::TaskFailed(name.to_string()));
            None
        }
    }
}
