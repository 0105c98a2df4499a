//! Tests for graceful shutdown: every worker observes cancellation within one
//! polling interval and returns its partial report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lab_daq::camera::CaptureSchedule;
use lab_daq::config::{PumpModeSetting, Settings};
use lab_daq::hardware::{MemoryFrameSink, MemoryTelemetry, MockCamera, MockPump, MockSensor, SimulatedPlant};
use lab_daq::pump::{PumpDirection, SequenceBuilder, Syringe};
use lab_daq::sensor::{PressureSensorKind, SampleDecoder};
use lab_daq::tasks::{
    AcquisitionLoop, ActuationLoop, SamplingConfig, SamplingLoop,
};
use lab_daq::{CancellationToken, Devices, Experiment, ExperimentPlan, TriggerGate};
use tokio::sync::watch;

const POLL: Duration = Duration::from_millis(50);

fn syringe() -> Syringe {
    Syringe {
        capacity_ul: 1000.0,
        initial_ul: 500.0,
    }
}

fn regulated_settings() -> Settings {
    let mut settings = Settings::default();
    settings.sensor.period_ms = 50;
    settings.pump.enabled = true;
    settings.pump.mode = PumpModeSetting::Regulation;
    settings.pump.poll_ms = 50;
    settings.camera.enabled = true;
    settings.camera.width = 32;
    settings.camera.height = 24;
    settings.camera.poll_ms = 50;
    settings.capture.schedule = CaptureSchedule::Interval {
        dt: 0.05,
        max_time: 60.0,
    };
    settings.regulation.target = 700.0;
    settings.regulation.tolerance = 10.0;
    settings.regulation.period_ms = 50;
    settings.regulation.capture_on_transition = true;
    settings
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_experiment_shutdown_is_graceful() {
    let settings = regulated_settings();
    settings.validate().unwrap();
    let plant = SimulatedPlant::default();
    let frames = MemoryFrameSink::new();
    let telemetry = MemoryTelemetry::new();
    let devices = Devices {
        sensor: Box::new(MockSensor::new(plant.clone(), PressureSensorKind::Mpx5010, 5.0)),
        pump: Some(Box::new(MockPump::new(plant.clone(), syringe()))),
        camera: Some(Box::new(MockCamera::new(32, 24))),
        frame_sink: Some(Box::new(frames.clone())),
        telemetry: Some(Box::new(telemetry.clone())),
    };

    let experiment = Experiment::start(ExperimentPlan::from_settings(&settings).unwrap(), devices).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let start = Instant::now();
    experiment.cancel();
    let report = experiment.join().await.unwrap();
    let elapsed = start.elapsed();

    // One polling interval plus the slowest device operation in flight
    assert!(
        elapsed < POLL * 4,
        "Graceful shutdown took too long: {:?}",
        elapsed
    );
    assert!(report.sampling.samples >= 1);
    assert!(report.regulation.is_some());
    assert!(report.actuation.is_some());
    assert!(report.acquisition.is_some());
    assert_eq!(telemetry.lines().len() as u64, report.sampling.samples);
    assert!(report.finished_at >= report.started_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_sequence_stops_pump() {
    let plant = SimulatedPlant::default();
    let pump = MockPump::new(plant.clone(), syringe());
    let calls = pump.calls();
    // 100 ul at 60 ul/min takes 100 s: far longer than the test
    let sequence = SequenceBuilder::new()
        .volumes(vec![100.0])
        .rates(vec![60.0])
        .directions(vec![PumpDirection::Inject])
        .build()
        .unwrap();

    let token = CancellationToken::new();
    let worker = ActuationLoop::new(Box::new(pump), syringe(), POLL, Duration::from_secs(1));
    let handle = tokio::spawn(worker.run_sequence(sequence, token.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let start = Instant::now();
    token.cancel();
    let report = handle.await.unwrap();
    assert!(start.elapsed() < POLL * 3);

    assert_eq!(report.steps_completed, 0);
    assert_eq!(calls.lock().last(), Some(&lab_daq::hardware::PumpCall::Stop));
    assert!(plant.net_injected_ul() > 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_sensor_read_is_abandoned_on_cancel() {
    let plant = SimulatedPlant::default();
    // Each read takes far longer than the polling interval
    let sensor = MockSensor::new(plant, PressureSensorKind::Mpx5010, 5.0)
        .with_latency(Duration::from_secs(2));
    let (tx, _rx) = watch::channel(None);
    let config = SamplingConfig {
        period: POLL,
        io_timeout: Duration::from_secs(5),
        ..SamplingConfig::default()
    };
    let token = CancellationToken::new();
    let worker = SamplingLoop::new(
        Box::new(sensor),
        SampleDecoder::new(PressureSensorKind::Mpx5010, 5.0, 4),
        config,
        tx,
        tokio::time::Instant::now(),
    );
    let handle = tokio::spawn(worker.run(token.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    token.cancel();
    let report = handle.await.unwrap();
    assert!(start.elapsed() < POLL * 2);
    assert_eq!(report.samples, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_acquisition_exits_promptly() {
    let gate = Arc::new(TriggerGate::new());
    let token = CancellationToken::new();
    let worker = AcquisitionLoop::new(
        Box::new(MockCamera::default()),
        Box::new(MemoryFrameSink::new()),
        gate,
        POLL,
        Duration::from_secs(1),
    );
    let handle = tokio::spawn(worker.run(token.clone()));
    tokio::time::sleep(Duration::from_millis(120)).await;

    let start = Instant::now();
    token.cancel();
    let report = handle.await.unwrap();
    assert!(start.elapsed() < POLL * 2);
    assert_eq!(report.frames_saved, 0);
}
