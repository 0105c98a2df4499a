//! Mock Hardware Implementations
//!
//! Provides simulated devices for testing and for `--simulate` runs.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - [`SimulatedPlant`] - shared physical state: pressure follows the net volume
//!   injected by the pump, so the regulation loop can be closed in software
//! - [`MockSensor`] - sensor board producing ADC codes and humidity/temperature
//!   transactions, with optional dropped transactions
//! - [`MockPump`] - syringe pump moving at its nominal rate, with capacity
//!   checks and injectable stalls
//! - [`MockCamera`] - camera producing synthetic frames
//! - [`MemoryFrameSink`], [`MemoryTelemetry`] - in-memory sinks for tests

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::camera::{Camera, Frame, FrameSink};
use crate::error::{ActuationFault, AppResult, DaqError};
use crate::pump::{Pump, PumpDirection, PumpReading, PumpStatus, Syringe};
use crate::sensor::decoder::{PressureSensorKind, PressureTransfer, ADC_FULL_SCALE};
use crate::sensor::{PhysicalSample, SensorTransport};
use crate::telemetry::{format_line, TelemetrySink};

// =============================================================================
// SimulatedPlant - shared physical state
// =============================================================================

#[derive(Debug)]
struct PlantState {
    net_injected_ul: f64,
}

/// Physical system seen by the mock sensor and moved by the mock pump.
///
/// Pressure is linear in the net volume injected:
/// `P = baseline_pa + gain_pa_per_ul * net_injected_ul`.
#[derive(Clone, Debug)]
pub struct SimulatedPlant {
    state: Arc<Mutex<PlantState>>,
    baseline_pa: f64,
    gain_pa_per_ul: f64,
}

impl SimulatedPlant {
    /// Create a plant at `baseline_pa` with the given compliance.
    pub fn new(baseline_pa: f64, gain_pa_per_ul: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlantState {
                net_injected_ul: 0.0,
            })),
            baseline_pa,
            gain_pa_per_ul,
        }
    }

    /// Current pressure (Pa).
    pub fn pressure_pa(&self) -> f64 {
        self.baseline_pa + self.gain_pa_per_ul * self.state.lock().net_injected_ul
    }

    /// Net volume injected so far (µl).
    pub fn net_injected_ul(&self) -> f64 {
        self.state.lock().net_injected_ul
    }

    fn displace(&self, delta_ul: f64) {
        self.state.lock().net_injected_ul += delta_ul;
    }
}

impl Default for SimulatedPlant {
    fn default() -> Self {
        Self::new(500.0, 10.0)
    }
}

// =============================================================================
// MockSensor - Simulated sensor board
// =============================================================================

/// Simulated sensor board.
///
/// Channel 0 reads the plant pressure, channel 1 reads half of it. The
/// humidity/temperature chip reports fixed values, and every `drop_every`-th
/// transaction comes back empty.
pub struct MockSensor {
    plant: SimulatedPlant,
    transfer: PressureTransfer,
    humidity: f64,
    temperature: f64,
    noise_codes: i32,
    drop_every: Option<u64>,
    latency: Duration,
    transactions: u64,
    rng: StdRng,
}

impl MockSensor {
    /// Create a sensor observing `plant` through `kind` transducers at `vref`.
    pub fn new(plant: SimulatedPlant, kind: PressureSensorKind, vref: f64) -> Self {
        Self {
            plant,
            transfer: PressureTransfer::for_sensor(kind, vref),
            humidity: 45.0,
            temperature: 22.0,
            noise_codes: 0,
            drop_every: None,
            latency: Duration::from_millis(1),
            transactions: 0,
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }

    /// Add uniform noise of ±`codes` to each analog read.
    pub fn with_noise(mut self, codes: u16) -> Self {
        self.noise_codes = i32::from(codes);
        self
    }

    /// Fail every `n`-th humidity/temperature transaction.
    pub fn with_dropped_transactions(mut self, n: u64) -> Self {
        self.drop_every = Some(n.max(1));
        self
    }

    /// Delay applied to every read.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reported humidity (%) and temperature (°C).
    pub fn with_climate(mut self, humidity: f64, temperature: f64) -> Self {
        self.humidity = humidity;
        self.temperature = temperature;
        self
    }

    fn pressure_to_code(&self, pressure_pa: f64) -> i32 {
        let t = &self.transfer;
        let ratio = pressure_pa / 1000.0 * t.slope + t.offset;
        (ratio * ADC_FULL_SCALE).round() as i32
    }

    fn encode_climate(&self) -> Vec<u8> {
        let humidity_raw = ((self.humidity / 100.0) * 16383.0).round().clamp(0.0, 16383.0) as u32;
        let temperature_raw = ((self.temperature + 40.0) / 165.0 * 16383.0)
            .round()
            .clamp(0.0, 16383.0) as u32;
        vec![
            ((humidity_raw >> 8) & 0x3F) as u8,
            (humidity_raw & 0xFF) as u8,
            ((temperature_raw >> 6) & 0xFF) as u8,
            ((temperature_raw & 0x3F) << 2) as u8,
        ]
    }
}

#[async_trait]
impl SensorTransport for MockSensor {
    async fn read_analog(&mut self, channel: usize) -> AppResult<u16> {
        sleep(self.latency).await;
        let pressure = match channel {
            0 => self.plant.pressure_pa(),
            1 => self.plant.pressure_pa() / 2.0,
            _ => {
                return Err(DaqError::Instrument(format!(
                    "mock sensor has no analog channel {}",
                    channel
                )))
            }
        };
        let noise = if self.noise_codes > 0 {
            self.rng.gen_range(-self.noise_codes..=self.noise_codes)
        } else {
            0
        };
        let code = (self.pressure_to_code(pressure) + noise).clamp(0, 1023);
        Ok(code as u16)
    }

    async fn transaction(&mut self, _address: u8, len: usize) -> AppResult<Vec<u8>> {
        sleep(self.latency).await;
        self.transactions += 1;
        if let Some(n) = self.drop_every {
            if self.transactions % n == 0 {
                return Ok(Vec::new());
            }
        }
        let mut bytes = self.encode_climate();
        bytes.truncate(len);
        Ok(bytes)
    }
}

// =============================================================================
// MockPump - Simulated syringe pump
// =============================================================================

/// Call made on a [`MockPump`], recorded for assertions.
#[derive(Clone, Debug, PartialEq)]
pub enum PumpCall {
    /// `start` was called
    Start {
        /// Requested direction
        direction: PumpDirection,
        /// Requested volume (µl)
        volume_ul: Option<f64>,
        /// Requested rate (µl/min)
        rate_ul_min: f64,
    },
    /// `stop` was called
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    direction: PumpDirection,
    rate_ul_min: f64,
    remaining_ul: f64,
    started: Instant,
    last_update: Instant,
}

/// Simulated syringe pump.
///
/// Moves at its nominal rate in simulated time and displaces the
/// [`SimulatedPlant`] accordingly.
pub struct MockPump {
    plant: SimulatedPlant,
    syringe: Syringe,
    motion: Option<Motion>,
    status: PumpStatus,
    infused_ul: f64,
    withdrawn_ul: f64,
    stalls_remaining: u32,
    stall_after: Option<Duration>,
    start_latency: Duration,
    calls: Arc<Mutex<Vec<PumpCall>>>,
}

impl MockPump {
    /// Create a pump acting on `plant`.
    pub fn new(plant: SimulatedPlant, syringe: Syringe) -> Self {
        Self {
            plant,
            syringe,
            motion: None,
            status: PumpStatus::Idle,
            infused_ul: 0.0,
            withdrawn_ul: 0.0,
            stalls_remaining: 0,
            stall_after: None,
            start_latency: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The next `count` starts stall.
    pub fn with_stalls(mut self, count: u32) -> Self {
        self.stalls_remaining = count;
        self
    }

    /// The next move stalls once it has run for `after`.
    pub fn with_stall_after(mut self, after: Duration) -> Self {
        self.stall_after = Some(after);
        self
    }

    /// Every start takes `latency` before the motor runs.
    pub fn with_start_latency(mut self, latency: Duration) -> Self {
        self.start_latency = latency;
        self
    }

    /// Shared handle on the recorded calls.
    pub fn calls(&self) -> Arc<Mutex<Vec<PumpCall>>> {
        Arc::clone(&self.calls)
    }

    fn net_injected_ul(&self) -> f64 {
        self.infused_ul - self.withdrawn_ul
    }

    fn advance(&mut self) {
        let Some(mut motion) = self.motion else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(motion.last_update).as_secs_f64();
        let moved = (motion.rate_ul_min / 60.0 * elapsed).min(motion.remaining_ul);
        motion.remaining_ul -= moved;
        motion.last_update = now;

        match motion.direction {
            PumpDirection::Inject => {
                self.infused_ul += moved;
                self.plant.displace(moved);
            }
            PumpDirection::Withdraw => {
                self.withdrawn_ul += moved;
                self.plant.displace(-moved);
            }
        }

        if self
            .stall_after
            .is_some_and(|after| now.duration_since(motion.started) >= after)
        {
            self.stall_after = None;
            self.motion = None;
            self.status = PumpStatus::Stalled;
        } else if motion.remaining_ul <= 0.0 {
            self.motion = None;
            self.status = PumpStatus::TargetReached;
        } else {
            self.motion = Some(motion);
        }
    }
}

#[async_trait]
impl Pump for MockPump {
    fn name(&self) -> &str {
        "mock_pump"
    }

    async fn start(
        &mut self,
        direction: PumpDirection,
        volume_ul: Option<f64>,
        rate_ul_min: f64,
    ) -> AppResult<()> {
        self.calls.lock().push(PumpCall::Start {
            direction,
            volume_ul,
            rate_ul_min,
        });
        if !self.start_latency.is_zero() {
            sleep(self.start_latency).await;
        }
        self.advance();

        let net = self.net_injected_ul();
        if let Some(volume) = volume_ul {
            self.syringe.check_move(direction, volume, net)?;
        }
        if self.stalls_remaining > 0 {
            self.stalls_remaining -= 1;
            self.motion = None;
            self.status = PumpStatus::Stalled;
            return Err(ActuationFault::Stalled.into());
        }

        let available = self.syringe.available_ul(direction, net);
        self.motion = Some(Motion {
            direction,
            rate_ul_min,
            remaining_ul: volume_ul.unwrap_or(available).min(available),
            started: Instant::now(),
            last_update: Instant::now(),
        });
        self.status = match direction {
            PumpDirection::Inject => PumpStatus::Infusing,
            PumpDirection::Withdraw => PumpStatus::Withdrawing,
        };
        debug!(?direction, ?volume_ul, rate_ul_min, "MockPump: started");
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.calls.lock().push(PumpCall::Stop);
        self.advance();
        self.motion = None;
        if self.status.is_moving() {
            self.status = PumpStatus::Idle;
        }
        Ok(())
    }

    async fn poll(&mut self) -> AppResult<PumpReading> {
        self.advance();
        Ok(PumpReading {
            status: self.status,
            infused_ul: self.infused_ul,
            withdrawn_ul: self.withdrawn_ul,
        })
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Mock camera producing synthetic 8-bit frames.
///
/// Every `fail_every`-th grab fails, which lets tests check that a pending
/// capture request survives a failed grab.
pub struct MockCamera {
    resolution: (usize, usize),
    readout: Duration,
    frame_count: u64,
    fail_every: Option<u64>,
}

impl MockCamera {
    /// Create new mock camera with specified resolution
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            resolution: (width, height),
            readout: Duration::from_millis(5),
            frame_count: 0,
            fail_every: None,
        }
    }

    /// Simulated readout time per frame.
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// Fail every `n`-th grab.
    pub fn with_failures(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Grabs attempted so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(64, 48)
    }
}

#[async_trait]
impl Camera for MockCamera {
    fn name(&self) -> &str {
        "mock_camera"
    }

    async fn grab(&mut self) -> AppResult<Frame> {
        sleep(self.readout).await;
        self.frame_count += 1;
        if let Some(n) = self.fail_every {
            if self.frame_count % n == 0 {
                return Err(DaqError::Instrument(format!(
                    "MockCamera: grab {} failed",
                    self.frame_count
                )));
            }
        }
        let (width, height) = self.resolution;
        let shift = self.frame_count as usize;
        let pixels = (0..height)
            .flat_map(|y| (0..width).map(move |x| ((x + y + shift) % 256) as u16))
            .collect();
        Frame::new(width, height, pixels, 255)
    }
}

// =============================================================================
// In-memory sinks
// =============================================================================

/// Frame sink remembering which capture indices were saved.
#[derive(Clone, Default)]
pub struct MemoryFrameSink {
    saved: Arc<Mutex<Vec<u64>>>,
}

impl MemoryFrameSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indices saved so far.
    pub fn saved(&self) -> Vec<u64> {
        self.saved.lock().clone()
    }
}

impl FrameSink for MemoryFrameSink {
    fn save(&mut self, index: u64, _frame: &Frame) -> AppResult<()> {
        self.saved.lock().push(index);
        Ok(())
    }
}

/// Telemetry sink keeping the formatted lines in memory.
#[derive(Clone, Default)]
pub struct MemoryTelemetry {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryTelemetry {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines recorded so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn record(&mut self, sample: &PhysicalSample) -> AppResult<()> {
        self.lines.lock().push(format_line(sample));
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
