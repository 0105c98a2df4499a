//! Run configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `LABDAQ_`, using `__` between
//!    section and key
//!
//! ```text
//! LABDAQ_RUN__LOG_LEVEL=debug
//! LABDAQ_PUMP__PORT=/dev/ttyUSB1
//! LABDAQ_REGULATION__TARGET=350
//! ```
//!
//! Every key has a default, so an empty file is a valid (sensor-only,
//! unbounded) run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::camera::CaptureSchedule;
use crate::error::{AppResult, DaqError};
use crate::pump::{phd_ultra, PumpDirection, Sequence, SequenceBuilder, Syringe};
use crate::regulation::{RegulationDirection, RegulationParams};
use crate::sensor::{MeasuredChannel, PressureSensorKind, HUMIDITY_SENSOR_ADDRESS};
use crate::tasks::SamplingConfig;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/lab_daq.toml";

/// Longest span any configured time may cover (s): run limit, hold-off,
/// dwell, capture times.
pub const MAX_RUN_SECONDS: f64 = 366.0 * 86_400.0;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Run-wide settings
    #[serde(default)]
    pub run: RunSettings,
    /// Sensor board
    #[serde(default)]
    pub sensor: SensorSettings,
    /// Syringe pump
    #[serde(default)]
    pub pump: PumpSettings,
    /// Camera
    #[serde(default)]
    pub camera: CameraSettings,
    /// When frames are saved
    #[serde(default)]
    pub capture: CaptureSettings,
    /// Closed-loop regulation
    #[serde(default)]
    pub regulation: RegulationSettings,
    /// Open-loop pump sequence
    #[serde(default)]
    pub sequence: SequenceSettings,
}

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSettings {
    /// Stop the run after this many seconds
    #[serde(default)]
    pub max_time_s: Option<f64>,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Telemetry file, one line per sample
    #[serde(default)]
    pub telemetry_path: Option<PathBuf>,
    /// Directory receiving saved frames
    #[serde(default = "default_frames_dir")]
    pub frames_dir: PathBuf,
}

/// Sensor board settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorSettings {
    /// Serial port of the board
    #[serde(default = "default_sensor_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_sensor_baud_rate")]
    pub baud_rate: u32,
    /// Fitted pressure transducer
    #[serde(default)]
    pub kind: PressureSensorKind,
    /// ADC reference voltage (V)
    #[serde(default = "default_vref")]
    pub vref: f64,
    /// Number of pressure channels (1 or 2)
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Analog codes averaged per channel per tick
    #[serde(default = "default_smoothing")]
    pub smoothing: usize,
    /// Bus address of the humidity/temperature chip
    #[serde(default = "default_address")]
    pub address: u8,
    /// Sampling period in milliseconds
    #[serde(default = "default_sensor_period")]
    pub period_ms: u64,
    /// Bound on each read in milliseconds
    #[serde(default = "default_sensor_timeout")]
    pub io_timeout_ms: u64,
}

/// What the pump does during the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PumpModeSetting {
    /// Pump left alone
    #[default]
    Idle,
    /// Follow the regulation controller
    Regulation,
    /// Execute the configured sequence
    Sequence,
}

/// Syringe pump settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PumpSettings {
    /// Whether a pump is attached
    #[serde(default)]
    pub enabled: bool,
    /// Serial port of the pump
    #[serde(default = "default_pump_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_pump_baud_rate")]
    pub baud_rate: u32,
    /// Syringe volume (µl)
    #[serde(default = "default_syringe_capacity")]
    pub syringe_capacity_ul: f64,
    /// Syringe contents at start (µl)
    #[serde(default = "default_syringe_initial")]
    pub syringe_initial_ul: f64,
    /// Status poll period in milliseconds
    #[serde(default = "default_pump_poll")]
    pub poll_ms: u64,
    /// Bound on each serial query in milliseconds
    #[serde(default = "default_pump_timeout")]
    pub io_timeout_ms: u64,
    /// Bound on a whole pump operation (start, stop, poll) in milliseconds.
    /// Defaults to enough time for every query of a start.
    #[serde(default)]
    pub op_timeout_ms: Option<u64>,
    /// Regulation, sequence or idle
    #[serde(default)]
    pub mode: PumpModeSetting,
}

/// Camera settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraSettings {
    /// Whether frames are acquired
    #[serde(default)]
    pub enabled: bool,
    /// Frame width (simulated camera)
    #[serde(default = "default_width")]
    pub width: usize,
    /// Frame height (simulated camera)
    #[serde(default = "default_height")]
    pub height: usize,
    /// How often pending capture requests are checked, in milliseconds
    #[serde(default = "default_camera_poll")]
    pub poll_ms: u64,
    /// Bound on each grab in milliseconds
    #[serde(default = "default_grab_timeout")]
    pub grab_timeout_ms: u64,
}

/// Capture request producers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaptureSettings {
    /// Scheduled captures
    #[serde(default)]
    pub schedule: CaptureSchedule,
    /// Request a capture on every line typed on stdin
    #[serde(default)]
    pub trigger_on_enter: bool,
}

/// Regulation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegulationSettings {
    /// Set point
    #[serde(default)]
    pub target: f64,
    /// Absolute half-width of the band
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Relative half-width of the band
    #[serde(default)]
    pub relative_tolerance: f64,
    /// Which pump direction raises the measurement
    #[serde(default)]
    pub direction: RegulationDirection,
    /// Regulated quantity
    #[serde(default)]
    pub channel: MeasuredChannel,
    /// Pump rate while regulating (µl/min)
    #[serde(default = "default_regulation_rate")]
    pub rate_ul_min: f64,
    /// Controller period in milliseconds
    #[serde(default = "default_regulation_period")]
    pub period_ms: u64,
    /// Hold after a pump fault, in seconds
    #[serde(default = "default_fault_hold_off")]
    pub fault_hold_off_s: f64,
    /// Fraction of the syringe kept in reserve at either end
    #[serde(default = "default_syringe_guard")]
    pub syringe_guard: f64,
    /// Request a capture whenever the command changes
    #[serde(default)]
    pub capture_on_transition: bool,
}

/// Pump sequence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceSettings {
    /// Volumes per step (µl)
    #[serde(default)]
    pub volumes_ul: Vec<f64>,
    /// Rates per step (µl/min)
    #[serde(default)]
    pub rates_ul_min: Vec<f64>,
    /// Directions per step
    #[serde(default)]
    pub directions: Vec<PumpDirection>,
    /// Repetitions of the whole list
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Pause after each move (s)
    #[serde(default)]
    pub dwell_s: f64,
    /// Halve the first and last move
    #[serde(default)]
    pub centered: bool,
    /// End the run when the sequence is done
    #[serde(default = "default_true")]
    pub finish_run: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_frames_dir() -> PathBuf {
    PathBuf::from("frames")
}

fn default_sensor_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_sensor_baud_rate() -> u32 {
    115_200
}

fn default_vref() -> f64 {
    5.0
}

fn default_channels() -> usize {
    2
}

fn default_smoothing() -> usize {
    10
}

fn default_address() -> u8 {
    HUMIDITY_SENSOR_ADDRESS
}

fn default_sensor_period() -> u64 {
    250
}

fn default_sensor_timeout() -> u64 {
    500
}

fn default_pump_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_pump_baud_rate() -> u32 {
    crate::pump::phd_ultra::DEFAULT_BAUD_RATE
}

fn default_syringe_capacity() -> f64 {
    1000.0
}

fn default_syringe_initial() -> f64 {
    500.0
}

fn default_pump_poll() -> u64 {
    200
}

fn default_pump_timeout() -> u64 {
    1000
}

fn default_width() -> usize {
    640
}

fn default_height() -> usize {
    480
}

fn default_camera_poll() -> u64 {
    20
}

fn default_grab_timeout() -> u64 {
    2000
}

fn default_tolerance() -> f64 {
    5.0
}

fn default_regulation_rate() -> f64 {
    100.0
}

fn default_regulation_period() -> u64 {
    250
}

fn default_fault_hold_off() -> f64 {
    5.0
}

fn default_syringe_guard() -> f64 {
    0.02
}

fn default_repeat() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_time_s: None,
            log_level: default_log_level(),
            telemetry_path: None,
            frames_dir: default_frames_dir(),
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            port: default_sensor_port(),
            baud_rate: default_sensor_baud_rate(),
            kind: PressureSensorKind::default(),
            vref: default_vref(),
            channels: default_channels(),
            smoothing: default_smoothing(),
            address: default_address(),
            period_ms: default_sensor_period(),
            io_timeout_ms: default_sensor_timeout(),
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_pump_port(),
            baud_rate: default_pump_baud_rate(),
            syringe_capacity_ul: default_syringe_capacity(),
            syringe_initial_ul: default_syringe_initial(),
            poll_ms: default_pump_poll(),
            io_timeout_ms: default_pump_timeout(),
            op_timeout_ms: None,
            mode: PumpModeSetting::default(),
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            width: default_width(),
            height: default_height(),
            poll_ms: default_camera_poll(),
            grab_timeout_ms: default_grab_timeout(),
        }
    }
}

impl Default for RegulationSettings {
    fn default() -> Self {
        Self {
            target: 0.0,
            tolerance: default_tolerance(),
            relative_tolerance: 0.0,
            direction: RegulationDirection::default(),
            channel: MeasuredChannel::default(),
            rate_ul_min: default_regulation_rate(),
            period_ms: default_regulation_period(),
            fault_hold_off_s: default_fault_hold_off(),
            syringe_guard: default_syringe_guard(),
            capture_on_transition: false,
        }
    }
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            volumes_ul: Vec::new(),
            rates_ul_min: Vec::new(),
            directions: Vec::new(),
            repeat: default_repeat(),
            dwell_s: 0.0,
            centered: false,
            finish_run: default_true(),
        }
    }
}

// ============================================================================
// Conversions into runtime types
// ============================================================================

impl RunSettings {
    /// Run time limit.
    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_s.map(seconds)
    }
}

impl SensorSettings {
    /// Sampling worker parameters.
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            period: Duration::from_millis(self.period_ms),
            channels: self.channels,
            address: self.address,
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }
}

impl PumpSettings {
    /// Bound on one serial query.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Bound on one pump operation.
    pub fn op_timeout(&self) -> Duration {
        match self.op_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => phd_ultra::start_budget(self.io_timeout()),
        }
    }

    /// Syringe geometry.
    pub fn syringe(&self) -> Syringe {
        Syringe {
            capacity_ul: self.syringe_capacity_ul,
            initial_ul: self.syringe_initial_ul,
        }
    }
}

impl RegulationSettings {
    /// Controller parameters.
    pub fn params(&self) -> RegulationParams {
        RegulationParams {
            target: self.target,
            tolerance: self.tolerance,
            relative_tolerance: self.relative_tolerance,
            direction: self.direction,
            channel: self.channel,
            fault_hold_off: seconds(self.fault_hold_off_s),
            syringe_guard: self.syringe_guard,
        }
    }
}

impl SequenceSettings {
    /// Build the pump sequence.
    pub fn build(&self) -> AppResult<Sequence> {
        if !(self.dwell_s.is_finite() && (0.0..=MAX_RUN_SECONDS).contains(&self.dwell_s)) {
            return Err(DaqError::Validation(format!(
                "dwell must be within 0..={} s, got {}",
                MAX_RUN_SECONDS, self.dwell_s
            )));
        }
        SequenceBuilder::new()
            .volumes(self.volumes_ul.clone())
            .rates(self.rates_ul_min.clone())
            .directions(self.directions.clone())
            .repeat(self.repeat)
            .dwell(seconds(self.dwell_s))
            .centered(self.centered)
            .build()
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Configuration`] with a descriptive message for the
    /// first failure found.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.run.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.run.log_level,
                valid_levels.join(", ")
            )));
        }
        if let Some(max_time) = self.run.max_time_s {
            require_positive("run.max_time_s", max_time)?;
            require_at_most_run("run.max_time_s", max_time)?;
        }

        if !(1..=2).contains(&self.sensor.channels) {
            return Err(DaqError::Configuration(format!(
                "sensor.channels must be 1 or 2, got {}",
                self.sensor.channels
            )));
        }
        require_positive("sensor.vref", self.sensor.vref)?;
        require_nonzero("sensor.period_ms", self.sensor.period_ms)?;
        require_nonzero("sensor.io_timeout_ms", self.sensor.io_timeout_ms)?;

        if self.pump.enabled {
            require_positive("pump.syringe_capacity_ul", self.pump.syringe_capacity_ul)?;
            if !(0.0..=self.pump.syringe_capacity_ul).contains(&self.pump.syringe_initial_ul) {
                return Err(DaqError::Configuration(format!(
                    "pump.syringe_initial_ul must be within 0..={}, got {}",
                    self.pump.syringe_capacity_ul, self.pump.syringe_initial_ul
                )));
            }
            require_nonzero("pump.poll_ms", self.pump.poll_ms)?;
            require_nonzero("pump.io_timeout_ms", self.pump.io_timeout_ms)?;
            if let Some(op_timeout_ms) = self.pump.op_timeout_ms {
                require_nonzero("pump.op_timeout_ms", op_timeout_ms)?;
                if op_timeout_ms < self.pump.io_timeout_ms {
                    return Err(DaqError::Configuration(format!(
                        "pump.op_timeout_ms ({}) must not be shorter than pump.io_timeout_ms ({})",
                        op_timeout_ms, self.pump.io_timeout_ms
                    )));
                }
            }

            match self.pump.mode {
                PumpModeSetting::Idle => {}
                PumpModeSetting::Regulation => self.validate_regulation()?,
                PumpModeSetting::Sequence => {
                    self.sequence
                        .build()
                        .map_err(|e| DaqError::Configuration(format!("sequence: {}", e)))?;
                }
            }
        }

        if self.camera.enabled {
            if self.camera.width == 0 || self.camera.height == 0 {
                return Err(DaqError::Configuration(
                    "camera width and height must be non-zero".into(),
                ));
            }
            require_nonzero("camera.poll_ms", self.camera.poll_ms)?;
            require_nonzero("camera.grab_timeout_ms", self.camera.grab_timeout_ms)?;
        }
        self.capture.schedule.validate()?;

        Ok(())
    }

    fn validate_regulation(&self) -> AppResult<()> {
        let r = &self.regulation;
        if !r.target.is_finite() {
            return Err(DaqError::Configuration(format!(
                "regulation.target must be finite, got {}",
                r.target
            )));
        }
        require_non_negative("regulation.tolerance", r.tolerance)?;
        require_non_negative("regulation.relative_tolerance", r.relative_tolerance)?;
        require_non_negative("regulation.fault_hold_off_s", r.fault_hold_off_s)?;
        require_at_most_run("regulation.fault_hold_off_s", r.fault_hold_off_s)?;
        require_positive("regulation.rate_ul_min", r.rate_ul_min)?;
        require_nonzero("regulation.period_ms", r.period_ms)?;
        if !(0.0..0.5).contains(&r.syringe_guard) {
            return Err(DaqError::Configuration(format!(
                "regulation.syringe_guard must be within 0..0.5, got {}",
                r.syringe_guard
            )));
        }
        if r.channel == MeasuredChannel::Pressure2 && self.sensor.channels < 2 {
            return Err(DaqError::Configuration(
                "regulation.channel is pressure2 but only one sensor channel is configured".into(),
            ));
        }
        Ok(())
    }
}

fn require_positive(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{} must be positive, got {}",
            name, value
        )))
    }
}

fn require_non_negative(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{} must be non-negative, got {}",
            name, value
        )))
    }
}

fn require_at_most_run(name: &str, value: f64) -> AppResult<()> {
    if value <= MAX_RUN_SECONDS {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{} must be at most {} s, got {}",
            name, MAX_RUN_SECONDS, value
        )))
    }
}

/// Seconds to a duration, clamped to `0..=MAX_RUN_SECONDS`; NaN is zero.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_RUN_SECONDS)).unwrap_or_default()
}

fn require_nonzero(name: &str, value: u64) -> AppResult<()> {
    if value == 0 {
        Err(DaqError::Configuration(format!("{} must be non-zero", name)))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.sensor.address, 0x27);
        assert_eq!(settings.pump.baud_rate, 19_200);
        assert_eq!(settings.capture.schedule, CaptureSchedule::None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[run]
max_time_s = 120.0
log_level = "debug"

[sensor]
kind = "mpx5100"
channels = 1

[pump]
enabled = true
mode = "sequence"

[sequence]
volumes_ul = [10.0, 20.0]
rates_ul_min = [100.0]
directions = ["inject", "withdraw"]
repeat = 3
dwell_s = 0.5

[capture.schedule]
kind = "logarithmic"
dt0 = 1.0
tmax = 100.0
per_decade = 5
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.run.max_time_s, Some(120.0));
        assert_eq!(settings.sensor.kind, PressureSensorKind::Mpx5100);
        assert_eq!(settings.pump.mode, PumpModeSetting::Sequence);
        assert_eq!(settings.sequence.build().unwrap().plan().len(), 6);
        assert!(matches!(
            settings.capture.schedule,
            CaptureSchedule::Logarithmic { per_decade: 5, .. }
        ));
    }

    #[test]
    fn test_invalid_sequence_rejected_when_used() {
        let mut settings = Settings::default();
        settings.pump.enabled = true;
        settings.pump.mode = PumpModeSetting::Sequence;
        settings.sequence.volumes_ul = vec![0.0];
        settings.sequence.rates_ul_min = vec![100.0];
        settings.sequence.directions = vec![PumpDirection::Inject];

        let err = settings.validate().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));

        // Idle pump does not care about the sequence
        settings.pump.mode = PumpModeSetting::Idle;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut settings = Settings::default();
        settings.run.log_level = "verbose".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.sensor.channels = 3;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.pump.enabled = true;
        settings.pump.syringe_initial_ul = 2000.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.pump.enabled = true;
        settings.pump.mode = PumpModeSetting::Regulation;
        settings.regulation.rate_ul_min = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_times_beyond_run_limit_rejected() {
        let mut settings = Settings::default();
        settings.run.max_time_s = Some(1e300);
        assert!(matches!(settings.validate(), Err(DaqError::Configuration(_))));

        let mut settings = Settings::default();
        settings.pump.enabled = true;
        settings.pump.mode = PumpModeSetting::Regulation;
        settings.regulation.fault_hold_off_s = 1e300;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.pump.enabled = true;
        settings.pump.mode = PumpModeSetting::Sequence;
        settings.sequence.volumes_ul = vec![10.0];
        settings.sequence.rates_ul_min = vec![100.0];
        settings.sequence.directions = vec![PumpDirection::Inject];
        settings.sequence.dwell_s = 1e300;
        assert!(settings.validate().is_err());

        let settings = RunSettings {
            max_time_s: Some(f64::NAN),
            ..RunSettings::default()
        };
        assert_eq!(settings.max_time(), Some(Duration::ZERO));
    }

    #[test]
    fn test_pump_op_timeout_covers_a_start() {
        let mut settings = Settings::default();
        settings.pump.io_timeout_ms = 1000;
        assert_eq!(settings.pump.io_timeout(), Duration::from_secs(1));
        assert!(settings.pump.op_timeout() >= Duration::from_secs(u64::from(phd_ultra::START_QUERIES)));

        settings.pump.op_timeout_ms = Some(30_000);
        assert_eq!(settings.pump.op_timeout(), Duration::from_secs(30));

        settings.pump.enabled = true;
        settings.pump.op_timeout_ms = Some(500);
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("op_timeout_ms"), "{}", err);
    }

    #[test]
    fn test_regulation_params_conversion() {
        let settings = RegulationSettings {
            target: 100.0,
            tolerance: 5.0,
            fault_hold_off_s: 2.5,
            ..RegulationSettings::default()
        };
        let params = settings.params();
        assert_eq!(params.target, 100.0);
        assert_eq!(params.fault_hold_off, Duration::from_millis(2500));
        assert_eq!(params.syringe_guard, 0.02);
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "lab_daq.toml",
                r#"
[run]
log_level = "info"

[regulation]
target = 100.0
"#,
            )?;
            jail.set_env("LABDAQ_RUN__LOG_LEVEL", "warn");
            jail.set_env("LABDAQ_REGULATION__TARGET", "250.5");
            jail.set_env("LABDAQ_PUMP__PORT", "/dev/ttyUSB7");

            let settings = Settings::load_from("lab_daq.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.run.log_level, "warn");
            assert_eq!(settings.regulation.target, 250.5);
            assert_eq!(settings.pump.port, "/dev/ttyUSB7");
            Ok(())
        });
    }
}
