//! lab_daq command line.
//!
//! ```text
//! lab_daq run --config config/lab_daq.toml [--simulate] [--max-time 600]
//! lab_daq plan --config config/lab_daq.toml
//! lab_daq logtimes --dt0 1 --tmax 3600 --per-decade 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lab_daq::adapters::{ResponseEnd, SerialAdapter, SerialFraming};
use lab_daq::camera::{make_log_intervals, Camera, FrameSink, PgmDirectorySink};
use lab_daq::config::{PumpModeSetting, Settings, DEFAULT_CONFIG_PATH};
use lab_daq::hardware::{MockCamera, MockPump, MockSensor, SimulatedPlant};
use lab_daq::pump::{PhdUltraPump, Pump};
use lab_daq::sensor::{SensorTransport, SerialSensor};
use lab_daq::tasks::triggers;
use lab_daq::telemetry::{LineTelemetry, TelemetrySink};
use lab_daq::{Devices, Experiment, ExperimentPlan};

/// Quiet period that ends a pump reply.
const PUMP_REPLY_QUIET: Duration = Duration::from_millis(60);

#[derive(Parser)]
#[command(name = "lab_daq")]
#[command(about = "Sensor sampling, triggered imaging and syringe-pump regulation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment
    Run {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Use simulated instruments
        #[arg(long)]
        simulate: bool,
        /// Stop after this many seconds (overrides the configuration)
        #[arg(long)]
        max_time: Option<f64>,
        /// Telemetry file (overrides the configuration)
        #[arg(long)]
        telemetry: Option<PathBuf>,
        /// Save a frame every time Enter is pressed
        #[arg(long)]
        trigger_on_enter: bool,
    },
    /// Print the pump sequence without running it
    Plan {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Print logarithmically spaced capture times
    Logtimes {
        /// First interval (s)
        #[arg(long)]
        dt0: f64,
        /// Approximate total duration (s)
        #[arg(long)]
        tmax: f64,
        /// Frames per tenfold growth of the interval
        #[arg(long, default_value_t = 10)]
        per_decade: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            max_time,
            telemetry,
            trigger_on_enter,
        } => {
            let mut settings = load_settings(&config)?;
            if let Some(max_time) = max_time {
                settings.run.max_time_s = Some(max_time);
            }
            if let Some(path) = telemetry {
                settings.run.telemetry_path = Some(path);
            }
            settings.capture.trigger_on_enter |= trigger_on_enter;
            settings.validate().context("invalid command line overrides")?;

            init_tracing(&settings.run.log_level);
            cmd_run(settings, simulate).await
        }
        Commands::Plan { config } => {
            init_tracing("warn");
            cmd_plan(&load_settings(&config)?)
        }
        Commands::Logtimes {
            dt0,
            tmax,
            per_decade,
        } => cmd_logtimes(dt0, tmax, per_decade),
    }
}

fn init_tracing(default_level: &str) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load_from(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

async fn cmd_run(settings: Settings, simulate: bool) -> Result<()> {
    let plan = ExperimentPlan::from_settings(&settings)?;
    let devices = if simulate {
        simulated_devices(&settings)?
    } else {
        serial_devices(&settings)?
    };

    let experiment = Experiment::start(plan, devices)?;
    let token = experiment.token();

    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            ctrl_c_token.cancel();
        }
    });

    if settings.capture.trigger_on_enter {
        let stdin = BufReader::new(tokio::io::stdin());
        tokio::spawn(triggers::run_line_events(stdin, experiment.gate(), token.clone()));
        info!("Press Enter to save a frame");
    }

    let report = experiment.join().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_plan(settings: &Settings) -> Result<()> {
    if settings.pump.mode != PumpModeSetting::Sequence {
        warn!("pump.mode is not \"sequence\"; the plan below will not run");
    }
    let sequence = settings.sequence.build()?;
    println!("{:>5} {:>5} {:>9} {:>12} {:>14} {:>10}", "move", "rep", "direction", "volume_ul", "rate_ul_min", "timeout_s");
    for mv in sequence.plan() {
        println!(
            "{:>5} {:>5} {:>9} {:>12.3} {:>14.3} {:>10.1}",
            mv.index,
            mv.repetition,
            format!("{:?}", mv.direction).to_lowercase(),
            mv.volume_ul,
            mv.rate_ul_min,
            mv.timeout.as_secs_f64()
        );
    }
    println!("total: {:.1} s", sequence.total_duration().as_secs_f64());
    Ok(())
}

fn cmd_logtimes(dt0: f64, tmax: f64, per_decade: u32) -> Result<()> {
    if !(dt0 > 0.0 && tmax > 0.0 && per_decade > 0) {
        bail!("dt0, tmax and per-decade must be positive");
    }
    let mut t = 0.0;
    for dt in make_log_intervals(dt0, tmax, per_decade) {
        t += dt;
        println!("{:.3}", t);
    }
    Ok(())
}

fn sinks(settings: &Settings) -> Result<(Option<Box<dyn FrameSink>>, Option<Box<dyn TelemetrySink>>)> {
    let frame_sink: Option<Box<dyn FrameSink>> = if settings.camera.enabled {
        Some(Box::new(PgmDirectorySink::new(&settings.run.frames_dir).with_context(|| {
            format!("cannot create frame directory {}", settings.run.frames_dir.display())
        })?))
    } else {
        None
    };
    let telemetry: Option<Box<dyn TelemetrySink>> = match &settings.run.telemetry_path {
        Some(path) => Some(Box::new(
            LineTelemetry::create(path)
                .with_context(|| format!("cannot create telemetry file {}", path.display()))?,
        )),
        None => None,
    };
    Ok((frame_sink, telemetry))
}

fn simulated_devices(settings: &Settings) -> Result<Devices> {
    let plant = SimulatedPlant::default();
    let sensor: Box<dyn SensorTransport> = Box::new(
        MockSensor::new(plant.clone(), settings.sensor.kind, settings.sensor.vref).with_noise(2),
    );
    let pump: Option<Box<dyn Pump>> = settings
        .pump
        .enabled
        .then(|| Box::new(MockPump::new(plant, settings.pump.syringe())) as Box<dyn Pump>);
    let camera: Option<Box<dyn Camera>> = settings.camera.enabled.then(|| {
        Box::new(MockCamera::new(settings.camera.width, settings.camera.height)) as Box<dyn Camera>
    });
    let (frame_sink, telemetry) = sinks(settings)?;
    info!("Using simulated instruments");
    Ok(Devices {
        sensor,
        pump,
        camera,
        frame_sink,
        telemetry,
    })
}

fn serial_devices(settings: &Settings) -> Result<Devices> {
    if settings.camera.enabled {
        bail!("no camera driver is available outside --simulate; set camera.enabled = false");
    }

    let mut sensor_link = SerialAdapter::new(&settings.sensor.port, settings.sensor.baud_rate)
        .with_timeout(Duration::from_millis(settings.sensor.io_timeout_ms));
    sensor_link
        .connect()
        .with_context(|| format!("cannot open sensor board on {}", settings.sensor.port))?;
    let sensor: Box<dyn SensorTransport> = Box::new(SerialSensor::new(sensor_link));

    let pump: Option<Box<dyn Pump>> = if settings.pump.enabled {
        let mut pump_link = SerialAdapter::new(&settings.pump.port, settings.pump.baud_rate)
            .with_framing(SerialFraming::SevenOddTwo)
            .with_response_end(ResponseEnd::Quiet(PUMP_REPLY_QUIET))
            .with_timeout(settings.pump.io_timeout());
        pump_link
            .connect()
            .with_context(|| format!("cannot open pump on {}", settings.pump.port))?;
        Some(Box::new(PhdUltraPump::new(pump_link, settings.pump.syringe())))
    } else {
        None
    };

    let (frame_sink, telemetry) = sinks(settings)?;
    Ok(Devices {
        sensor,
        pump,
        camera: None,
        frame_sink,
        telemetry,
    })
}
