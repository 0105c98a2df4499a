//! Core library for the lab_daq application.
//!
//! lab_daq coordinates a pressure/humidity/temperature sensor board, a syringe
//! pump and a camera during unattended bench experiments: it samples the
//! sensor, saves frames on schedules and events, and can close a bang-bang
//! loop that drives the pump to hold a measured quantity near a target.
//!
//! - [`core`]: cancellation token and capture trigger gate shared by workers
//! - [`sensor`]: sensor transport and raw-to-physical decoding
//! - [`regulation`]: bang-bang controller
//! - [`pump`]: pump capability, PhD Ultra driver, move sequences
//! - [`camera`]: frames, frame sinks, capture schedules, image statistics
//! - [`tasks`]: the long-running workers
//! - [`experiment`]: spawns and joins the workers of a run
//! - [`config`]: Figment-based run configuration

pub mod adapters;
pub mod camera;
pub mod config;
pub mod core;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod pump;
pub mod regulation;
pub mod sensor;
pub mod tasks;
pub mod telemetry;

pub use crate::core::{CancellationToken, TriggerGate, TriggerSource};
pub use config::Settings;
pub use error::{ActuationFault, AppResult, DaqError};
pub use experiment::{Devices, Experiment, ExperimentPlan, PumpMode, RunReport};
