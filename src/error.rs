//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire application.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration issues to
//! instrument-specific problems.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration sources.
//! - **`Configuration`**: Semantic errors in the configuration, such as a negative
//!   sampling period. These are caught during the validation step.
//! - **`Io`**: Wraps standard `std::io::Error` (telemetry files, serial ports).
//! - **`Instrument`**: A general category for errors originating from a device driver.
//! - **`Timeout`**: A device did not answer within its I/O timeout.
//! - **`Validation`**: Malformed input to a builder, e.g. a pump sequence with a
//!   zero volume. The object is not built.
//! - **`Actuation`**: The pump refused or failed a command. Regulation reacts to
//!   these by holding rather than retrying.
//!
//! Missing sensor data is deliberately *not* an error: it is substituted by the
//! sentinel decode and flagged on the sample (see [`crate::sensor::decoder`]).

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("{device} did not respond within {timeout:?}")]
    Timeout { device: String, timeout: Duration },

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Invalid sequence: {0}")]
    Validation(String),

    #[error("Actuation fault: {0}")]
    Actuation(#[from] ActuationFault),

    #[error("Task {0} terminated abnormally")]
    TaskFailed(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

/// A pump command that could not be carried out.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuationFault {
    /// The requested volume does not fit in what is left of the syringe.
    #[error("requested {requested_ul:.2} ul but only {available_ul:.2} ul available in syringe")]
    ExceedsCapacity {
        /// Volume the command asked for (µl)
        requested_ul: f64,
        /// Volume still available in the requested direction (µl)
        available_ul: f64,
    },

    /// The motor stalled while moving.
    #[error("pump motor stalled")]
    Stalled,

    /// The pump did not reach its target volume within the step timeout.
    #[error("step did not complete within {0:?}")]
    StepTimeout(Duration),

    /// The pump answered with something the driver could not interpret, or the
    /// transport failed.
    #[error("pump rejected command: {0}")]
    Rejected(String),
}
