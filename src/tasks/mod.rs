//! Long-running experiment workers.
//!
//! Every worker follows the same shape:
//!
//! ```text
//! loop {
//!     select! {
//!         token cancelled  => break,
//!         next tick        => one unit of work (device I/O bounded by a timeout),
//!     }
//! }
//! return report
//! ```
//!
//! Cancellation is not an error: a cancelled worker returns the report it has
//! accumulated so far. Device failures are logged at `warn` and counted in the
//! report; they never end a worker.
//!
//! | Worker                         | Reads                 | Writes                     |
//! |--------------------------------|-----------------------|----------------------------|
//! | [`sampling::SamplingLoop`]     | sensor                | samples (watch), telemetry |
//! | [`regulation::RegulationLoop`] | samples, pump feedback| regulation state (watch)   |
//! | [`actuation::ActuationLoop`]   | regulation state      | pump, pump feedback (mpsc) |
//! | [`acquisition::AcquisitionLoop`]| [`TriggerGate`]      | camera, frame sink         |
//! | [`triggers`]                   | schedule, key presses | [`TriggerGate`]            |
//!
//! [`TriggerGate`]: crate::core::TriggerGate

pub mod acquisition;
pub mod actuation;
pub mod regulation;
pub mod sampling;
pub mod triggers;

pub use acquisition::{AcquisitionLoop, AcquisitionReport};
pub use actuation::{ActuationFeedback, ActuationLoop, ActuationReport};
pub use regulation::{RegulationLoop, RegulationReport};
pub use sampling::{SamplingConfig, SamplingLoop, SamplingReport};

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::error::{AppResult, DaqError};

/// Run a device operation with an I/O timeout.
pub(crate) async fn with_timeout<T>(
    device: &str,
    timeout: Duration,
    operation: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(DaqError::Timeout {
            device: device.to_string(),
            timeout,
        }),
    }
}

/// Ticker that waits a full period after a slow tick instead of bursting.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
