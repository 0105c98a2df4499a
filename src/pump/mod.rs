//! Syringe pump capability and shared pump types.
//!
//! A pump is driven through three operations (`start`, `stop`, `poll`). Drivers
//! report cumulative pumped volumes so that callers can follow the syringe
//! contents across steps even though the instrument resets its own counters.
//!
//! Two consumers sit on top of [`Pump`]:
//!
//! - the actuation worker in regulation mode, which follows inject / withdraw /
//!   hold commands;
//! - the actuation worker in sequence mode, which executes a
//!   [`sequence::Sequence`] built by [`sequence::SequenceBuilder`].

pub mod phd_ultra;
pub mod sequence;

pub use phd_ultra::PhdUltraPump;
pub use sequence::{MoveStep, PlannedMove, Sequence, SequenceBuilder};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ActuationFault, AppResult, DaqError};

/// Direction of a pump move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpDirection {
    /// Push fluid out of the syringe
    Inject,
    /// Draw fluid into the syringe
    Withdraw,
}

impl PumpDirection {
    /// The other direction.
    pub fn reversed(self) -> Self {
        match self {
            PumpDirection::Inject => PumpDirection::Withdraw,
            PumpDirection::Withdraw => PumpDirection::Inject,
        }
    }
}

/// Motor state reported by the pump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PumpStatus {
    /// Not moving
    #[default]
    Idle,
    /// Moving in the inject direction
    Infusing,
    /// Moving in the withdraw direction
    Withdrawing,
    /// Motor stalled; the move did not complete
    Stalled,
    /// Target volume reached, motor stopped
    TargetReached,
}

impl PumpStatus {
    /// Whether the motor is currently running.
    pub fn is_moving(self) -> bool {
        matches!(self, PumpStatus::Infusing | PumpStatus::Withdrawing)
    }
}

/// State returned by [`Pump::poll`].
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PumpReading {
    /// Motor state
    pub status: PumpStatus,
    /// Cumulative volume injected since the pump was opened (µl)
    pub infused_ul: f64,
    /// Cumulative volume withdrawn since the pump was opened (µl)
    pub withdrawn_ul: f64,
}

impl PumpReading {
    /// Net volume pushed out of the syringe (µl).
    pub fn net_injected_ul(&self) -> f64 {
        self.infused_ul - self.withdrawn_ul
    }
}

/// Syringe geometry used for capacity checks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Syringe {
    /// Total syringe volume (µl)
    pub capacity_ul: f64,
    /// Volume in the syringe when the run starts (µl)
    pub initial_ul: f64,
}

impl Syringe {
    /// Volume currently in the syringe given the net injected volume.
    pub fn contents_ul(&self, net_injected_ul: f64) -> f64 {
        self.initial_ul - net_injected_ul
    }

    /// Fill level in [0, 1].
    pub fn fill_fraction(&self, net_injected_ul: f64) -> f64 {
        if self.capacity_ul <= 0.0 {
            return 0.0;
        }
        (self.contents_ul(net_injected_ul) / self.capacity_ul).clamp(0.0, 1.0)
    }

    /// Volume that can still be moved in `direction` (µl).
    pub fn available_ul(&self, direction: PumpDirection, net_injected_ul: f64) -> f64 {
        let contents = self.contents_ul(net_injected_ul);
        match direction {
            PumpDirection::Inject => contents.max(0.0),
            PumpDirection::Withdraw => (self.capacity_ul - contents).max(0.0),
        }
    }

    /// Reject a move that does not fit in the syringe.
    pub fn check_move(
        &self,
        direction: PumpDirection,
        volume_ul: f64,
        net_injected_ul: f64,
    ) -> Result<(), ActuationFault> {
        let available_ul = self.available_ul(direction, net_injected_ul);
        if volume_ul > available_ul {
            return Err(ActuationFault::ExceedsCapacity {
                requested_ul: volume_ul,
                available_ul,
            });
        }
        Ok(())
    }
}

/// Capability of a syringe pump.
#[async_trait]
pub trait Pump: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Start moving in `direction` at `rate_ul_min`.
    ///
    /// With a `volume_ul` the pump stops by itself once that volume has been
    /// moved ([`PumpStatus::TargetReached`]); without one it runs until
    /// [`stop`](Self::stop). A move that does not fit in the syringe fails
    /// with [`ActuationFault::ExceedsCapacity`] and the pump is not started.
    async fn start(
        &mut self,
        direction: PumpDirection,
        volume_ul: Option<f64>,
        rate_ul_min: f64,
    ) -> AppResult<()>;

    /// Stop the motor.
    async fn stop(&mut self) -> AppResult<()>;

    /// Read the motor state and cumulative volumes.
    async fn poll(&mut self) -> AppResult<PumpReading>;

    /// Time the motor has been running in `direction` during the current
    /// step, when the instrument reports it.
    async fn elapsed(&mut self, _direction: PumpDirection) -> AppResult<Option<f64>> {
        Ok(None)
    }
}

/// Turn any pump error into the fault reported back to regulation.
pub fn into_fault(err: DaqError) -> ActuationFault {
    match err {
        DaqError::Actuation(fault) => fault,
        other => ActuationFault::Rejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syringe_capacity() {
        let syringe = Syringe {
            capacity_ul: 1000.0,
            initial_ul: 500.0,
        };
        assert_eq!(syringe.available_ul(PumpDirection::Inject, 0.0), 500.0);
        assert_eq!(syringe.available_ul(PumpDirection::Withdraw, 0.0), 500.0);
        assert_eq!(syringe.available_ul(PumpDirection::Inject, 200.0), 300.0);
        assert!(syringe.check_move(PumpDirection::Inject, 300.0, 200.0).is_ok());
        assert_eq!(
            syringe.check_move(PumpDirection::Inject, 301.0, 200.0),
            Err(ActuationFault::ExceedsCapacity {
                requested_ul: 301.0,
                available_ul: 300.0
            })
        );
        assert!((syringe.fill_fraction(200.0) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_into_fault() {
        assert_eq!(into_fault(DaqError::Actuation(ActuationFault::Stalled)), ActuationFault::Stalled);
        assert!(matches!(
            into_fault(DaqError::SerialPortNotConnected),
            ActuationFault::Rejected(_)
        ));
    }
}
