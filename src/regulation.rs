//! Bang-bang regulation of a measured quantity with the syringe pump.
//!
//! Each tick compares the latest reading `v` of the regulated channel against
//! a tolerance band around the target `T`:
//!
//! ```text
//! epsilon = tolerance + relative_tolerance * |T|
//!
//! v >= T + epsilon   -> Withdraw   (Inject when reversed)
//! v <= T - epsilon   -> Inject     (Withdraw when reversed)
//! otherwise          -> Hold
//! ```
//!
//! The band edges actuate. There is no proportional or integral term; the
//! controller is level-triggered and simply re-evaluates every tick.
//!
//! The controller also holds when:
//!
//! - the reading is a sentinel or not finite;
//! - a pump fault was reported less than `fault_hold_off` ago;
//! - the command would push the syringe past its end guard (nearly empty on
//!   inject, nearly full on withdraw).
//!
//! The controller is the only writer of [`RegulationState`]; other workers see
//! snapshots.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ActuationFault;
use crate::sensor::{MeasuredChannel, Reading};

/// Which pump direction raises the regulated quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegulationDirection {
    /// Injecting raises the measurement
    #[default]
    Normal,
    /// Withdrawing raises the measurement
    Reversed,
}

/// Output of one controller tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Drive the pump in the inject direction
    Inject,
    /// Drive the pump in the withdraw direction
    Withdraw,
    /// Keep the pump stopped
    #[default]
    Hold,
}

/// Controller state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// No tick has run yet
    #[default]
    Idle,
    /// Last command was inject
    Injecting,
    /// Last command was withdraw
    Withdrawing,
    /// Last command was hold
    Holding,
}

impl From<Command> for ControllerState {
    fn from(command: Command) -> Self {
        match command {
            Command::Inject => ControllerState::Injecting,
            Command::Withdraw => ControllerState::Withdrawing,
            Command::Hold => ControllerState::Holding,
        }
    }
}

/// Why the controller chose [`Command::Hold`] outside the band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// Reading inside the tolerance band
    InBand,
    /// Reading was a sentinel or not finite
    NoData,
    /// Waiting out the hold-off after a pump fault
    FaultHoldOff,
    /// The syringe is at its end in the requested direction
    SyringeEnd,
}

/// Controller parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegulationParams {
    /// Set point, in the unit of `channel`
    pub target: f64,
    /// Absolute half-width of the tolerance band
    pub tolerance: f64,
    /// Additional half-width as a fraction of `|target|`
    pub relative_tolerance: f64,
    /// Which pump direction raises the measurement
    pub direction: RegulationDirection,
    /// Regulated quantity
    pub channel: MeasuredChannel,
    /// How long to hold after a pump fault
    pub fault_hold_off: Duration,
    /// Fill fraction from either syringe end below which moves toward that
    /// end are refused
    pub syringe_guard: f64,
}

impl Default for RegulationParams {
    fn default() -> Self {
        Self {
            target: 0.0,
            tolerance: 0.0,
            relative_tolerance: 0.0,
            direction: RegulationDirection::Normal,
            channel: MeasuredChannel::Pressure1,
            fault_hold_off: Duration::from_secs(5),
            syringe_guard: 0.02,
        }
    }
}

/// Snapshot of the controller, published to the actuation worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct RegulationState {
    /// Set point
    pub target: f64,
    /// Effective half-width of the band
    pub tolerance: f64,
    /// Which pump direction raises the measurement
    pub direction: RegulationDirection,
    /// Command of the most recent tick
    pub last_command: Command,
    /// State machine position
    pub mode: ControllerState,
    /// Value the last decision was based on, if it was usable
    pub measured: Option<f64>,
    /// Number of ticks evaluated so far
    pub tick: u64,
    /// Pump faults applied so far
    pub faults: u64,
}

/// Result of [`RegulationController::update`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    /// Command to apply
    pub command: Command,
    /// Set when the command is a hold
    pub hold_reason: Option<HoldReason>,
    /// The command differs from the previous tick's
    pub changed: bool,
}

/// Bang-bang controller.
#[derive(Debug)]
pub struct RegulationController {
    params: RegulationParams,
    state: RegulationState,
    fault_until: Option<Instant>,
    syringe_fill: Option<f64>,
    transitions: u64,
}

impl RegulationController {
    /// New controller in [`ControllerState::Idle`].
    pub fn new(params: RegulationParams) -> Self {
        let state = RegulationState {
            target: params.target,
            tolerance: band(&params),
            direction: params.direction,
            ..RegulationState::default()
        };
        Self {
            params,
            state,
            fault_until: None,
            syringe_fill: None,
            transitions: 0,
        }
    }

    /// Parameters in use.
    pub fn params(&self) -> &RegulationParams {
        &self.params
    }

    /// Regulated channel.
    pub fn channel(&self) -> MeasuredChannel {
        self.params.channel
    }

    /// Move the set point.
    pub fn set_target(&mut self, target: f64) {
        self.params.target = target;
        self.state.target = target;
        self.state.tolerance = band(&self.params);
        info!(target, "Regulation target changed");
    }

    /// Latest syringe fill fraction reported by the actuation worker.
    pub fn set_syringe_fill(&mut self, fraction: f64) {
        self.syringe_fill = Some(fraction);
    }

    /// Band decision for a usable value, ignoring hold-off and syringe guard.
    pub fn decide(&self, value: f64) -> Command {
        let target = self.params.target;
        let epsilon = band(&self.params);
        let raise = match self.params.direction {
            RegulationDirection::Normal => Command::Inject,
            RegulationDirection::Reversed => Command::Withdraw,
        };
        let lower = match self.params.direction {
            RegulationDirection::Normal => Command::Withdraw,
            RegulationDirection::Reversed => Command::Inject,
        };
        if value >= target + epsilon {
            lower
        } else if value <= target - epsilon {
            raise
        } else {
            Command::Hold
        }
    }

    fn syringe_blocks(&self, command: Command) -> bool {
        let Some(fill) = self.syringe_fill else {
            return false;
        };
        let guard = self.params.syringe_guard;
        match command {
            Command::Inject => fill <= guard,
            Command::Withdraw => fill >= 1.0 - guard,
            Command::Hold => false,
        }
    }

    /// Evaluate one tick.
    pub fn update(&mut self, reading: Reading, now: Instant) -> Decision {
        let usable = !reading.sentinel && reading.value.is_finite();
        let in_hold_off = self.fault_until.is_some_and(|until| now < until);

        let (command, hold_reason) = if in_hold_off {
            (Command::Hold, Some(HoldReason::FaultHoldOff))
        } else if !usable {
            (Command::Hold, Some(HoldReason::NoData))
        } else {
            match self.decide(reading.value) {
                Command::Hold => (Command::Hold, Some(HoldReason::InBand)),
                command if self.syringe_blocks(command) => {
                    (Command::Hold, Some(HoldReason::SyringeEnd))
                }
                command => (command, None),
            }
        };
        if !in_hold_off {
            self.fault_until = None;
        }

        let changed = command != self.state.last_command || self.state.mode == ControllerState::Idle;
        if changed {
            self.transitions += 1;
            debug!(
                ?command,
                ?hold_reason,
                value = reading.value,
                target = self.params.target,
                "Regulation command changed"
            );
        }

        self.state.last_command = command;
        self.state.mode = command.into();
        self.state.measured = usable.then_some(reading.value);
        self.state.tick += 1;

        Decision {
            command,
            hold_reason,
            changed,
        }
    }

    /// Record a pump fault: hold for the configured hold-off period.
    pub fn report_fault(&mut self, fault: &ActuationFault, now: Instant) {
        warn!(%fault, hold_off = ?self.params.fault_hold_off, "Pump fault, regulation holding");
        self.fault_until = Some(now + self.params.fault_hold_off);
        if self.state.last_command != Command::Hold {
            self.transitions += 1;
        }
        self.state.last_command = Command::Hold;
        self.state.mode = ControllerState::Holding;
        self.state.faults += 1;
    }

    /// Snapshot for other workers.
    pub fn state(&self) -> RegulationState {
        self.state.clone()
    }

    /// Number of command changes so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }
}

fn band(params: &RegulationParams) -> f64 {
    params.tolerance + params.relative_tolerance * params.target.abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(direction: RegulationDirection) -> RegulationController {
        RegulationController::new(RegulationParams {
            target: 100.0,
            tolerance: 5.0,
            direction,
            ..RegulationParams::default()
        })
    }

    fn reading(value: f64) -> Reading {
        Reading {
            value,
            sentinel: false,
        }
    }

    #[test]
    fn test_band_decisions_normal() {
        let c = controller(RegulationDirection::Normal);
        assert_eq!(c.decide(110.0), Command::Withdraw);
        assert_eq!(c.decide(95.0), Command::Inject);
        assert_eq!(c.decide(100.0), Command::Hold);
        assert_eq!(c.decide(104.9), Command::Hold);
        assert_eq!(c.decide(105.0), Command::Withdraw);
    }

    #[test]
    fn test_band_decisions_reversed() {
        let c = controller(RegulationDirection::Reversed);
        assert_eq!(c.decide(110.0), Command::Inject);
        assert_eq!(c.decide(95.0), Command::Withdraw);
        assert_eq!(c.decide(100.0), Command::Hold);
    }

    #[test]
    fn test_relative_tolerance_widens_band() {
        let c = RegulationController::new(RegulationParams {
            target: 1000.0,
            tolerance: 10.0,
            relative_tolerance: 0.02,
            ..RegulationParams::default()
        });
        assert_eq!(c.state().tolerance, 30.0);
        assert_eq!(c.decide(1025.0), Command::Hold);
        assert_eq!(c.decide(1030.0), Command::Withdraw);
    }

    #[test]
    fn test_sentinel_holds() {
        let mut c = controller(RegulationDirection::Normal);
        let now = Instant::now();
        let decision = c.update(
            Reading {
                value: 0.0,
                sentinel: true,
            },
            now,
        );
        assert_eq!(decision.command, Command::Hold);
        assert_eq!(decision.hold_reason, Some(HoldReason::NoData));
        assert_eq!(c.update(reading(f64::NAN), now).command, Command::Hold);
        assert_eq!(c.state().measured, None);
    }

    #[test]
    fn test_state_transitions() {
        let mut c = controller(RegulationDirection::Normal);
        let now = Instant::now();
        assert_eq!(c.state().mode, ControllerState::Idle);

        assert!(c.update(reading(90.0), now).changed);
        assert_eq!(c.state().mode, ControllerState::Injecting);
        assert!(!c.update(reading(91.0), now).changed);
        assert!(c.update(reading(100.0), now).changed);
        assert_eq!(c.state().mode, ControllerState::Holding);
        assert!(c.update(reading(120.0), now).changed);
        assert_eq!(c.state().mode, ControllerState::Withdrawing);
        assert_eq!(c.transitions(), 3);
        assert_eq!(c.state().tick, 4);
    }

    #[test]
    fn test_fault_hold_off() {
        let mut c = RegulationController::new(RegulationParams {
            target: 100.0,
            tolerance: 5.0,
            fault_hold_off: Duration::from_secs(2),
            ..RegulationParams::default()
        });
        let t0 = Instant::now();
        c.update(reading(50.0), t0);
        c.report_fault(&ActuationFault::Stalled, t0);
        assert_eq!(c.state().mode, ControllerState::Holding);
        assert_eq!(c.state().faults, 1);

        let decision = c.update(reading(50.0), t0 + Duration::from_secs(1));
        assert_eq!(decision.command, Command::Hold);
        assert_eq!(decision.hold_reason, Some(HoldReason::FaultHoldOff));

        let decision = c.update(reading(50.0), t0 + Duration::from_secs(3));
        assert_eq!(decision.command, Command::Inject);
    }

    #[test]
    fn test_syringe_end_guard() {
        let mut c = controller(RegulationDirection::Normal);
        let now = Instant::now();

        // Nearly empty: injecting is refused, withdrawing is still allowed
        c.set_syringe_fill(0.01);
        let decision = c.update(reading(50.0), now);
        assert_eq!(decision.command, Command::Hold);
        assert_eq!(decision.hold_reason, Some(HoldReason::SyringeEnd));
        assert_eq!(c.update(reading(150.0), now).command, Command::Withdraw);

        // Nearly full: the opposite
        c.set_syringe_fill(0.99);
        assert_eq!(c.update(reading(150.0), now).command, Command::Hold);
        assert_eq!(c.update(reading(50.0), now).command, Command::Inject);
    }

    #[test]
    fn test_set_target_moves_band() {
        let mut c = controller(RegulationDirection::Normal);
        c.set_target(200.0);
        assert_eq!(c.decide(110.0), Command::Inject);
        assert_eq!(c.state().target, 200.0);
    }
}
