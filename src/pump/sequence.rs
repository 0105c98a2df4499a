//! Pump move sequences.
//!
//! A [`Sequence`] is an immutable, ordered plan of pump moves, built once by
//! [`SequenceBuilder`] from parallel lists of volumes, rates and directions.
//! Invalid input is rejected with [`DaqError::Validation`]; nothing is clamped.
//! That includes moves whose duration, or whose timeout, does not fit a
//! [`Duration`], and plans whose total run time does not.
//!
//! The plan is repetition-major: every repetition runs all steps in order
//! before the next repetition starts.
//!
//! ```rust
//! use lab_daq::pump::{PumpDirection, SequenceBuilder};
//!
//! let sequence = SequenceBuilder::new()
//!     .volumes(vec![50.0])
//!     .rates(vec![200.0])
//!     .directions(vec![PumpDirection::Inject, PumpDirection::Withdraw])
//!     .repeat(3)
//!     .build()
//!     .unwrap();
//! assert_eq!(sequence.plan().len(), 6);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::PumpDirection;
use crate::error::{AppResult, DaqError};

/// Margin applied to the expected move duration before a move is declared
/// timed out.
pub const STEP_TIMEOUT_FACTOR: f64 = 1.25;

/// Most moves a plan may expand to.
pub const MAX_PLANNED_MOVES: u64 = 1_000_000;

/// One move of the sequence, before repetition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoveStep {
    /// Volume to move (µl)
    pub volume_ul: f64,
    /// Flow rate (µl/min)
    pub rate_ul_min: f64,
    /// Inject or withdraw
    pub direction: PumpDirection,
    /// How many times the step runs
    pub repeat_count: u32,
}

impl MoveStep {
    /// Time the move takes at its nominal rate.
    pub fn expected_duration(&self) -> Duration {
        expected_duration(self.volume_ul, self.rate_ul_min)
    }
}

fn expected_duration(volume_ul: f64, rate_ul_min: f64) -> Duration {
    Duration::try_from_secs_f64(60.0 * volume_ul / rate_ul_min).unwrap_or(Duration::MAX)
}

fn step_timeout(expected: Duration) -> Duration {
    Duration::try_from_secs_f64(expected.as_secs_f64() * STEP_TIMEOUT_FACTOR).unwrap_or(Duration::MAX)
}

/// A move as it will be executed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlannedMove {
    /// Position in the plan
    pub index: usize,
    /// Index of the [`MoveStep`] this move comes from
    pub step: usize,
    /// Repetition this move belongs to
    pub repetition: u32,
    /// Volume to move (µl); halved for the first and last move of a centered
    /// sequence
    pub volume_ul: f64,
    /// Flow rate (µl/min)
    pub rate_ul_min: f64,
    /// Inject or withdraw
    pub direction: PumpDirection,
    /// Nominal duration of the move
    pub expected: Duration,
    /// Give up on the move after this long
    pub timeout: Duration,
    /// Pause after the move
    pub dwell: Duration,
}

/// Ordered, immutable plan of pump moves.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sequence {
    steps: Vec<MoveStep>,
    dwell: Duration,
    centered: bool,
}

impl Sequence {
    /// Steps in order, before repetition.
    pub fn steps(&self) -> &[MoveStep] {
        &self.steps
    }

    /// Pause after each move.
    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    /// Whether the first and last moves are halved.
    pub fn is_centered(&self) -> bool {
        self.centered
    }

    /// Expand repetitions into the list of moves to execute.
    pub fn plan(&self) -> Vec<PlannedMove> {
        let repetitions = self.steps.iter().map(|s| s.repeat_count).max().unwrap_or(0);
        let mut moves = Vec::new();
        for repetition in 0..repetitions {
            for (step_index, step) in self.steps.iter().enumerate() {
                if repetition >= step.repeat_count {
                    continue;
                }
                let expected = step.expected_duration();
                moves.push(PlannedMove {
                    index: moves.len(),
                    step: step_index,
                    repetition,
                    volume_ul: step.volume_ul,
                    rate_ul_min: step.rate_ul_min,
                    direction: step.direction,
                    expected,
                    timeout: step_timeout(expected),
                    dwell: self.dwell,
                });
            }
        }

        if self.centered && !moves.is_empty() {
            let last = moves.len() - 1;
            for index in [0, last] {
                let mv = &mut moves[index];
                if mv.volume_ul == self.steps[mv.step].volume_ul {
                    mv.volume_ul /= 2.0;
                    mv.expected = expected_duration(mv.volume_ul, mv.rate_ul_min);
                    mv.timeout = step_timeout(mv.expected);
                }
            }
        }
        moves
    }

    /// Nominal run time of the whole plan, dwells included.
    pub fn total_duration(&self) -> Duration {
        self.plan()
            .iter()
            .fold(Duration::ZERO, |total, m| total.saturating_add(m.expected).saturating_add(m.dwell))
    }
}

/// Builder for [`Sequence`].
///
/// Lists of length 1 are broadcast to the length of the longest list; any
/// other length mismatch is rejected.
#[derive(Clone, Debug, Default)]
pub struct SequenceBuilder {
    volumes: Vec<f64>,
    rates: Vec<f64>,
    directions: Vec<PumpDirection>,
    repeat: u32,
    dwell: Duration,
    centered: bool,
}

impl SequenceBuilder {
    /// Empty builder with one repetition and no dwell.
    pub fn new() -> Self {
        Self {
            repeat: 1,
            ..Self::default()
        }
    }

    /// Volumes per step (µl).
    pub fn volumes(mut self, volumes: Vec<f64>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Rates per step (µl/min).
    pub fn rates(mut self, rates: Vec<f64>) -> Self {
        self.rates = rates;
        self
    }

    /// Directions per step.
    pub fn directions(mut self, directions: Vec<PumpDirection>) -> Self {
        self.directions = directions;
        self
    }

    /// Number of repetitions of the whole list of steps.
    pub fn repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    /// Pause after every move.
    pub fn dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    /// Halve the first and last move so that the syringe oscillates around
    /// its starting volume.
    pub fn centered(mut self, centered: bool) -> Self {
        self.centered = centered;
        self
    }

    /// Validate and build the sequence.
    pub fn build(self) -> AppResult<Sequence> {
        if self.volumes.is_empty() {
            return Err(DaqError::Validation("no volumes given".into()));
        }
        if self.rates.is_empty() {
            return Err(DaqError::Validation("no rates given".into()));
        }
        if self.directions.is_empty() {
            return Err(DaqError::Validation("no directions given".into()));
        }
        if self.repeat == 0 {
            return Err(DaqError::Validation("repeat count must be at least 1".into()));
        }
        if let Some(v) = self.volumes.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return Err(DaqError::Validation(format!("volume must be positive, got {}", v)));
        }
        if let Some(r) = self.rates.iter().find(|r| !(r.is_finite() && **r > 0.0)) {
            return Err(DaqError::Validation(format!("rate must be positive, got {}", r)));
        }

        let len = self
            .volumes
            .len()
            .max(self.rates.len())
            .max(self.directions.len());
        for (name, n) in [
            ("volumes", self.volumes.len()),
            ("rates", self.rates.len()),
            ("directions", self.directions.len()),
        ] {
            if n != 1 && n != len {
                return Err(DaqError::Validation(format!(
                    "{} has {} entries, expected 1 or {}",
                    name, n, len
                )));
            }
        }

        let planned = len as u64 * u64::from(self.repeat);
        if planned > MAX_PLANNED_MOVES {
            return Err(DaqError::Validation(format!(
                "{} moves planned, at most {} allowed",
                planned, MAX_PLANNED_MOVES
            )));
        }

        let pick = |n: usize, i: usize| if n == 1 { 0 } else { i };
        let steps: Vec<MoveStep> = (0..len)
            .map(|i| MoveStep {
                volume_ul: self.volumes[pick(self.volumes.len(), i)],
                rate_ul_min: self.rates[pick(self.rates.len(), i)],
                direction: self.directions[pick(self.directions.len(), i)],
                repeat_count: self.repeat,
            })
            .collect();

        let mut total = Duration::ZERO;
        for step in &steps {
            let too_long = || {
                DaqError::Validation(format!(
                    "{} µl at {} µl/min takes too long",
                    step.volume_ul, step.rate_ul_min
                ))
            };
            let seconds = 60.0 * step.volume_ul / step.rate_ul_min;
            let expected = Duration::try_from_secs_f64(seconds).map_err(|_| too_long())?;
            Duration::try_from_secs_f64(seconds * STEP_TIMEOUT_FACTOR).map_err(|_| too_long())?;
            total = expected
                .checked_add(self.dwell)
                .and_then(|per_move| per_move.checked_mul(step.repeat_count))
                .and_then(|per_step| total.checked_add(per_step))
                .ok_or_else(|| DaqError::Validation("sequence total duration overflows".into()))?;
        }

        Ok(Sequence {
            steps,
            dwell: self.dwell,
            centered: self.centered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PumpDirection::{Inject, Withdraw};

    fn oscillation() -> SequenceBuilder {
        SequenceBuilder::new()
            .volumes(vec![100.0])
            .rates(vec![600.0])
            .directions(vec![Inject, Withdraw])
    }

    #[test]
    fn test_rejects_zero_volume() {
        let err = oscillation().volumes(vec![0.0]).build().unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        for rate in [0.0, -5.0, f64::NAN] {
            let err = oscillation().rates(vec![rate]).build().unwrap_err();
            assert!(matches!(err, DaqError::Validation(_)), "rate {}", rate);
        }
    }

    #[test]
    fn test_rejects_empty_lists_and_zero_repeat() {
        assert!(SequenceBuilder::new().build().is_err());
        assert!(oscillation().directions(vec![]).build().is_err());
        assert!(oscillation().repeat(0).build().is_err());
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let err = oscillation()
            .volumes(vec![10.0, 20.0, 30.0])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("directions"));
    }

    #[test]
    fn test_broadcast_and_repetition_order() {
        let sequence = oscillation().repeat(2).build().unwrap();
        assert_eq!(sequence.steps().len(), 2);
        let plan = sequence.plan();
        let directions: Vec<_> = plan.iter().map(|m| m.direction).collect();
        assert_eq!(directions, vec![Inject, Withdraw, Inject, Withdraw]);
        assert_eq!(plan[2].repetition, 1);
        assert_eq!(plan[3].index, 3);
    }

    #[test]
    fn test_expected_duration_and_timeout() {
        let sequence = oscillation().build().unwrap();
        let plan = sequence.plan();
        // 100 µl at 600 µl/min takes 10 s
        assert_eq!(plan[0].expected, Duration::from_secs(10));
        assert_eq!(plan[0].timeout, Duration::from_millis(12_500));
    }

    #[test]
    fn test_centered_halves_first_and_last_moves() {
        let sequence = oscillation()
            .repeat(3)
            .centered(true)
            .dwell(Duration::from_secs(1))
            .build()
            .unwrap();
        let volumes: Vec<_> = sequence.plan().iter().map(|m| m.volume_ul).collect();
        assert_eq!(volumes, vec![50.0, 100.0, 100.0, 100.0, 100.0, 50.0]);
        // 4 full moves of 10 s, 2 half moves of 5 s, 6 dwells of 1 s
        assert_eq!(sequence.total_duration(), Duration::from_secs(56));
    }

    #[test]
    fn test_rejects_moves_too_long_to_time() {
        let err = SequenceBuilder::new()
            .volumes(vec![1e20])
            .rates(vec![1e-20])
            .directions(vec![Inject])
            .build()
            .unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));
        assert!(err.to_string().contains("too long"), "{}", err);

        // Fits a Duration, but the 1.25x timeout does not
        let limit = Duration::MAX.as_secs_f64() / 60.0;
        assert!(SequenceBuilder::new()
            .volumes(vec![limit * 0.9])
            .rates(vec![1.0])
            .directions(vec![Inject])
            .build()
            .is_err());
    }

    #[test]
    fn test_rejects_total_duration_overflow() {
        let err = SequenceBuilder::new()
            // 6e15 s per move, each fine on its own
            .volumes(vec![1e8])
            .rates(vec![1e-6])
            .directions(vec![Inject])
            .repeat(200_000)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("total duration"), "{}", err);
    }

    #[test]
    fn test_rejects_oversized_plan() {
        let err = oscillation().repeat(u32::MAX).build().unwrap_err();
        assert!(err.to_string().contains("moves planned"), "{}", err);
    }

    #[test]
    fn test_single_centered_move_is_halved_once() {
        let sequence = SequenceBuilder::new()
            .volumes(vec![40.0])
            .rates(vec![60.0])
            .directions(vec![Inject])
            .centered(true)
            .build()
            .unwrap();
        assert_eq!(sequence.plan()[0].volume_ul, 20.0);
    }
}
