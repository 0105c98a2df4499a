//! Capture schedules.
//!
//! A schedule is a list of times (seconds since the start of the run) at which
//! a frame must be saved. The schedule worker turns each elapsed time into one
//! capture request.
//!
//! Logarithmic spacing suits slow relaxation experiments: frames are dense at
//! the start and thin out as the run goes on, with `per_decade` frames before
//! the interval grows tenfold.

use serde::{Deserialize, Serialize};

use crate::config::MAX_RUN_SECONDS;
use crate::error::{AppResult, DaqError};

/// Most captures a schedule may produce.
pub const MAX_SCHEDULED_CAPTURES: usize = 1_000_000;

/// When to save frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureSchedule {
    /// No scheduled captures; only events and regulation trigger saves
    #[default]
    None,
    /// Every `dt` seconds from 0 up to `max_time` inclusive
    Interval {
        /// Interval between frames (s)
        dt: f64,
        /// Last capture time (s)
        max_time: f64,
    },
    /// Explicit capture times (s)
    Times {
        /// Capture times; sorted before use
        times: Vec<f64>,
    },
    /// Logarithmically growing intervals
    Logarithmic {
        /// First interval (s)
        dt0: f64,
        /// Approximate total duration (s)
        tmax: f64,
        /// Frames per tenfold growth of the interval
        per_decade: u32,
    },
}

impl CaptureSchedule {
    /// Check the parameters.
    pub fn validate(&self) -> AppResult<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(DaqError::Configuration(format!(
                    "capture {} must be positive, got {}",
                    name, v
                )))
            }
        };
        let within_run = |name: &str, v: f64| {
            if v <= MAX_RUN_SECONDS {
                Ok(())
            } else {
                Err(DaqError::Configuration(format!(
                    "capture {} must be at most {} s, got {}",
                    name, MAX_RUN_SECONDS, v
                )))
            }
        };
        match self {
            CaptureSchedule::None => {}
            CaptureSchedule::Interval { dt, max_time } => {
                positive("dt", *dt)?;
                positive("max_time", *max_time)?;
                within_run("max_time", *max_time)?;
            }
            CaptureSchedule::Times { times } => {
                if let Some(t) = times.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
                    return Err(DaqError::Configuration(format!(
                        "capture time must be a non-negative number, got {}",
                        t
                    )));
                }
                if let Some(t) = times.iter().copied().reduce(f64::max) {
                    within_run("time", t)?;
                }
            }
            CaptureSchedule::Logarithmic {
                dt0,
                tmax,
                per_decade,
            } => {
                positive("dt0", *dt0)?;
                positive("tmax", *tmax)?;
                within_run("tmax", *tmax)?;
                if *per_decade == 0 {
                    return Err(DaqError::Configuration(
                        "capture per_decade must be at least 1".into(),
                    ));
                }
            }
        }

        let count = self.capture_count();
        if count > MAX_SCHEDULED_CAPTURES as f64 {
            return Err(DaqError::Configuration(format!(
                "capture schedule yields {} frames, at most {} allowed",
                count, MAX_SCHEDULED_CAPTURES
            )));
        }
        Ok(())
    }

    /// Number of captures [`times`](Self::times) would return, computed
    /// without building the list.
    pub fn capture_count(&self) -> f64 {
        match self {
            CaptureSchedule::None => 0.0,
            CaptureSchedule::Interval { dt, max_time } => (max_time / dt + 1e-9).floor() + 1.0,
            CaptureSchedule::Times { times } => times.len() as f64,
            CaptureSchedule::Logarithmic {
                dt0,
                tmax,
                per_decade,
            } => log_interval_count(*dt0, *tmax, *per_decade),
        }
    }

    /// Capture times in increasing order.
    pub fn times(&self) -> Vec<f64> {
        match self {
            CaptureSchedule::None => Vec::new(),
            CaptureSchedule::Interval { dt, max_time } => {
                let count = (max_time / dt + 1e-9).floor() as usize;
                (0..=count).map(|k| k as f64 * dt).collect()
            }
            CaptureSchedule::Times { times } => {
                let mut times = times.clone();
                times.sort_by(f64::total_cmp);
                times
            }
            CaptureSchedule::Logarithmic {
                dt0,
                tmax,
                per_decade,
            } => make_log_intervals(*dt0, *tmax, *per_decade)
                .into_iter()
                .scan(0.0, |t, dt| {
                    *t += dt;
                    Some(*t)
                })
                .collect(),
        }
    }
}

/// Log-spaced intervals starting at `dt0` whose sum is close to `tmax`.
///
/// ```text
/// alpha = ln(10) / per_decade
/// N     = floor(ln(1 + tmax/dt0 * (e^alpha - 1)) / alpha)
/// dt_i  = log-spaced from dt0 to dt0 * e^(alpha N), N values
/// ```
pub fn make_log_intervals(dt0: f64, tmax: f64, per_decade: u32) -> Vec<f64> {
    if !(dt0 > 0.0 && tmax > 0.0 && per_decade > 0) {
        return Vec::new();
    }
    let alpha = std::f64::consts::LN_10 / f64::from(per_decade);
    let n = log_interval_count(dt0, tmax, per_decade) as usize;
    let dt_max = dt0 * (alpha * n as f64).exp();
    match n {
        0 => Vec::new(),
        1 => vec![dt0],
        _ => {
            let (lo, hi) = (dt0.log10(), dt_max.log10());
            (0..n)
                .map(|i| 10f64.powf(lo + (hi - lo) * i as f64 / (n - 1) as f64))
                .collect()
        }
    }
}

fn log_interval_count(dt0: f64, tmax: f64, per_decade: u32) -> f64 {
    let alpha = std::f64::consts::LN_10 / f64::from(per_decade);
    ((1.0 + tmax / dt0 * (alpha.exp() - 1.0)).ln() / alpha).floor()
}
