//! Harvard Apparatus PhD Ultra syringe pump driver.
//!
//! Protocol reference (terminal mode, 19200 baud, 7 data bits, odd parity,
//! 2 stop bits, commands terminated by `\r\n`):
//!
//! | Command              | Meaning                                   |
//! |----------------------|-------------------------------------------|
//! | `irate 200 u/m`      | infuse rate                               |
//! | `wrate 200 u/m`      | withdraw rate                             |
//! | `tvolume 5 ul`       | target volume for the next run            |
//! | `load qs i` / `qs w` | quick-start infuse / withdraw method      |
//! | `run` / `stop`       | start / stop the motor                    |
//! | `ivolume`, `wvolume` | volume infused / withdrawn in this step   |
//! | `itime`, `wtime`     | time spent infusing / withdrawing         |
//! | `cvolume`, `ctime`   | clear volume / time counters              |
//! | `mode`               | name of the loaded method                 |
//!
//! The pump occasionally mis-hears a setting. Every setting is therefore read
//! back (`tvolume`, `irate`, `mode`, ...) and compared with what was sent.
//!
//! Every reply ends with a status prompt on its own line: `:` idle, `>`
//! infusing, `<` withdrawing, `*` stalled, `T*` target reached. The pump does
//! not terminate replies otherwise, so the link must be configured with
//! [`ResponseEnd::Quiet`](crate::adapters::ResponseEnd::Quiet).

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Pump, PumpDirection, PumpReading, PumpStatus, Syringe};
use crate::adapters::SerialLink;
use crate::error::{ActuationFault, AppResult};

/// Default baud rate of the PhD Ultra.
pub const DEFAULT_BAUD_RATE: u32 = 19_200;

/// Read-backs tried before a setting counts as rejected.
pub const READ_BACK_ATTEMPTS: u32 = 3;

/// Pause between two read-backs of the same setting.
pub const READ_BACK_DELAY: Duration = Duration::from_millis(100);

/// Settings written by a start (target volume, rate, method).
const START_SETTINGS: u32 = 3;

/// Queries a start makes when every read-back fails until the last attempt.
pub const START_QUERIES: u32 = 5 + START_SETTINGS * (1 + READ_BACK_ATTEMPTS);

/// Time a whole start may take when each query is bounded by `query_timeout`.
pub fn start_budget(query_timeout: Duration) -> Duration {
    query_timeout * START_QUERIES + READ_BACK_DELAY * (START_SETTINGS * (READ_BACK_ATTEMPTS - 1))
}

/// Parse a status prompt line.
pub fn parse_status(line: &str) -> Option<PumpStatus> {
    match line.trim() {
        ":" => Some(PumpStatus::Idle),
        ">" => Some(PumpStatus::Infusing),
        "<" => Some(PumpStatus::Withdrawing),
        "*" => Some(PumpStatus::Stalled),
        "T*" => Some(PumpStatus::TargetReached),
        _ => None,
    }
}

/// Split a raw reply into its message and trailing status prompt.
///
/// The pump sometimes echoes extra prompts before or after the message
/// (`19.988 seconds\r\n>\r\nT*`, `T*\n10.0011 ul\r\nT*`); the message is the
/// last line that is not a prompt and the status is the final line.
pub fn split_reply(raw: &str) -> (String, Option<PumpStatus>) {
    let lines: Vec<&str> = raw
        .split('\n')
        .map(|l| l.trim_matches('\r').trim())
        .filter(|l| !l.is_empty())
        .collect();
    let status = lines.last().and_then(|l| parse_status(l));
    let message = lines
        .iter()
        .rev()
        .find(|l| parse_status(l).is_none())
        .map(|l| l.to_string())
        .unwrap_or_default();
    (message, status)
}

/// Parse a volume reply (`2.28205 ul`, `T*1.5 ml`, `300 nl`) into µl.
pub fn parse_volume(message: &str) -> Option<f64> {
    let message = message.trim().trim_start_matches("T*");
    let mut parts = message.split_whitespace();
    let value: f64 = parts.next()?.parse().ok()?;
    let factor = match parts.next()? {
        "ul" => 1.0,
        "ml" => 1000.0,
        "nl" => 0.001,
        _ => return None,
    };
    Some(value * factor)
}

/// Parse a rate reply (`200 ul/min`, `1.5 ml/hr`, `3 nl/sec`) into µl/min.
pub fn parse_rate(message: &str) -> Option<f64> {
    let mut parts = message.trim().split_whitespace();
    let value: f64 = parts.next()?.parse().ok()?;
    let (volume, time) = parts.next()?.split_once('/')?;
    let volume = match volume {
        "ul" => 1.0,
        "ml" => 1000.0,
        "nl" => 0.001,
        _ => return None,
    };
    let per_minute = match time {
        "min" => 1.0,
        "sec" => 60.0,
        "hr" => 1.0 / 60.0,
        _ => return None,
    };
    Some(value * volume * per_minute)
}

/// What a setting should read back as.
#[derive(Clone, Copy, Debug, PartialEq)]
enum ReadBack {
    VolumeUl(f64),
    RateUlMin(f64),
    Text(&'static str),
}

impl ReadBack {
    fn matches(&self, message: &str) -> bool {
        match *self {
            ReadBack::VolumeUl(expected) => parse_volume(message).is_some_and(|v| close(v, expected)),
            ReadBack::RateUlMin(expected) => parse_rate(message).is_some_and(|v| close(v, expected)),
            ReadBack::Text(expected) => message.trim() == expected,
        }
    }
}

/// The pump rounds settings to its display precision.
fn close(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() <= 1e-3 * expected.abs().max(1e-3)
}

/// Parse a time reply (`19.988 seconds` or `hh:mm:ss`) into seconds.
pub fn parse_time(message: &str) -> Option<f64> {
    let message = message.trim();
    if message.contains("seconds") {
        return message.split_whitespace().next()?.parse().ok();
    }
    let fields: Vec<&str> = message.split(':').collect();
    if let [hh, mm, ss] = fields.as_slice() {
        let hh: u64 = hh.parse().ok()?;
        let mm: u64 = mm.parse().ok()?;
        let ss: u64 = ss.parse().ok()?;
        return Some((hh * 3600 + mm * 60 + ss) as f64);
    }
    None
}

/// Accumulates a per-step counter into a run total.
///
/// The pump reports the volume moved during the current step only, and drops
/// back to zero when the step ends. The tracker commits the last non-zero
/// reading when that happens.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VolumeTracker {
    previous: f64,
    committed: f64,
    total: f64,
}

impl VolumeTracker {
    /// Feed the latest counter reading; returns the running total.
    pub fn update(&mut self, current: f64) -> f64 {
        if current == 0.0 && self.previous > 0.0 {
            self.committed += self.previous;
            self.total = self.committed;
        } else if current > 0.0 {
            self.total = self.committed + current;
        }
        self.previous = current;
        self.total
    }

    /// Running total.
    pub fn total(&self) -> f64 {
        self.total
    }
}

/// PhD Ultra pump over any [`SerialLink`].
pub struct PhdUltraPump<L: SerialLink> {
    name: String,
    link: L,
    syringe: Syringe,
    status: PumpStatus,
    infuse_rate: Option<f64>,
    withdraw_rate: Option<f64>,
    infused: VolumeTracker,
    withdrawn: VolumeTracker,
}

impl<L: SerialLink> PhdUltraPump<L> {
    /// Wrap a connected link.
    pub fn new(link: L, syringe: Syringe) -> Self {
        Self {
            name: format!("phd_ultra@{}", link.name()),
            link,
            syringe,
            status: PumpStatus::Idle,
            infuse_rate: None,
            withdraw_rate: None,
            infused: VolumeTracker::default(),
            withdrawn: VolumeTracker::default(),
        }
    }

    /// Last status prompt seen.
    pub fn status(&self) -> PumpStatus {
        self.status
    }

    /// Syringe geometry in use.
    pub fn syringe(&self) -> &Syringe {
        &self.syringe
    }

    fn net_injected_ul(&self) -> f64 {
        self.infused.total() - self.withdrawn.total()
    }

    /// Send a command and return the message part of the reply.
    ///
    /// The status prompt updates [`status`](Self::status); an unrecognised
    /// prompt is ignored.
    pub async fn command(&mut self, command: &str) -> AppResult<String> {
        let raw = self.link.query(command).await?;
        let (message, status) = split_reply(&raw);
        match status {
            Some(status) => self.status = status,
            None => warn!(pump = %self.name, command, reply = %raw, "Unrecognised pump prompt"),
        }
        Ok(message)
    }

    /// Write a setting, then read it back with `query` until it matches.
    ///
    /// An error message in reply to the write is a rejection straight away.
    async fn command_verified(&mut self, command: &str, query: &str, expected: ReadBack) -> AppResult<()> {
        let message = self.command(command).await?;
        if !message.is_empty() {
            return Err(ActuationFault::Rejected(format!("{}: {}", command, message)).into());
        }
        let mut answer = String::new();
        for attempt in 0..READ_BACK_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(READ_BACK_DELAY).await;
            }
            answer = self.command(query).await?;
            if expected.matches(&answer) {
                return Ok(());
            }
            debug!(pump = %self.name, command, query, answer = %answer, "Setting read back differs");
        }
        Err(ActuationFault::Rejected(format!("{}: read back '{}'", command, answer)).into())
    }

    async fn set_rate(&mut self, direction: PumpDirection, rate_ul_min: f64) -> AppResult<()> {
        let (word, cached) = match direction {
            PumpDirection::Inject => ("irate", &mut self.infuse_rate),
            PumpDirection::Withdraw => ("wrate", &mut self.withdraw_rate),
        };
        if *cached == Some(rate_ul_min) {
            return Ok(());
        }
        *cached = Some(rate_ul_min);
        let command = format!("{} {} u/m", word, rate_ul_min);
        let verified = self
            .command_verified(&command, word, ReadBack::RateUlMin(rate_ul_min))
            .await;
        if let Err(e) = verified {
            match direction {
                PumpDirection::Inject => self.infuse_rate = None,
                PumpDirection::Withdraw => self.withdraw_rate = None,
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl<L: SerialLink> Pump for PhdUltraPump<L> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &mut self,
        direction: PumpDirection,
        volume_ul: Option<f64>,
        rate_ul_min: f64,
    ) -> AppResult<()> {
        // Fold the previous step into the totals before the counters are cleared.
        self.poll().await?;

        let remaining = self.syringe.available_ul(direction, self.net_injected_ul());
        self.syringe
            .check_move(direction, volume_ul.unwrap_or(0.0), self.net_injected_ul())?;
        if remaining <= 0.0 {
            return Err(ActuationFault::ExceedsCapacity {
                requested_ul: volume_ul.unwrap_or(0.0),
                available_ul: 0.0,
            }
            .into());
        }

        self.command("cvolume").await?;
        self.command("ctime").await?;
        self.infused.update(0.0);
        self.withdrawn.update(0.0);

        // An open-ended move is still bounded by the syringe.
        let target = volume_ul.unwrap_or(remaining);
        self.command_verified(&format!("tvolume {} ul", target), "tvolume", ReadBack::VolumeUl(target))
            .await?;
        self.set_rate(direction, rate_ul_min).await?;
        let (method, method_name) = match direction {
            PumpDirection::Inject => ("load qs i", "Quick Start - Infuse only"),
            PumpDirection::Withdraw => ("load qs w", "Quick Start - Withdraw only"),
        };
        self.command_verified(method, "mode", ReadBack::Text(method_name))
            .await?;
        self.command("run").await?;

        if self.status == PumpStatus::Stalled {
            return Err(ActuationFault::Stalled.into());
        }
        debug!(pump = %self.name, ?direction, target_ul = target, rate_ul_min, "Pump started");
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.command("stop").await?;
        debug!(pump = %self.name, "Pump stopped");
        Ok(())
    }

    async fn poll(&mut self) -> AppResult<PumpReading> {
        let infused = self.command("ivolume").await?;
        let infused = parse_volume(&infused).unwrap_or(0.0);
        let withdrawn = self.command("wvolume").await?;
        let withdrawn = parse_volume(&withdrawn).unwrap_or(0.0);

        Ok(PumpReading {
            status: self.status,
            infused_ul: self.infused.update(infused),
            withdrawn_ul: self.withdrawn.update(withdrawn),
        })
    }

    async fn elapsed(&mut self, direction: PumpDirection) -> AppResult<Option<f64>> {
        let command = match direction {
            PumpDirection::Inject => "itime",
            PumpDirection::Withdraw => "wtime",
        };
        let message = self.command(command).await?;
        Ok(parse_time(&message))
    }
}
