//! Capture request producers.
//!
//! - [`run_schedule`] requests one capture per elapsed schedule time;
//! - [`run_line_events`] requests one capture per line read from an input
//!   (the operator pressing Enter on the terminal).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::core::{CancellationToken, TriggerGate, TriggerSource};

/// Request a capture at each of `times` (seconds after `epoch`).
///
/// Returns the number of requests made. Times already in the past are
/// requested immediately.
pub async fn run_schedule(
    times: Vec<f64>,
    gate: Arc<TriggerGate>,
    epoch: Instant,
    token: CancellationToken,
) -> u64 {
    let mut requested = 0;
    info!(captures = times.len(), "Capture schedule started");
    for t in times {
        let Some(deadline) = Duration::try_from_secs_f64(t.max(0.0))
            .ok()
            .and_then(|offset| epoch.checked_add(offset))
        else {
            warn!(t, "Capture time out of range, schedule ends");
            break;
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep_until(deadline) => {
                let pending = gate.request_save(TriggerSource::Schedule);
                requested += 1;
                debug!(t, pending, "Scheduled capture requested");
            }
        }
    }
    requested
}

/// Request a capture for every line read from `input` until EOF or
/// cancellation. Returns the number of requests made.
pub async fn run_line_events<R>(input: R, gate: Arc<TriggerGate>, token: CancellationToken) -> u64
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut requested = 0;
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(_)) => {
                gate.request_save(TriggerSource::Event);
                requested += 1;
                info!(requested, "Capture requested from input");
            }
            Ok(None) | Err(_) => break,
        }
    }
    requested
}
