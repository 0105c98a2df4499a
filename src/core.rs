//! Shared coordination primitives for the experiment workers.
//!
//! The sampling, regulation, actuation and acquisition workers run as
//! independent tasks. The only mutable state they share lives here:
//!
//! - [`CancellationToken`]: a one-way "stop now" flag that every worker polls
//!   and can also await inside `tokio::select!`.
//! - [`TriggerGate`]: the pending capture requests. Producers (schedule,
//!   keyboard events, regulation transitions) call [`TriggerGate::request_save`];
//!   the acquisition worker calls [`TriggerGate::try_consume`].
//!
//! # Thread Safety
//!
//! Both types are `Send + Sync` and are shared by `Arc` (the token is itself a
//! cheap clonable handle over `tokio_util`'s token). The gate's mutex guards a
//! handful of counters and is never held across `.await`, device I/O or sleeps.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// =============================================================================
// CancellationToken
// =============================================================================

/// Cooperative cancellation shared by every worker of a run.
///
/// A thin handle over [`tokio_util::sync::CancellationToken`]. Cancellation is
/// monotonic: once [`cancel`](Self::cancel) has been called the token stays
/// cancelled for the rest of the run.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    /// Create a token in the active (not cancelled) state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Sleep for `period` unless cancelled first.
    ///
    /// Returns `true` if the sleep was cut short by cancellation.
    pub async fn sleep(&self, period: Duration) -> bool {
        tokio::select! {
            _ = self.inner.cancelled() => true,
            _ = tokio::time::sleep(period) => self.is_cancelled(),
        }
    }
}

// =============================================================================
// TriggerGate
// =============================================================================

/// Who asked for a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// A capture schedule time elapsed
    Schedule,
    /// An external event (e.g. the operator pressed Enter)
    Event,
    /// The regulation loop changed command
    Regulation,
}

/// Counters describing the gate's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStats {
    /// Total capture requests received
    pub requested: u64,
    /// Requests consumed by the acquisition worker
    pub serviced: u64,
}

impl GateStats {
    /// Requests still waiting to be serviced.
    pub fn pending(&self) -> u64 {
        self.requested - self.serviced
    }
}

#[derive(Debug, Default)]
struct GateState {
    pending: u64,
    stats: GateStats,
    last_source: Option<TriggerSource>,
}

/// Pending capture requests, decoupling "an image is needed" from "the
/// capture worker took it".
///
/// Requests are counted rather than latched so that several requests made
/// before the capture worker runs are each serviced once.
#[derive(Debug, Default)]
pub struct TriggerGate {
    state: Mutex<GateState>,
}

impl TriggerGate {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side: record that a capture is due.
    ///
    /// Returns the number of requests now pending.
    pub fn request_save(&self, source: TriggerSource) -> u64 {
        let mut state = self.state.lock();
        state.pending += 1;
        state.stats.requested += 1;
        state.last_source = Some(source);
        state.pending
    }

    /// Consumer side: take one pending request, if any.
    ///
    /// Returns `true` when a capture was due; the request is then considered
    /// serviced and will not be returned again.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending == 0 {
            return false;
        }
        state.pending -= 1;
        state.stats.serviced += 1;
        true
    }

    /// Whether at least one request is waiting. Does not consume.
    pub fn should_save(&self) -> bool {
        self.state.lock().pending > 0
    }

    /// Source of the most recent request.
    pub fn last_source(&self) -> Option<TriggerSource> {
        self.state.lock().last_source
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> GateStats {
        self.state.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_one_way() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.clone().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_for_waiters() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already-cancelled token should resolve at once");
    }

    #[tokio::test]
    async fn test_sleep_is_cut_short() {
        let token = CancellationToken::new();
        let sleeper = {
            let token = token.clone();
            tokio::spawn(async move { token.sleep(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        let interrupted = tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("sleep should end")
            .expect("sleeper should not panic");
        assert!(interrupted);
    }

    #[tokio::test]
    async fn test_sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(!token.sleep(Duration::from_millis(5)).await);
    }

    #[test]
    fn test_gate_services_each_request_once() {
        let gate = TriggerGate::new();
        assert!(!gate.try_consume());

        gate.request_save(TriggerSource::Schedule);
        gate.request_save(TriggerSource::Event);
        assert!(gate.should_save());
        assert_eq!(gate.last_source(), Some(TriggerSource::Event));

        assert!(gate.try_consume());
        assert!(gate.try_consume());
        assert!(!gate.try_consume());
        assert!(!gate.should_save());

        let stats = gate.stats();
        assert_eq!(stats.requested, 2);
        assert_eq!(stats.serviced, 2);
        assert_eq!(stats.pending(), 0);
    }
}
