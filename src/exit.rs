//! Self-termination. A stalled feed or an exhausted retry budget is answered
//! by exiting the process; the host restarts it with empty in-memory state.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExitReason {
    /// The feed's incarnation has not moved within the stall window.
    IncarnationStalled { incarnation: Option<u64>, stalled_for: Duration },
    /// Snapshots have been failing or empty for longer than the stall window.
    FeedUnavailable { failing_for: Duration },
    RetryBudgetExhausted { spent: Duration },
    FailFast,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::IncarnationStalled {
                incarnation,
                stalled_for,
            } => write!(
                f,
                "feed incarnation {} unchanged for {}s",
                incarnation.map_or_else(|| "<none>".to_string(), |i| i.to_string()),
                stalled_for.as_secs()
            ),
            ExitReason::FeedUnavailable { failing_for } => {
                write!(f, "feed unavailable for {}s", failing_for.as_secs())
            }
            ExitReason::RetryBudgetExhausted { spent } => {
                write!(f, "retry budget exhausted after {}s", spent.as_secs())
            }
            ExitReason::FailFast => write!(f, "fail-fast requested"),
        }
    }
}

/// The host's process-exit hook.
pub trait ExitSignal: Send + Sync {
    fn request_exit(&self, reason: &ExitReason);
}

/// Fires the wrapped signal at most once.
pub struct ExitLatch<X> {
    signal: X,
    fired: CancellationToken,
    reason: Mutex<Option<ExitReason>>,
}

impl<X: ExitSignal> ExitLatch<X> {
    pub fn new(signal: X) -> Self {
        Self {
            signal,
            fired: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// Returns `true` only for the call that actually fired the signal.
    pub fn fire(&self, reason: ExitReason) -> bool {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                tracing::debug!(%reason, "exit already requested, ignoring");
                return false;
            }
            *slot = Some(reason.clone());
        }
        tracing::error!(%reason, "requesting process exit");
        self.signal.request_exit(&reason);
        self.fired.cancel();
        true
    }

    pub fn reason(&self) -> Option<ExitReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once the latch has fired.
    pub async fn fired(&self) {
        self.fired.cancelled().await
    }
}

/// Exit signal for the binary: cancels the shutdown token so `main` can
/// return a failure exit code.
pub struct TokenExit {
    token: CancellationToken,
}

impl TokenExit {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl ExitSignal for TokenExit {
    fn request_exit(&self, _reason: &ExitReason) {
        self.token.cancel();
    }
}
