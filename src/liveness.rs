//! Feed liveness: watches the snapshot incarnation across polls.
//!
//! The incarnation is the only evidence that the control plane is still
//! talking to this node. If it stops moving, or snapshots stop arriving, for
//! longer than the stall window, the coordinator exits so the host can fail
//! over and restart it.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::exit::ExitReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Keep going. `trusted` is false until the feed has proven it moves,
    /// when startup confirmation is required.
    Healthy { trusted: bool },
    Stalled(ExitReason),
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    stall_window: Duration,
    last_incarnation: Option<u64>,
    last_change_at: Option<DateTime<Utc>>,
    failing_since: Option<DateTime<Utc>>,
    trusted: bool,
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

impl LivenessMonitor {
    /// A zero `stall_window` disables stall detection.
    pub fn new(stall_window: Duration, require_confirmed: bool) -> Self {
        Self {
            stall_window,
            last_incarnation: None,
            last_change_at: None,
            failing_since: None,
            trusted: !require_confirmed,
        }
    }

    pub fn last_incarnation(&self) -> Option<u64> {
        self.last_incarnation
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    fn enabled(&self) -> bool {
        !self.stall_window.is_zero()
    }

    /// Record a successful fetch. A missing incarnation counts as an empty feed.
    pub fn observe(&mut self, incarnation: Option<u64>, now: DateTime<Utc>) -> LivenessVerdict {
        let Some(incarnation) = incarnation else {
            return self.observe_failure(now);
        };
        self.failing_since = None;

        match self.last_incarnation {
            None => {
                tracing::info!(incarnation, "first observed feed incarnation");
                self.last_incarnation = Some(incarnation);
                self.last_change_at = Some(now);
            }
            Some(last) if last != incarnation => {
                tracing::debug!(from = last, to = incarnation, "feed incarnation changed");
                if !self.trusted {
                    tracing::info!(incarnation, "feed incarnation confirmed; reconciliation enabled");
                }
                self.last_incarnation = Some(incarnation);
                self.last_change_at = Some(now);
                self.trusted = true;
            }
            Some(_) => {}
        }

        if let Some(changed_at) = self.last_change_at {
            let stalled_for = elapsed(changed_at, now);
            if self.enabled() && stalled_for >= self.stall_window {
                tracing::warn!(
                    incarnation,
                    last_changed = %changed_at,
                    stalled_secs = stalled_for.as_secs(),
                    "feed incarnation stalled; channel may be down on this node"
                );
                return LivenessVerdict::Stalled(ExitReason::IncarnationStalled {
                    incarnation: Some(incarnation),
                    stalled_for,
                });
            }
        }
        LivenessVerdict::Healthy {
            trusted: self.trusted,
        }
    }

    /// Record a failed or empty fetch.
    pub fn observe_failure(&mut self, now: DateTime<Utc>) -> LivenessVerdict {
        let since = *self.failing_since.get_or_insert(now);
        let failing_for = elapsed(since, now);
        if self.enabled() && failing_for >= self.stall_window {
            tracing::warn!(
                failing_secs = failing_for.as_secs(),
                "no usable snapshot within the stall window"
            );
            return LivenessVerdict::Stalled(ExitReason::FeedUnavailable { failing_for });
        }
        LivenessVerdict::Healthy {
            trusted: self.trusted,
        }
    }
}
