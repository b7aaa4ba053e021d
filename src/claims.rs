//! Claimed repair tasks waiting for the control plane to create their job.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{ExecutorData, RepairTask, RepairTaskState, Snapshot};

/// Tracks claim times and decides when an uncorrelated claim is an orphan.
#[derive(Debug, Clone)]
pub struct ClaimTracker {
    timeout: Duration,
    claimed_at: HashMap<String, DateTime<Utc>>,
    cancelled: HashSet<String>,
}

impl ClaimTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            claimed_at: HashMap::new(),
            cancelled: HashSet::new(),
        }
    }

    pub fn note_claim(&mut self, task_id: &str, at: DateTime<Utc>) {
        self.claimed_at.entry(task_id.to_string()).or_insert(at);
    }

    /// Claimed tasks with no correlated job for at least the timeout.
    ///
    /// Claim time comes from the task's persisted timestamp when there is one,
    /// so the clock survives a restart; otherwise from the first time this
    /// tracker saw the claim.
    pub fn orphans<'a>(
        &mut self,
        tasks: &'a [RepairTask],
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Vec<&'a RepairTask> {
        let claimed: Vec<&RepairTask> = tasks
            .iter()
            .filter(|t| t.state == RepairTaskState::Claimed)
            .collect();
        let still_claimed = |id: &String| claimed.iter().any(|t| t.task_id == *id);
        self.claimed_at.retain(|id, _| still_claimed(id));
        self.cancelled.retain(|id| still_claimed(id));

        let mut orphans = Vec::new();
        for task in claimed {
            let token = task
                .decode_data()
                .ok()
                .and_then(|d: ExecutorData| d.context_token);
            if let Some(token) = &token
                && snapshot.job_with_context_token(token).is_some()
            {
                // Correlated; the reconciler moves it on.
                self.claimed_at.remove(&task.task_id);
                continue;
            }

            let claimed_at = *self
                .claimed_at
                .entry(task.task_id.clone())
                .or_insert_with(|| task.timestamps.claimed_at.unwrap_or(now));
            let waited = (now - claimed_at).to_std().unwrap_or_default();
            if waited >= self.timeout && !self.cancelled.contains(&task.task_id) {
                tracing::warn!(
                    task_id = %task.task_id,
                    waited_secs = waited.as_secs(),
                    "claimed repair task has no correlated job; cancelling"
                );
                orphans.push(task);
            }
        }
        orphans
    }

    /// Record a successful cancellation so it is never repeated.
    pub fn mark_cancelled(&mut self, task_id: &str) {
        self.claimed_at.remove(task_id);
        self.cancelled.insert(task_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, MaintenanceJob};
    use chrono::TimeDelta;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn claimed(id: &str, token: &str, at: DateTime<Utc>) -> RepairTask {
        let mut task = RepairTask::new(id, "InfraCoord", "Reboot", at);
        task.transition(RepairTaskState::Claimed, at).unwrap();
        task.store_data(&ExecutorData {
            context_token: Some(token.into()),
            ..Default::default()
        });
        task
    }

    #[test]
    fn claim_becomes_orphan_at_timeout() {
        let mut tracker = ClaimTracker::new(Duration::from_secs(15));
        let tasks = vec![claimed("rt1", "tok", t(0))];
        let snapshot = Snapshot::default();

        assert!(tracker.orphans(&tasks, &snapshot, t(14)).is_empty());
        let orphans = tracker.orphans(&tasks, &snapshot, t(15));
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].task_id, "rt1");
    }

    #[test]
    fn correlated_claim_is_not_an_orphan() {
        let mut tracker = ClaimTracker::new(Duration::from_secs(15));
        let tasks = vec![claimed("rt1", "tok", t(0))];
        let mut job = MaintenanceJob::new("J1", JobStatus::Executing);
        job.context_token = Some("tok".into());
        let snapshot = Snapshot {
            incarnation: Some(1),
            jobs: vec![job],
            ..Default::default()
        };
        assert!(tracker.orphans(&tasks, &snapshot, t(60)).is_empty());
        assert!(tracker.claimed_at.is_empty());
    }

    #[test]
    fn cancelled_orphan_is_reported_once() {
        let mut tracker = ClaimTracker::new(Duration::from_secs(15));
        let tasks = vec![claimed("rt1", "tok", t(0))];
        let snapshot = Snapshot::default();
        assert_eq!(tracker.orphans(&tasks, &snapshot, t(20)).len(), 1);
        tracker.mark_cancelled("rt1");
        // A stale listing may still show it as claimed.
        assert!(tracker.orphans(&tasks, &snapshot, t(30)).is_empty());
    }

    #[test]
    fn cancelled_ids_are_forgotten_once_no_longer_listed() {
        let mut tracker = ClaimTracker::new(Duration::from_secs(15));
        let tasks = vec![claimed("rt1", "tok", t(0))];
        let snapshot = Snapshot::default();
        assert_eq!(tracker.orphans(&tasks, &snapshot, t(20)).len(), 1);
        tracker.mark_cancelled("rt1");
        assert_eq!(tracker.cancelled.len(), 1);

        let mut done = tasks[0].clone();
        done.state = RepairTaskState::Cancelled;
        assert!(tracker.orphans(&[done], &snapshot, t(30)).is_empty());
        assert!(tracker.cancelled.is_empty());
        assert!(tracker.claimed_at.is_empty());
    }

    #[test]
    fn first_seen_time_used_without_persisted_timestamp() {
        let mut tracker = ClaimTracker::new(Duration::from_secs(15));
        let mut task = claimed("rt1", "tok", t(0));
        task.timestamps.claimed_at = None;
        let tasks = vec![task];
        let snapshot = Snapshot::default();
        assert!(tracker.orphans(&tasks, &snapshot, t(100)).is_empty());
        assert!(tracker.orphans(&tasks, &snapshot, t(110)).is_empty());
        assert_eq!(tracker.orphans(&tasks, &snapshot, t(115)).len(), 1);
    }
}
