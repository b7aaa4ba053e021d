//! In-memory control plane and repair store.
//!
//! Used by the `demo` command and by tests. Both behave like their HTTP
//! counterparts: acknowledgements move the feed forward, and the store
//! enforces versions and the task state machine.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::channel::{ChannelError, PolicyAgentChannel, RepairAction, StatusChange, StepResponse};
use crate::coordinator::Clock;
use crate::exit::{ExitReason, ExitSignal};
use crate::model::{AckState, JobStatus, MaintenanceJob, RepairTask, RepairTaskState, Snapshot};
use crate::store::{RepairStore, StoreError, TaskFilter};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub job_id: String,
    pub response: StepResponse,
    pub delete_step_if_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRecord {
    pub role_instance: String,
    pub action: RepairAction,
    pub context_token: Option<String>,
}

#[derive(Debug, Default)]
struct ChannelState {
    snapshot: Snapshot,
    fetch_failures: u32,
    call_failures: u32,
    acks: Vec<AckRecord>,
    repairs: Vec<RepairRecord>,
    status_changes: Vec<(String, StatusChange)>,
}

impl ChannelState {
    fn bump(&mut self) {
        self.snapshot.incarnation = Some(self.snapshot.incarnation.unwrap_or(0) + 1);
    }

    fn take_failure(counter: &mut u32) -> Result<(), ChannelError> {
        if *counter > 0 {
            *counter -= 1;
            return Err(ChannelError::Unavailable {
                status: 503,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }
}

/// A scriptable control plane.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChannel {
    inner: Arc<Mutex<ChannelState>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        let channel = Self::default();
        lock(&channel.inner).snapshot.incarnation = Some(1);
        channel
    }

    /// Insert or replace a job and advance the incarnation.
    pub fn upsert_job(&self, job: MaintenanceJob) {
        let mut state = lock(&self.inner);
        match state.snapshot.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => state.snapshot.jobs.push(job),
        }
        state.bump();
    }

    pub fn update_job(&self, job_id: &str, f: impl FnOnce(&mut MaintenanceJob)) {
        let mut state = lock(&self.inner);
        if let Some(job) = state.snapshot.jobs.iter_mut().find(|j| j.id == job_id) {
            f(job);
        }
        state.bump();
    }

    /// Fail the next `n` acknowledge/repair/status calls with a transient error.
    pub fn fail_next_calls(&self, n: u32) {
        lock(&self.inner).call_failures = n;
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        lock(&self.inner).acks.clone()
    }

    pub fn repairs(&self) -> Vec<RepairRecord> {
        lock(&self.inner).repairs.clone()
    }

    pub fn status_changes(&self) -> Vec<(String, StatusChange)> {
        lock(&self.inner).status_changes.clone()
    }
}

#[async_trait]
impl PolicyAgentChannel for InMemoryChannel {
    async fn fetch_snapshot(&self) -> Result<Snapshot, ChannelError> {
        let mut state = lock(&self.inner);
        ChannelState::take_failure(&mut state.fetch_failures)?;
        Ok(state.snapshot.clone())
    }

    async fn acknowledge(
        &self,
        job_id: &str,
        response: StepResponse,
        delete_step_if_present: bool,
    ) -> Result<(), ChannelError> {
        let mut state = lock(&self.inner);
        ChannelState::take_failure(&mut state.call_failures)?;
        let job = state
            .snapshot
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| ChannelError::UnknownJob(job_id.to_string()))?;
        if delete_step_if_present {
            job.current_step = None;
        } else if let Some(step) = job.current_step.as_mut() {
            step.ack_state = AckState::Acknowledged;
        }
        state.acks.push(AckRecord {
            job_id: job_id.to_string(),
            response,
            delete_step_if_present,
        });
        state.bump();
        Ok(())
    }

    async fn request_repair(
        &self,
        role_instance: &str,
        action: RepairAction,
        context_token: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut state = lock(&self.inner);
        ChannelState::take_failure(&mut state.call_failures)?;
        state.repairs.push(RepairRecord {
            role_instance: role_instance.to_string(),
            action,
            context_token: context_token.map(str::to_string),
        });
        Ok(())
    }

    async fn request_status_change(
        &self,
        job_id: &str,
        change: StatusChange,
    ) -> Result<(), ChannelError> {
        let mut state = lock(&self.inner);
        ChannelState::take_failure(&mut state.call_failures)?;
        let job = state
            .snapshot
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| ChannelError::UnknownJob(job_id.to_string()))?;
        job.status = match change {
            StatusChange::Suspend => JobStatus::Suspended,
            StatusChange::Resume => JobStatus::Executing,
        };
        state.status_changes.push((job_id.to_string(), change));
        state.bump();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    tasks: BTreeMap<String, RepairTask>,
    failures: u32,
    conflicts: VecDeque<String>,
    history: Vec<(String, RepairTaskState)>,
}

/// A repair store that enforces versions and legal transitions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task as an external actor would (e.g. an administrator).
    pub fn insert(&self, mut task: RepairTask) {
        let mut state = lock(&self.inner);
        task.version = 1;
        state.history.push((task.task_id.clone(), task.state));
        state.tasks.insert(task.task_id.clone(), task);
    }

    pub fn tasks(&self) -> Vec<RepairTask> {
        lock(&self.inner).tasks.values().cloned().collect()
    }

    /// Every state each task has been written with, in order.
    pub fn history(&self, task_id: &str) -> Vec<RepairTaskState> {
        lock(&self.inner)
            .history
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn fail_next_calls(&self, n: u32) {
        lock(&self.inner).failures = n;
    }

    fn take_failure(state: &mut StoreState) -> Result<(), StoreError> {
        if state.failures > 0 {
            state.failures -= 1;
            return Err(StoreError::Unavailable {
                status: 503,
                message: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn check_version(state: &mut StoreState, task: &RepairTask) -> Result<RepairTask, StoreError> {
        let current = state
            .tasks
            .get(&task.task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(task.task_id.clone()))?;
        let injected = state
            .conflicts
            .iter()
            .position(|id| *id == task.task_id)
            .and_then(|i| state.conflicts.remove(i))
            .is_some();
        if injected || current.version != task.version {
            return Err(StoreError::VersionConflict {
                task_id: task.task_id.clone(),
                expected: task.version,
                found: current.version + u64::from(injected),
            });
        }
        Ok(current)
    }
}

#[async_trait]
impl RepairStore for InMemoryStore {
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<RepairTask>, StoreError> {
        let mut state = lock(&self.inner);
        Self::take_failure(&mut state)?;
        Ok(state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn create(&self, task: &RepairTask) -> Result<u64, StoreError> {
        let mut state = lock(&self.inner);
        Self::take_failure(&mut state)?;
        if state.tasks.contains_key(&task.task_id) {
            return Err(StoreError::AlreadyExists(task.task_id.clone()));
        }
        let mut stored = task.clone();
        stored.version = 1;
        state.history.push((stored.task_id.clone(), stored.state));
        state.tasks.insert(stored.task_id.clone(), stored);
        Ok(1)
    }

    async fn update_execution_state(&self, task: &RepairTask) -> Result<u64, StoreError> {
        let mut state = lock(&self.inner);
        Self::take_failure(&mut state)?;
        let current = Self::check_version(&mut state, task)?;
        if current.state != task.state && !current.state.can_transition_to(task.state) {
            return Err(StoreError::InvalidTransition(crate::model::TransitionError {
                task_id: task.task_id.clone(),
                from: current.state,
                to: task.state,
            }));
        }
        let mut stored = task.clone();
        stored.version = current.version + 1;
        if current.state != stored.state {
            state.history.push((stored.task_id.clone(), stored.state));
        }
        let version = stored.version;
        state.tasks.insert(stored.task_id.clone(), stored);
        Ok(version)
    }

    async fn cancel(&self, task: &RepairTask) -> Result<u64, StoreError> {
        let mut state = lock(&self.inner);
        Self::take_failure(&mut state)?;
        let mut current = Self::check_version(&mut state, task)?;
        current.transition(RepairTaskState::Cancelled, Utc::now())?;
        current.version += 1;
        let version = current.version;
        state
            .history
            .push((current.task_id.clone(), RepairTaskState::Cancelled));
        state.tasks.insert(current.task_id.clone(), current);
        Ok(version)
    }
}

/// Exit signal that only records what was requested.
#[derive(Debug, Clone, Default)]
pub struct RecordingExit {
    reasons: Arc<Mutex<Vec<ExitReason>>>,
}

impl RecordingExit {
    pub fn reasons(&self) -> Vec<ExitReason> {
        lock(&self.reasons).clone()
    }
}

impl ExitSignal for RecordingExit {
    fn request_exit(&self, reason: &ExitReason) {
        lock(&self.reasons).push(reason.clone());
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let by = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = lock(&self.now);
        *now = now.checked_add_signed(by).unwrap_or(*now);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

#[cfg(test)]
impl InMemoryChannel {
    pub fn remove_job(&self, job_id: &str) {
        let mut state = lock(&self.inner);
        state.snapshot.jobs.retain(|j| j.id != job_id);
        state.bump();
    }

    pub fn job(&self, job_id: &str) -> Option<MaintenanceJob> {
        lock(&self.inner).snapshot.job(job_id).cloned()
    }

    pub fn set_incarnation(&self, incarnation: Option<u64>) {
        lock(&self.inner).snapshot.incarnation = incarnation;
    }

    pub fn incarnation(&self) -> Option<u64> {
        lock(&self.inner).snapshot.incarnation
    }

    pub fn fail_next_fetches(&self, n: u32) {
        lock(&self.inner).fetch_failures = n;
    }
}

#[cfg(test)]
impl InMemoryStore {
    pub fn get(&self, task_id: &str) -> Option<RepairTask> {
        lock(&self.inner).tasks.get(task_id).cloned()
    }

    /// Reject the next write to `task_id` with a version conflict.
    pub fn conflict_next_write(&self, task_id: &str) {
        lock(&self.inner).conflicts.push_back(task_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_rejects_stale_versions() {
        let store = InMemoryStore::new();
        store.insert(RepairTask::new("rt1", "InfraCoord", "Reboot", Utc::now()));
        let mut task = store.get("rt1").unwrap();
        task.transition(RepairTaskState::Claimed, Utc::now()).unwrap();
        let v2 = store.update_execution_state(&task).await.unwrap();
        assert_eq!(v2, 2);

        // Same write again still carries version 1.
        let err = store.update_execution_state(&task).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 1, found: 2, .. }));
    }

    #[tokio::test]
    async fn store_rejects_illegal_transitions() {
        let store = InMemoryStore::new();
        store.insert(RepairTask::new("rt1", "InfraCoord", "Reboot", Utc::now()));
        let mut task = store.get("rt1").unwrap();
        task.state = RepairTaskState::Executing;
        let err = store.update_execution_state(&task).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn cancel_is_terminal() {
        let store = InMemoryStore::new();
        let mut task = RepairTask::new("rt1", "InfraCoord", "Reboot", Utc::now());
        task.transition(RepairTaskState::Claimed, Utc::now()).unwrap();
        store.insert(task);
        let task = store.get("rt1").unwrap();
        store.cancel(&task).await.unwrap();
        assert_eq!(store.get("rt1").unwrap().state, RepairTaskState::Cancelled);
        assert_eq!(
            store.history("rt1"),
            vec![RepairTaskState::Claimed, RepairTaskState::Cancelled]
        );
    }

    #[tokio::test]
    async fn acknowledgement_moves_the_feed() {
        let channel = InMemoryChannel::new();
        let mut job = MaintenanceJob::new("J1", JobStatus::Executing);
        job.current_step = Some(crate::model::JobStep {
            phase: crate::model::StepPhase::WaveStarted,
            ack_state: AckState::AwaitingAck,
            response_deadline: None,
            impacted_instances: Vec::new(),
        });
        channel.upsert_job(job);
        let before = channel.incarnation();

        channel
            .acknowledge("J1", StepResponse::Approve, false)
            .await
            .unwrap();
        let job = channel.job("J1").unwrap();
        assert_eq!(job.current_step.unwrap().ack_state, AckState::Acknowledged);
        assert!(channel.incarnation() > before);

        channel
            .acknowledge("J1", StepResponse::Approve, true)
            .await
            .unwrap();
        assert!(channel.job("J1").unwrap().current_step.is_none());
        assert_eq!(channel.acks().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        use crate::retry::Retryable;
        let channel = InMemoryChannel::new();
        channel.fail_next_fetches(1);
        assert!(channel.fetch_snapshot().await.unwrap_err().is_transient());
        assert!(channel.fetch_snapshot().await.is_ok());
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(std::time::Duration::from_secs(90));
        assert_eq!(clock.now(), start + TimeDelta::seconds(90));

        // Out-of-range steps leave the clock where it was.
        clock.advance(std::time::Duration::MAX);
        assert_eq!(clock.now(), start + TimeDelta::seconds(90));
    }
}
