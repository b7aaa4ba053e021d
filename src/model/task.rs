use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::{ImpactedInstance, MaintenanceJob, StepPhase};

/// States of a repair task in the cluster repair store.
///
/// Linear: CREATED → CLAIMED → PREPARING → APPROVED → EXECUTING → RESTORING → COMPLETED,
/// with CANCELLED reachable from CLAIMED and PREPARING only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RepairTaskState {
    Created,
    Claimed,
    Preparing,
    Approved,
    Executing,
    Restoring,
    Completed,
    Cancelled,
}

impl fmt::Display for RepairTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairTaskState::Created => write!(f, "CREATED"),
            RepairTaskState::Claimed => write!(f, "CLAIMED"),
            RepairTaskState::Preparing => write!(f, "PREPARING"),
            RepairTaskState::Approved => write!(f, "APPROVED"),
            RepairTaskState::Executing => write!(f, "EXECUTING"),
            RepairTaskState::Restoring => write!(f, "RESTORING"),
            RepairTaskState::Completed => write!(f, "COMPLETED"),
            RepairTaskState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl RepairTaskState {
    /// Every state a task can still leave.
    pub const ACTIVE: [RepairTaskState; 6] = [
        RepairTaskState::Created,
        RepairTaskState::Claimed,
        RepairTaskState::Preparing,
        RepairTaskState::Approved,
        RepairTaskState::Executing,
        RepairTaskState::Restoring,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, RepairTaskState::Completed | RepairTaskState::Cancelled)
    }

    pub fn can_transition_to(self, next: RepairTaskState) -> bool {
        use RepairTaskState::*;
        matches!(
            (self, next),
            (Created, Claimed)
                | (Claimed, Preparing)
                | (Preparing, Approved)
                | (Approved, Executing)
                | (Executing, Restoring)
                | (Restoring, Completed)
                | (Claimed, Cancelled)
                | (Preparing, Cancelled)
        )
    }

    /// The states to pass through, in order, to reach `target` along the linear path.
    /// Empty when already there; `None` when `target` is behind or off the path.
    pub fn path_to(self, target: RepairTaskState) -> Option<Vec<RepairTaskState>> {
        use RepairTaskState::*;
        const LINE: [RepairTaskState; 7] =
            [Created, Claimed, Preparing, Approved, Executing, Restoring, Completed];
        let from = LINE.iter().position(|s| *s == self)?;
        let to = LINE.iter().position(|s| *s == target)?;
        if to < from {
            return None;
        }
        Some(LINE[from + 1..=to].to_vec())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("task {task_id}: transition {from} -> {to} is not allowed")]
pub struct TransitionError {
    pub task_id: String,
    pub from: RepairTaskState,
    pub to: RepairTaskState,
}

/// Entry time into each state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub preparing_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub executing_at: Option<DateTime<Utc>>,
    pub restoring_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl TaskTimestamps {
    fn stamp(&mut self, state: RepairTaskState, now: DateTime<Utc>) {
        let slot = match state {
            RepairTaskState::Created => &mut self.created_at,
            RepairTaskState::Claimed => &mut self.claimed_at,
            RepairTaskState::Preparing => &mut self.preparing_at,
            RepairTaskState::Approved => &mut self.approved_at,
            RepairTaskState::Executing => &mut self.executing_at,
            RepairTaskState::Restoring => &mut self.restoring_at,
            RepairTaskState::Completed => &mut self.completed_at,
            RepairTaskState::Cancelled => &mut self.cancelled_at,
        };
        *slot = Some(now);
    }
}

/// What the task's current wave does to the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskImpact {
    pub update_domain: Option<u32>,
    #[serde(default)]
    pub instances: Vec<ImpactedInstance>,
}

/// A unit of planned node maintenance owned by the cluster repair store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairTask {
    pub task_id: String,
    /// Store-assigned version; updates are accepted only against the current one.
    #[serde(default)]
    pub version: u64,
    pub state: RepairTaskState,
    pub executor: String,
    #[serde(default)]
    pub executor_data: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub target: Vec<String>,
    #[serde(default)]
    pub impact: TaskImpact,
    #[serde(default)]
    pub timestamps: TaskTimestamps,
}

impl RepairTask {
    pub fn new(
        task_id: impl Into<String>,
        executor: impl Into<String>,
        action: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut timestamps = TaskTimestamps::default();
        timestamps.stamp(RepairTaskState::Created, now);
        Self {
            task_id: task_id.into(),
            version: 0,
            state: RepairTaskState::Created,
            executor: executor.into(),
            executor_data: String::new(),
            action: action.into(),
            target: Vec::new(),
            impact: TaskImpact::default(),
            timestamps,
        }
    }

    /// Move to `next`, stamping the entry time.
    pub fn transition(
        &mut self,
        next: RepairTaskState,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                task_id: self.task_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.timestamps.stamp(next, now);
        Ok(())
    }

    /// Overwrite target and impact with the job's current wave.
    pub fn apply_wave(&mut self, job: &MaintenanceJob) {
        self.target = job.wave_instances();
        self.impact = TaskImpact {
            update_domain: job.current_step.as_ref().and_then(|s| s.update_domain()),
            instances: job
                .current_step
                .as_ref()
                .map(|s| s.impacted_instances.clone())
                .unwrap_or_default(),
        };
    }

    pub fn decode_data(&self) -> Result<ExecutorData, serde_json::Error> {
        ExecutorData::decode(&self.executor_data)
    }

    pub fn store_data(&mut self, data: &ExecutorData) {
        self.executor_data = data.encode();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WavePhase {
    Started,
    Ended,
}

impl From<StepPhase> for WavePhase {
    fn from(phase: StepPhase) -> Self {
        match phase {
            StepPhase::WaveStarted => WavePhase::Started,
            StepPhase::WaveEnded => WavePhase::Ended,
        }
    }
}

/// The last wave a task was driven through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveMarker {
    pub ordinal: u32,
    pub fingerprint: String,
    pub phase: WavePhase,
}

impl WaveMarker {
    pub fn first(fingerprint: impl Into<String>, phase: WavePhase) -> Self {
        Self {
            ordinal: 1,
            fingerprint: fingerprint.into(),
            phase,
        }
    }
}

/// Correlation payload persisted in `RepairTask::executor_data`.
///
/// This is the only link between a job and its task, so everything the
/// reconciler needs after a restart has to be recoverable from here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorData {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub context_token: Option<String>,
    #[serde(default)]
    pub instance: Option<i64>,
    #[serde(default)]
    pub wave: Option<WaveMarker>,
    #[serde(default)]
    pub suspended: bool,
    /// Set once the control plane has accepted the repair request for a claim.
    #[serde(default)]
    pub repair_requested: bool,
}

impl ExecutorData {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> String {
        // Serializing plain strings/ints cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Left by an administrator: not yet linked to a job or a claim.
    pub fn is_placeholder(&self) -> bool {
        self.job_id.is_none() && self.context_token.is_none()
    }

    /// The marker this task should carry after observing `fingerprint` in
    /// `phase`, or `None` when the observation was already recorded.
    pub fn next_wave(&self, fingerprint: &str, phase: WavePhase) -> Option<WaveMarker> {
        let Some(current) = &self.wave else {
            return Some(WaveMarker::first(fingerprint, phase));
        };
        let same_wave = current.fingerprint == fingerprint;
        match (phase, current.phase) {
            (WavePhase::Started, WavePhase::Started) if same_wave => None,
            (WavePhase::Ended, WavePhase::Ended) if same_wave => None,
            (WavePhase::Ended, WavePhase::Started) if same_wave => Some(WaveMarker {
                ordinal: current.ordinal,
                fingerprint: current.fingerprint.clone(),
                phase: WavePhase::Ended,
            }),
            // A different wave, or the same wave traversed again.
            _ => Some(WaveMarker {
                ordinal: current.ordinal + 1,
                fingerprint: fingerprint.to_string(),
                phase,
            }),
        }
    }
}

/// Issues task instance numbers: `(epoch << 32) | sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sequencer {
    epoch: u32,
    next: u32,
}

impl Sequencer {
    pub fn new(epoch: u32) -> Self {
        Self { epoch, next: 0 }
    }

    pub fn peek(&self) -> u32 {
        self.next
    }

    pub fn issue(&mut self) -> i64 {
        let instance = (i64::from(self.epoch) << 32) | i64::from(self.next);
        self.next = self.next.wrapping_add(1);
        instance
    }

    pub fn task_id(executor: &str, job_id: &str, instance: i64) -> String {
        format!("{executor}/{job_id}/{instance:016x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn linear_path_is_enforced() {
        let mut task = RepairTask::new("t1", "InfraCoord", "Reboot", now());
        task.transition(RepairTaskState::Claimed, now()).unwrap();
        task.transition(RepairTaskState::Preparing, now()).unwrap();
        let err = task.transition(RepairTaskState::Executing, now()).unwrap_err();
        assert_eq!(err.from, RepairTaskState::Preparing);
        assert_eq!(err.to, RepairTaskState::Executing);
        assert_eq!(task.state, RepairTaskState::Preparing);
    }

    #[test]
    fn cancel_only_from_claimed_or_preparing() {
        use RepairTaskState::*;
        assert!(Claimed.can_transition_to(Cancelled));
        assert!(Preparing.can_transition_to(Cancelled));
        assert!(!Approved.can_transition_to(Cancelled));
        assert!(!Executing.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn transitions_stamp_entry_times() {
        let t0 = now();
        let mut task = RepairTask::new("t1", "InfraCoord", "Reboot", t0);
        task.transition(RepairTaskState::Claimed, t0).unwrap();
        assert_eq!(task.timestamps.created_at, Some(t0));
        assert_eq!(task.timestamps.claimed_at, Some(t0));
        assert!(task.timestamps.preparing_at.is_none());
    }

    #[test]
    fn path_to_walks_forward_only() {
        use RepairTaskState::*;
        assert_eq!(Preparing.path_to(Executing), Some(vec![Approved, Executing]));
        assert_eq!(Executing.path_to(Executing), Some(vec![]));
        assert_eq!(Restoring.path_to(Executing), None);
        assert_eq!(Cancelled.path_to(Completed), None);
    }

    #[test]
    fn empty_executor_data_is_placeholder() {
        let data = ExecutorData::decode("").unwrap();
        assert!(data.is_placeholder());
        let data = ExecutorData::decode("{}").unwrap();
        assert!(data.is_placeholder());
        assert!(ExecutorData::decode("not json").is_err());
    }

    #[test]
    fn executor_data_survives_encoding() {
        let data = ExecutorData {
            job_id: Some("J1".into()),
            instance: Some(7),
            wave: Some(WaveMarker::first("ud0:R0,R1", WavePhase::Started)),
            ..Default::default()
        };
        let raw = data.encode();
        assert!(raw.contains("\"fingerprint\":\"ud0:R0,R1\""));
        assert!(raw.contains("\"phase\":\"started\""));
        assert_eq!(ExecutorData::decode(&raw).unwrap(), data);
    }

    #[test]
    fn next_wave_ignores_repeated_observation() {
        let data = ExecutorData {
            wave: Some(WaveMarker::first("ud0:R0", WavePhase::Started)),
            ..Default::default()
        };
        assert!(data.next_wave("ud0:R0", WavePhase::Started).is_none());

        let ended = data.next_wave("ud0:R0", WavePhase::Ended).unwrap();
        assert_eq!(ended.ordinal, 1);
        assert_eq!(ended.phase, WavePhase::Ended);
    }

    #[test]
    fn next_wave_counts_new_and_repeated_traversals() {
        let data = ExecutorData {
            wave: Some(WaveMarker {
                ordinal: 1,
                fingerprint: "ud0:R0".into(),
                phase: WavePhase::Ended,
            }),
            ..Default::default()
        };
        let next = data.next_wave("ud1:R1", WavePhase::Started).unwrap();
        assert_eq!(next.ordinal, 2);
        assert_eq!(next.fingerprint, "ud1:R1");

        // Platform-update jobs may come back to a wave they already finished.
        let again = data.next_wave("ud0:R0", WavePhase::Started).unwrap();
        assert_eq!(again.ordinal, 2);
    }

    #[test]
    fn sequencer_encodes_epoch_and_sequence() {
        let mut seq = Sequencer::new(2);
        assert_eq!(seq.issue(), 2_i64 << 32);
        assert_eq!(seq.issue(), (2_i64 << 32) | 1);
        assert_eq!(seq.peek(), 2);
        assert_eq!(
            Sequencer::task_id("InfraCoord", "J1", 0x2_0000_0001),
            "InfraCoord/J1/0000000200000001"
        );
    }
}
