//! Job reconciliation: one pass maps every job in a snapshot to the repair
//! task writes and acknowledgements it still needs.
//!
//! Nothing here survives a restart except what is written to the store. A
//! task's `executor_data` names its job and the last wave it was driven
//! through, so a fresh process re-derives every decision from the two
//! external systems alone.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::channel::{ChannelError, PolicyAgentChannel, RepairAction, StatusChange, StepResponse};
use crate::claims::ClaimTracker;
use crate::command::{OutcomeReport, QueuedCommand, TaskOutcome};
use crate::model::{
    ExecutorData, JobStatus, MaintenanceJob, RepairTask, RepairTaskState, Sequencer, Snapshot,
    TransitionError, WaveMarker, WavePhase,
};
use crate::outbound::Outbound;
use crate::policy::{HoldReason, PolicyChain, PolicyContext, Verdict};
use crate::store::{RepairStore, StoreError, TaskFilter};

#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl JobError {
    fn is_conflict(&self) -> bool {
        matches!(self, JobError::Store(StoreError::VersionConflict { .. }))
    }
}

/// What a single pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Tasks created for jobs the coordinator had not seen before.
    pub claimed: Vec<String>,
    /// Claimed tasks linked to the job the control plane created for them.
    pub correlated: Vec<String>,
    pub transitions: Vec<(String, RepairTaskState)>,
    pub acknowledged: Vec<String>,
    pub repair_requests: Vec<String>,
    pub cancelled: Vec<String>,
    pub retired: Vec<String>,
    pub held: Vec<String>,
    pub skipped: Vec<String>,
    pub conflicts: u32,
    pub errors: u32,
    /// The pass stopped early (store unreachable or cancellation).
    pub incomplete: bool,
}

impl PassReport {
    pub fn is_quiet(&self) -> bool {
        self.claimed.is_empty()
            && self.correlated.is_empty()
            && self.transitions.is_empty()
            && self.acknowledged.is_empty()
            && self.repair_requests.is_empty()
            && self.cancelled.is_empty()
            && self.retired.is_empty()
    }
}

/// A non-terminal task together with its decoded correlation data.
struct Tracked {
    task: RepairTask,
    data: ExecutorData,
}

impl Tracked {
    fn belongs_to(&self, job: &MaintenanceJob) -> bool {
        if let Some(job_id) = &self.data.job_id {
            return *job_id == job.id;
        }
        self.task.state == RepairTaskState::Claimed
            && self.data.context_token.is_some()
            && self.data.context_token.as_deref() == job.context_token()
    }

    /// A claim whose repair request never got through and whose job has not
    /// shown up either.
    fn awaits_repair_request(&self, snapshot: &Snapshot) -> bool {
        self.task.state == RepairTaskState::Claimed
            && self.data.job_id.is_none()
            && !self.data.repair_requested
            && self
                .data
                .context_token
                .as_deref()
                .is_some_and(|token| snapshot.job_with_context_token(token).is_none())
    }
}

async fn save<C, S>(out: &mut Outbound<'_, C, S>, tracked: &mut Tracked) -> Result<(), JobError>
where
    C: PolicyAgentChannel,
    S: RepairStore,
{
    tracked.task.store_data(&tracked.data);
    tracked.task.version = out.update_task(&tracked.task).await?;
    Ok(())
}

/// Drive the task along the linear path to `target`, one versioned write per step.
async fn walk<C, S>(
    out: &mut Outbound<'_, C, S>,
    tracked: &mut Tracked,
    target: RepairTaskState,
    now: DateTime<Utc>,
    report: &mut PassReport,
) -> Result<(), JobError>
where
    C: PolicyAgentChannel,
    S: RepairStore,
{
    let path = tracked.task.state.path_to(target).ok_or_else(|| TransitionError {
        task_id: tracked.task.task_id.clone(),
        from: tracked.task.state,
        to: target,
    })?;
    for next in path {
        tracked.task.transition(next, now)?;
        save(out, tracked).await?;
        tracing::info!(task_id = %tracked.task.task_id, state = %next, "repair task advanced");
        report.transitions.push((tracked.task.task_id.clone(), next));
    }
    Ok(())
}

async fn cancel<C, S>(
    out: &mut Outbound<'_, C, S>,
    tracked: &mut Tracked,
    report: &mut PassReport,
) -> Result<(), JobError>
where
    C: PolicyAgentChannel,
    S: RepairStore,
{
    tracked.task.version = out.cancel_task(&tracked.task).await?;
    tracked.task.state = RepairTaskState::Cancelled;
    tracing::info!(task_id = %tracked.task.task_id, "repair task cancelled");
    report.cancelled.push(tracked.task.task_id.clone());
    Ok(())
}

pub struct JobReconciler {
    executor: String,
    policies: PolicyChain,
    claims: ClaimTracker,
    holds: HashMap<String, HoldReason>,
    retired: HashSet<String>,
    /// Outcome reports waiting for a pass that can see the task list.
    outcomes: Vec<OutcomeReport>,
}

impl JobReconciler {
    pub fn new(executor: impl Into<String>, orphan_claim_timeout: Duration) -> Self {
        Self {
            executor: executor.into(),
            policies: PolicyChain::default(),
            claims: ClaimTracker::new(orphan_claim_timeout),
            holds: HashMap::new(),
            retired: HashSet::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn holds(&self) -> &HashMap<String, HoldReason> {
        &self.holds
    }

    pub fn retired_jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = self.retired.iter().cloned().collect();
        jobs.sort();
        jobs
    }

    /// Run one reconciliation pass over `snapshot`.
    ///
    /// Queued commands are applied first. Jobs are handled one at a time; a
    /// failure on one job is logged and the pass moves on to the next.
    pub async fn reconcile<C, S>(
        &mut self,
        snapshot: &Snapshot,
        commands: Vec<QueuedCommand>,
        sequencer: &mut Sequencer,
        out: &mut Outbound<'_, C, S>,
        now: DateTime<Utc>,
    ) -> PassReport
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let mut report = PassReport::default();

        for command in commands {
            match command {
                QueuedCommand::Outcome(outcome) => self.outcomes.push(outcome),
                other => self.apply_command(other, out, &mut report).await,
            }
        }

        let filter = TaskFilter::executor(&self.executor).with_states(&RepairTaskState::ACTIVE);
        let tasks = match out.list_tasks(&filter).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    pending_outcomes = self.outcomes.len(),
                    "could not list repair tasks; pass abandoned"
                );
                report.errors += 1;
                report.incomplete = true;
                return report;
            }
        };

        for outcome in std::mem::take(&mut self.outcomes) {
            self.apply_outcome(outcome, &tasks);
        }

        self.retired.retain(|id| snapshot.job(id).is_some());

        let mut active = Vec::new();
        let mut placeholders = Vec::new();
        for task in &tasks {
            if task.state.is_terminal() {
                continue;
            }
            match task.decode_data() {
                Ok(data) if task.state == RepairTaskState::Created && data.is_placeholder() => {
                    placeholders.push(task.clone());
                }
                Ok(data) => active.push(Tracked {
                    task: task.clone(),
                    data,
                }),
                Err(_) if task.state == RepairTaskState::Created => placeholders.push(task.clone()),
                Err(err) => {
                    tracing::warn!(task_id = %task.task_id, error = %err, "unreadable executor data; task skipped");
                }
            }
        }

        for task in placeholders {
            if out.is_cancelled() {
                report.incomplete = true;
                return report;
            }
            let task_id = task.task_id.clone();
            if let Err(err) = self.claim_placeholder(task, out, now, &mut report).await {
                Self::record_failure(&task_id, &err, &mut report);
            }
        }

        for job in &snapshot.jobs {
            if out.is_cancelled() {
                report.incomplete = true;
                return report;
            }
            if self.retired.contains(&job.id) {
                continue;
            }
            let owned: Vec<usize> = active
                .iter()
                .enumerate()
                .filter(|(_, t)| t.belongs_to(job))
                .map(|(i, _)| i)
                .collect();
            if owned.len() > 1 {
                tracing::warn!(job_id = %job.id, tasks = owned.len(), "more than one active task correlates to job; skipped");
                report.skipped.push(job.id.clone());
                continue;
            }
            let tracked = match owned.first() {
                Some(&i) => Some(&mut active[i]),
                None => None,
            };
            if let Err(err) = self
                .reconcile_job(job, tracked, sequencer, out, now, &mut report)
                .await
            {
                Self::record_failure(&job.id, &err, &mut report);
            }
        }

        let orphans: Vec<RepairTask> = self
            .claims
            .orphans(&tasks, snapshot, now)
            .into_iter()
            .cloned()
            .collect();
        for task in orphans {
            match out.cancel_task(&task).await {
                Ok(_) => {
                    self.claims.mark_cancelled(&task.task_id);
                    report.cancelled.push(task.task_id);
                }
                Err(err) => Self::record_failure(&task.task_id, &JobError::from(err), &mut report),
            }
        }

        for tracked in active.iter_mut() {
            if !tracked.awaits_repair_request(snapshot) || report.cancelled.contains(&tracked.task.task_id) {
                continue;
            }
            if out.is_cancelled() {
                report.incomplete = true;
                return report;
            }
            tracing::info!(task_id = %tracked.task.task_id, "repair request for claim not yet accepted; sending again");
            if let Err(err) = self.request_repair_for_claim(tracked, out, &mut report).await {
                Self::record_failure(&tracked.task.task_id, &err, &mut report);
            }
        }

        report
    }

    fn record_failure(subject: &str, err: &JobError, report: &mut PassReport) {
        if err.is_conflict() {
            tracing::info!(subject, error = %err, "concurrent update; will re-read next pass");
            report.conflicts += 1;
        } else {
            tracing::warn!(subject, error = %err, "reconciliation step failed");
            report.errors += 1;
        }
    }

    async fn apply_command<C, S>(
        &mut self,
        command: QueuedCommand,
        out: &mut Outbound<'_, C, S>,
        report: &mut PassReport,
    ) where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let result = match &command {
            QueuedCommand::Suspend { job_id } => {
                self.holds.insert(job_id.clone(), HoldReason::AdminSuspend);
                out.request_status_change(job_id, StatusChange::Suspend).await
            }
            QueuedCommand::Resume { job_id } => {
                self.holds.remove(job_id);
                out.request_status_change(job_id, StatusChange::Resume).await
            }
            QueuedCommand::Maintenance {
                role_instance,
                action,
            } => {
                let result = out.request_repair(role_instance, *action, None).await;
                if result.is_ok() {
                    report.repair_requests.push(role_instance.clone());
                }
                result
            }
            QueuedCommand::Outcome(_) => Ok(()),
        };
        match result {
            Ok(()) => tracing::info!(?command, "administrative command applied"),
            Err(err) => {
                tracing::warn!(?command, error = %err, "administrative command failed");
                report.errors += 1;
            }
        }
    }

    fn apply_outcome(&mut self, outcome: OutcomeReport, tasks: &[RepairTask]) {
        let Some(task) = tasks.iter().find(|t| t.task_id == outcome.task_id) else {
            tracing::warn!(task_id = %outcome.task_id, "outcome reported for unknown task; dropped");
            return;
        };
        let Ok(data) = task.decode_data() else {
            tracing::warn!(task_id = %outcome.task_id, "outcome reported for task with unreadable data; dropped");
            return;
        };
        if data.instance != Some(outcome.instance) {
            tracing::info!(
                task_id = %outcome.task_id,
                reported = outcome.instance,
                current = ?data.instance,
                "stale outcome report dropped"
            );
            return;
        }
        match outcome.outcome {
            TaskOutcome::Started | TaskOutcome::Finished => {
                tracing::info!(task_id = %outcome.task_id, outcome = ?outcome.outcome, "task outcome reported");
            }
            TaskOutcome::Failed => {
                if let Some(job_id) = data.job_id {
                    tracing::warn!(task_id = %outcome.task_id, %job_id, "task failed; job held until resumed");
                    self.holds.insert(
                        job_id,
                        HoldReason::TaskFailed {
                            task_id: outcome.task_id,
                        },
                    );
                }
            }
        }
    }

    /// An administrator left a task in Created: claim it and ask the control
    /// plane for a job that will carry our token.
    async fn claim_placeholder<C, S>(
        &mut self,
        task: RepairTask,
        out: &mut Outbound<'_, C, S>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let token = Uuid::new_v4().to_string();
        let mut tracked = Tracked {
            task,
            data: ExecutorData {
                context_token: Some(token),
                ..Default::default()
            },
        };
        tracked.task.transition(RepairTaskState::Claimed, now)?;
        save(out, &mut tracked).await?;
        self.claims.note_claim(&tracked.task.task_id, now);
        report
            .transitions
            .push((tracked.task.task_id.clone(), RepairTaskState::Claimed));
        self.request_repair_for_claim(&mut tracked, out, report).await
    }

    /// Send the claim's repair request and record that it was accepted. A
    /// claim that never gets one is retried on later passes until the claim
    /// times out.
    async fn request_repair_for_claim<C, S>(
        &mut self,
        tracked: &mut Tracked,
        out: &mut Outbound<'_, C, S>,
        report: &mut PassReport,
    ) -> Result<(), JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let target = tracked.task.target.first().cloned();
        let action = tracked.task.action.parse::<RepairAction>();
        match (target, action) {
            (Some(target), Ok(action)) => {
                let token = tracked.data.context_token.clone();
                out.request_repair(&target, action, token.as_deref()).await?;
                tracing::info!(task_id = %tracked.task.task_id, %target, %action, "claimed administrator task; repair requested");
                report.repair_requests.push(target);
                tracked.data.repair_requested = true;
                save(out, tracked).await?;
            }
            (target, action) => {
                tracing::warn!(
                    task_id = %tracked.task.task_id,
                    has_target = target.is_some(),
                    action = ?action,
                    "administrator task cannot be requested; cancelling"
                );
                cancel(out, tracked, report).await?;
                self.claims.mark_cancelled(&tracked.task.task_id);
            }
        }
        Ok(())
    }

    async fn reconcile_job<C, S>(
        &mut self,
        job: &MaintenanceJob,
        tracked: Option<&mut Tracked>,
        sequencer: &mut Sequencer,
        out: &mut Outbound<'_, C, S>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let verdict = self.policies.evaluate(&PolicyContext {
            job,
            holds: &self.holds,
        });
        if let Verdict::Skip(reason) = &verdict {
            tracing::warn!(job_id = %job.id, %reason, "job skipped for this pass");
            report.skipped.push(job.id.clone());
            return Ok(());
        }

        if job.status == JobStatus::Completed {
            return self.complete_job(job, tracked, out, now, report).await;
        }

        if let Verdict::Hold(reason) = &verdict {
            tracing::debug!(job_id = %job.id, %reason, "job held");
            return Self::hold(job, tracked, out, report).await;
        }
        if job.status == JobStatus::Suspended {
            return Self::hold(job, tracked, out, report).await;
        }

        let Some(tracked) = tracked else {
            return self.claim_job(job, sequencer, out, now, report).await;
        };

        if tracked.task.state == RepairTaskState::Claimed && tracked.data.job_id.is_none() {
            return Self::correlate(job, tracked, sequencer, out, now, report).await;
        }

        if tracked.data.suspended && !Self::resume(job, tracked, out, now, report).await? {
            return Ok(());
        }

        Self::drive_step(job, tracked, out, now, report).await
    }

    async fn claim_job<C, S>(
        &mut self,
        job: &MaintenanceJob,
        sequencer: &mut Sequencer,
        out: &mut Outbound<'_, C, S>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let instance = sequencer.issue();
        let task_id = Sequencer::task_id(&self.executor, &job.id, instance);
        let mut task = RepairTask::new(
            &task_id,
            &self.executor,
            job.classification.action.to_string(),
            now,
        );
        task.transition(RepairTaskState::Claimed, now)?;
        task.transition(RepairTaskState::Preparing, now)?;
        task.apply_wave(job);
        let phase = job
            .current_step
            .as_ref()
            .map_or(WavePhase::Started, |s| s.phase.into());
        task.store_data(&ExecutorData {
            job_id: Some(job.id.clone()),
            context_token: job.context_token().map(str::to_string),
            instance: Some(instance),
            wave: Some(WaveMarker::first(job.wave_fingerprint(), phase)),
            suspended: false,
            repair_requested: false,
        });

        match out.create_task(&task).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists(_)) => {
                tracing::debug!(%task_id, "task already exists; will read it back next pass");
            }
            Err(err) => return Err(err.into()),
        }
        tracing::info!(job_id = %job.id, %task_id, targets = ?task.target, "claimed job");
        report.claimed.push(task_id);
        Ok(())
    }

    async fn correlate<C, S>(
        job: &MaintenanceJob,
        tracked: &mut Tracked,
        sequencer: &mut Sequencer,
        out: &mut Outbound<'_, C, S>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let phase = job
            .current_step
            .as_ref()
            .map_or(WavePhase::Started, |s| s.phase.into());
        tracked.data.job_id = Some(job.id.clone());
        tracked.data.instance = Some(sequencer.issue());
        tracked.data.wave = Some(WaveMarker::first(job.wave_fingerprint(), phase));
        tracked.task.apply_wave(job);
        tracked.task.transition(RepairTaskState::Preparing, now)?;
        save(out, tracked).await?;
        tracing::info!(job_id = %job.id, task_id = %tracked.task.task_id, "claimed task correlated with job");
        report.correlated.push(tracked.task.task_id.clone());
        report
            .transitions
            .push((tracked.task.task_id.clone(), RepairTaskState::Preparing));
        Ok(())
    }

    /// Park the task: flag it suspended once and leave its state alone.
    async fn hold<C, S>(
        job: &MaintenanceJob,
        tracked: Option<&mut Tracked>,
        out: &mut Outbound<'_, C, S>,
        report: &mut PassReport,
    ) -> Result<(), JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        report.held.push(job.id.clone());
        let Some(tracked) = tracked else {
            return Ok(());
        };
        if tracked.data.suspended || tracked.data.job_id.is_none() {
            return Ok(());
        }
        tracked.data.suspended = true;
        save(out, tracked).await?;
        tracing::info!(job_id = %job.id, task_id = %tracked.task.task_id, state = %tracked.task.state, "task parked");
        Ok(())
    }

    /// Returns `true` when the parked task can carry on with the job.
    ///
    /// A task continues if the wave is the one it was parked on, or if it is
    /// still Preparing and has approved nothing yet. Otherwise it is closed
    /// out and the next pass claims a fresh one.
    async fn resume<C, S>(
        job: &MaintenanceJob,
        tracked: &mut Tracked,
        out: &mut Outbound<'_, C, S>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<bool, JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let fingerprint = job.wave_fingerprint();
        let same_wave = tracked
            .data
            .wave
            .as_ref()
            .is_some_and(|w| w.fingerprint == fingerprint);

        if same_wave || tracked.task.state <= RepairTaskState::Preparing {
            tracked.data.suspended = false;
            save(out, tracked).await?;
            tracing::info!(job_id = %job.id, task_id = %tracked.task.task_id, "task resumed");
            return Ok(true);
        }

        tracing::info!(
            job_id = %job.id,
            task_id = %tracked.task.task_id,
            state = %tracked.task.state,
            %fingerprint,
            "wave changed while suspended; closing task"
        );
        walk(out, tracked, RepairTaskState::Completed, now, report).await?;
        Ok(false)
    }

    async fn drive_step<C, S>(
        job: &MaintenanceJob,
        tracked: &mut Tracked,
        out: &mut Outbound<'_, C, S>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        let Some(step) = job.current_step.as_ref().filter(|s| s.awaiting_ack()) else {
            return Ok(());
        };

        let fingerprint = job.wave_fingerprint();
        if let Some(marker) = tracked.data.next_wave(&fingerprint, step.phase.into()) {
            let previous = tracked.data.wave.as_ref().map(|w| w.ordinal);
            if previous.is_some_and(|p| p != marker.ordinal) {
                tracing::info!(
                    job_id = %job.id,
                    task_id = %tracked.task.task_id,
                    wave = marker.ordinal,
                    %fingerprint,
                    "new wave; task target overwritten"
                );
            }
            tracked.task.apply_wave(job);
            tracked.data.wave = Some(marker);
            save(out, tracked).await?;
        }

        walk(out, tracked, RepairTaskState::Executing, now, report).await?;
        out.acknowledge(&job.id, StepResponse::Approve, false).await?;
        tracing::info!(job_id = %job.id, phase = ?step.phase, "step acknowledged");
        report.acknowledged.push(job.id.clone());
        Ok(())
    }

    async fn complete_job<C, S>(
        &mut self,
        job: &MaintenanceJob,
        tracked: Option<&mut Tracked>,
        out: &mut Outbound<'_, C, S>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), JobError>
    where
        C: PolicyAgentChannel,
        S: RepairStore,
    {
        if let Some(tracked) = tracked {
            match tracked.task.state {
                RepairTaskState::Created => {
                    walk(out, tracked, RepairTaskState::Claimed, now, report).await?;
                    cancel(out, tracked, report).await?;
                }
                RepairTaskState::Claimed | RepairTaskState::Preparing => {
                    cancel(out, tracked, report).await?;
                }
                _ => walk(out, tracked, RepairTaskState::Completed, now, report).await?,
            }
        }

        if job.current_step.is_some() {
            out.acknowledge(&job.id, StepResponse::Approve, true).await?;
            report.acknowledged.push(job.id.clone());
        }
        self.holds.remove(&job.id);
        self.retired.insert(job.id.clone());
        tracing::info!(job_id = %job.id, "job completed and retired");
        report.retired.push(job.id.clone());
        Ok(())
    }
}
