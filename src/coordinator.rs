//! The coordinator: epoch fence, poll loop, and the administrative surface.
//!
//! A pass is: fetch snapshot, check liveness, drain queued commands,
//! reconcile, fold the pass's retry time into the failure budget. Exactly
//! one pass runs at a time. Commands and task outcome reports are only
//! queued by their handlers; the next pass consumes them.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::channel::PolicyAgentChannel;
use crate::command::{Command, OutcomeReport, QueuedCommand, TaskOutcome};
use crate::config::CoordinatorConfig;
use crate::error::{CommandError, CoordinatorError};
use crate::exit::{ExitLatch, ExitReason, ExitSignal};
use crate::liveness::{LivenessMonitor, LivenessVerdict};
use crate::model::{Sequencer, Snapshot};
use crate::outbound::{FailureBudget, Outbound};
use crate::policy::HoldReason;
use crate::reconciler::{JobReconciler, PassReport};
use crate::retry::RetryGate;
use crate::store::{RepairStore, TaskFilter};

const FAIL_FAST_DELAY: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Source of wall-clock time for liveness and claim bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Cancelled,
    Exited(ExitReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Reconciled(PassReport),
    /// No usable snapshot yet, or the feed is not trusted yet.
    Waiting,
    Exited(ExitReason),
}

/// Snapshot of the coordinator's bookkeeping, as returned by `GetCurrentState`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub epoch: Option<u32>,
    pub next_sequence: u32,
    pub last_incarnation: Option<u64>,
    pub trusted: bool,
    pub retired_jobs: Vec<String>,
    pub held_jobs: BTreeMap<String, HoldReason>,
    pub pending_commands: usize,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    epoch: Option<u32>,
    sequencer: Sequencer,
    last_snapshot: Option<Snapshot>,
    last_incarnation: Option<u64>,
    trusted: bool,
    retired_jobs: Vec<String>,
    held_jobs: BTreeMap<String, HoldReason>,
}

struct Engine {
    reconciler: JobReconciler,
    liveness: LivenessMonitor,
    budget: FailureBudget,
}

impl Engine {
    fn new(config: &CoordinatorConfig) -> Self {
        Self {
            reconciler: JobReconciler::new(&config.executor_name, config.orphan_claim_timeout()),
            liveness: LivenessMonitor::new(
                config.stall_window(),
                config.require_confirmed_incarnation_at_startup,
            ),
            budget: FailureBudget::new(config.failure_give_up()),
        }
    }
}

/// Clears the running flag however `run` returns.
struct RunningGuard<'a> {
    state: &'a Mutex<RunState>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        lock(self.state).running = false;
    }
}

pub struct Coordinator<C, S, X> {
    config: CoordinatorConfig,
    channel: C,
    store: S,
    latch: Arc<ExitLatch<X>>,
    gate: RetryGate,
    clock: Arc<dyn Clock>,
    state: Mutex<RunState>,
    pending: Mutex<Vec<QueuedCommand>>,
    engine: tokio::sync::Mutex<Engine>,
}

async fn bounded<T>(
    timeout: Duration,
    token: &CancellationToken,
    work: impl Future<Output = Result<T, CommandError>>,
) -> Result<T, CommandError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CommandError::Cancelled),
        result = tokio::time::timeout(timeout, work) => result.map_err(|_| CommandError::Timeout)?,
    }
}

impl<C, S, X> Coordinator<C, S, X>
where
    C: PolicyAgentChannel,
    S: RepairStore,
    X: ExitSignal + 'static,
{
    pub fn new(config: CoordinatorConfig, channel: C, store: S, exit: X) -> Self {
        let engine = Engine::new(&config);
        Self {
            gate: RetryGate::new(config.retry_policy()),
            config,
            channel,
            store,
            latch: Arc::new(ExitLatch::new(exit)),
            clock: Arc::new(SystemClock),
            state: Mutex::new(RunState::default()),
            pending: Mutex::new(Vec::new()),
            engine: tokio::sync::Mutex::new(engine),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = lock(&self.state);
        CoordinatorStatus {
            running: state.running,
            epoch: state.epoch,
            next_sequence: state.sequencer.peek(),
            last_incarnation: state.last_incarnation,
            trusted: state.trusted,
            retired_jobs: state.retired_jobs.clone(),
            held_jobs: state.held_jobs.clone(),
            pending_commands: lock(&self.pending).len(),
            exit_reason: self.latch.reason(),
        }
    }

    /// Run the poll loop until `token` is cancelled or the process is asked to exit.
    ///
    /// `epoch` must never go backwards across calls. The task sequence counter
    /// restarts only when the epoch strictly increases.
    pub async fn run(
        &self,
        epoch: u32,
        token: &CancellationToken,
    ) -> Result<RunOutcome, CoordinatorError> {
        let promoted = {
            let mut state = lock(&self.state);
            if state.running {
                return Err(CoordinatorError::AlreadyRunning(state.epoch.unwrap_or_default()));
            }
            let promoted = match state.epoch {
                Some(current) if epoch < current => {
                    return Err(CoordinatorError::EpochRegressed {
                        current,
                        requested: epoch,
                    });
                }
                Some(current) => epoch > current,
                None => true,
            };
            if promoted {
                state.epoch = Some(epoch);
                state.sequencer = Sequencer::new(epoch);
            }
            state.running = true;
            promoted
        };
        let _guard = RunningGuard { state: &self.state };

        if promoted {
            *self.engine.lock().await = Engine::new(&self.config);
        }
        tracing::info!(epoch, promoted, "coordinator running");

        loop {
            if let Some(reason) = self.latch.reason() {
                return Ok(RunOutcome::Exited(reason));
            }
            if token.is_cancelled() {
                break;
            }
            if let PassOutcome::Exited(reason) = self.poll_once(token).await {
                return Ok(RunOutcome::Exited(reason));
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.latch.fired() => {}
                _ = sleep(self.config.poll_interval()) => {}
            }
        }
        // The exit signal may be what cancelled the token.
        if let Some(reason) = self.latch.reason() {
            return Ok(RunOutcome::Exited(reason));
        }
        tracing::info!(epoch, "coordinator cancelled");
        Ok(RunOutcome::Cancelled)
    }

    /// One fetch / liveness / reconcile pass.
    pub async fn poll_once(&self, token: &CancellationToken) -> PassOutcome {
        if let Some(reason) = self.latch.reason() {
            return PassOutcome::Exited(reason);
        }
        let mut engine = self.engine.lock().await;
        let mut out = Outbound::new(&self.channel, &self.store, &self.gate, token);
        let now = self.clock.now();

        let fetched = out.fetch_snapshot().await;
        let verdict = match &fetched {
            Ok(snapshot) => engine.liveness.observe(snapshot.incarnation, now),
            Err(err) => {
                tracing::warn!(error = %err, "snapshot fetch failed");
                engine.liveness.observe_failure(now)
            }
        };
        let trusted = match verdict {
            LivenessVerdict::Stalled(reason) => return self.exit(reason),
            LivenessVerdict::Healthy { trusted } => trusted,
        };

        let outcome = match fetched {
            Ok(snapshot) if trusted && !snapshot.is_empty() => {
                let commands = std::mem::take(&mut *lock(&self.pending));
                let mut sequencer = lock(&self.state).sequencer;
                let report = engine
                    .reconciler
                    .reconcile(&snapshot, commands, &mut sequencer, &mut out, now)
                    .await;
                let mut state = lock(&self.state);
                state.sequencer = sequencer;
                state.last_snapshot = Some(snapshot);
                PassOutcome::Reconciled(report)
            }
            Ok(snapshot) => {
                tracing::debug!(
                    trusted,
                    incarnation = ?snapshot.incarnation,
                    "waiting for a usable snapshot"
                );
                if !snapshot.is_empty() {
                    lock(&self.state).last_snapshot = Some(snapshot);
                }
                PassOutcome::Waiting
            }
            Err(_) => PassOutcome::Waiting,
        };

        if let Some(reason) = engine.budget.settle(&out.ledger()) {
            return self.exit(reason);
        }
        self.publish(&engine);
        outcome
    }

    fn exit(&self, reason: ExitReason) -> PassOutcome {
        self.latch.fire(reason.clone());
        PassOutcome::Exited(self.latch.reason().unwrap_or(reason))
    }

    fn publish(&self, engine: &Engine) {
        let mut state = lock(&self.state);
        state.last_incarnation = engine.liveness.last_incarnation();
        state.trusted = engine.liveness.is_trusted();
        state.retired_jobs = engine.reconciler.retired_jobs();
        state.held_jobs = engine
            .reconciler
            .holds()
            .iter()
            .map(|(job, reason)| (job.clone(), reason.clone()))
            .collect();
    }

    fn queue(&self, command: QueuedCommand) {
        tracing::info!(?command, "command queued for next pass");
        lock(&self.pending).push(command);
    }

    /// Reject a job id only when the last snapshot is known not to contain it.
    fn check_job(&self, job_id: &str) -> Result<(), CommandError> {
        let state = lock(&self.state);
        match &state.last_snapshot {
            Some(snapshot) if snapshot.job(job_id).is_none() => {
                Err(CommandError::JobNotFound(job_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Execute an administrative `Name[:args]` command.
    pub async fn run_command(
        &self,
        is_admin: bool,
        text: &str,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<String, CommandError> {
        bounded(timeout, token, async {
            let command = Command::parse(is_admin, text)?;
            self.execute(command)
        })
        .await
    }

    fn execute(&self, command: Command) -> Result<String, CommandError> {
        match command {
            Command::RequestSuspend { job_id } => {
                self.check_job(&job_id)?;
                self.queue(QueuedCommand::Suspend {
                    job_id: job_id.clone(),
                });
                Ok(format!("suspend of {job_id} queued"))
            }
            Command::RequestResume { job_id } => {
                self.check_job(&job_id)?;
                self.queue(QueuedCommand::Resume {
                    job_id: job_id.clone(),
                });
                Ok(format!("resume of {job_id} queued"))
            }
            Command::RequestMaintenance {
                role_instance,
                action,
            } => {
                let reply = format!("{action} of {role_instance} queued");
                self.queue(QueuedCommand::Maintenance {
                    role_instance,
                    action,
                });
                Ok(reply)
            }
            Command::FailFast => {
                let latch = Arc::clone(&self.latch);
                tokio::spawn(async move {
                    sleep(FAIL_FAST_DELAY).await;
                    latch.fire(ExitReason::FailFast);
                });
                Ok(format!("exiting in {}s", FAIL_FAST_DELAY.as_secs()))
            }
            Command::GetCurrentState => serde_json::to_string_pretty(&self.status())
                .map_err(|e| CommandError::Render(e.to_string())),
            Command::GetJobs => {
                let jobs = lock(&self.state)
                    .last_snapshot
                    .as_ref()
                    .map(|s| s.jobs.clone())
                    .unwrap_or_default();
                serde_json::to_string_pretty(&jobs).map_err(|e| CommandError::Render(e.to_string()))
            }
        }
    }

    /// Record what an external executor reports about a task. The task must
    /// exist; the listing is retry-gated like any other store call. The report
    /// itself is checked against the task's instance on a later pass.
    pub async fn report_task_outcome(
        &self,
        task_id: &str,
        instance: i64,
        outcome: TaskOutcome,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<(), CommandError> {
        bounded(timeout, token, async {
            let mut out = Outbound::new(&self.channel, &self.store, &self.gate, token);
            match out
                .list_tasks(&TaskFilter::executor(&self.config.executor_name))
                .await
            {
                Ok(tasks) if !tasks.iter().any(|t| t.task_id == task_id) => {
                    return Err(CommandError::TaskNotFound(task_id.to_string()));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(task_id, error = %err, "could not verify task; report queued anyway");
                }
            }
            self.queue(QueuedCommand::Outcome(OutcomeReport {
                task_id: task_id.to_string(),
                instance,
                outcome,
            }));
            Ok(())
        })
        .await
    }
}
