//! Cenários embutidos executados contra o plano de controle em memória.
//!
//! Cada cenário monta um coordenador novo com um relógio manual, altera o
//! feed entre passes e imprime o resultado de cada passe.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::command::TaskOutcome;
use crate::config::CoordinatorConfig;
use crate::coordinator::{Clock, Coordinator, PassOutcome};
use crate::memory::{InMemoryChannel, InMemoryStore, ManualClock, RecordingExit};
use crate::model::{
    AckState, ImpactLevel, ImpactedInstance, JobStatus, JobStep, MaintenanceJob, RepairTask,
    StepPhase,
};
use crate::ui::PassProgress;

type DemoCoordinator = Coordinator<InMemoryChannel, InMemoryStore, RecordingExit>;

struct Scenario {
    channel: InMemoryChannel,
    store: InMemoryStore,
    clock: Arc<ManualClock>,
    coordinator: DemoCoordinator,
    exit: RecordingExit,
    token: CancellationToken,
    progress: PassProgress,
}

impl Scenario {
    fn new(title: &str, config: &CoordinatorConfig) -> Self {
        let channel = InMemoryChannel::new();
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let exit = RecordingExit::default();
        let coordinator = Coordinator::new(config.clone(), channel.clone(), store.clone(), exit.clone())
            .with_clock(clock.clone());
        Self {
            channel,
            store,
            clock,
            coordinator,
            exit,
            token: CancellationToken::new(),
            progress: PassProgress::start(title),
        }
    }

    async fn pass_after(&mut self, secs: u64) -> PassOutcome {
        self.clock.advance(Duration::from_secs(secs));
        let outcome = self.coordinator.poll_once(&self.token).await;
        self.progress.pass(&outcome);
        outcome
    }

    async fn command(&self, text: &str) -> Result<String> {
        let reply = self
            .coordinator
            .run_command(true, text, Duration::from_secs(5), &self.token)
            .await?;
        self.progress.step(&format!("{text}: {reply}"));
        Ok(reply)
    }

    /// Resume o que o plano de controle recebeu e o caminho de cada tarefa.
    fn finish(self) {
        for ack in self.channel.acks() {
            let deleted = if ack.delete_step_if_present { " (step deleted)" } else { "" };
            self.progress
                .step(&format!("ack {} {:?}{deleted}", ack.job_id, ack.response));
        }
        for repair in self.channel.repairs() {
            self.progress
                .step(&format!("repair {} on {}", repair.action, repair.role_instance));
        }
        for (job_id, change) in self.channel.status_changes() {
            self.progress.step(&format!("status {change:?} for {job_id}"));
        }
        for reason in self.exit.reasons() {
            self.progress.step(&format!("exit signalled: {reason}"));
        }

        let mut tasks = self.store.tasks();
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let paths: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let history = self.store.history(&task.task_id);
                (task, history)
            })
            .collect();
        self.progress.finish(&paths);
    }
}

fn set_wave(job: &mut MaintenanceJob, phase: StepPhase, ud: u32, instances: &[&str]) {
    job.impacted_role_instances = instances.iter().map(|s| s.to_string()).collect();
    job.current_step = Some(JobStep {
        phase,
        ack_state: AckState::AwaitingAck,
        response_deadline: None,
        impacted_instances: instances
            .iter()
            .map(|name| ImpactedInstance {
                instance: name.to_string(),
                update_domain: ud,
                impact: ImpactLevel::Reboot,
            })
            .collect(),
    });
}

fn wave_job(id: &str, ud: u32, instances: &[&str]) -> MaintenanceJob {
    let mut job = MaintenanceJob::new(id, JobStatus::Executing);
    set_wave(&mut job, StepPhase::WaveStarted, ud, instances);
    job
}

/// Executa todos os cenários em sequência.
pub async fn run_all(base: &CoordinatorConfig) -> Result<()> {
    let config = CoordinatorConfig {
        orphan_claim_timeout_secs: 15,
        max_incarnation_stall_secs: 60,
        retry_backoff_ms: 1,
        ..base.clone()
    };

    single_wave(&config).await;
    multi_wave(&config).await;
    administrator_task(&config).await?;
    orphaned_claim(&config).await;
    admin_suspend(&config).await?;
    failed_task(&config).await?;
    stalled_feed(&config).await;
    Ok(())
}

async fn single_wave(config: &CoordinatorConfig) {
    let mut s = Scenario::new("single-wave job", config);
    s.channel.upsert_job(wave_job("J1", 0, &["R0", "R1"]));
    s.pass_after(0).await;
    s.pass_after(10).await;
    s.channel.update_job("J1", |job| {
        job.status = JobStatus::Completed;
        set_wave(job, StepPhase::WaveEnded, 0, &["R0", "R1"]);
    });
    s.progress.step("J1 completed by the platform");
    s.pass_after(10).await;
    s.pass_after(10).await;
    s.finish();
}

async fn multi_wave(config: &CoordinatorConfig) {
    let mut s = Scenario::new("multi-wave job", config);
    s.channel.upsert_job(wave_job("J2", 0, &["R0", "R1"]));
    s.pass_after(0).await;
    s.pass_after(10).await;
    s.channel
        .update_job("J2", |job| set_wave(job, StepPhase::WaveEnded, 0, &["R0", "R1"]));
    s.progress.step("wave 1 ended");
    s.pass_after(10).await;
    s.channel
        .update_job("J2", |job| set_wave(job, StepPhase::WaveStarted, 1, &["R2", "R3"]));
    s.progress.step("wave 2 started on R2,R3");
    s.pass_after(10).await;
    s.channel.update_job("J2", |job| job.status = JobStatus::Completed);
    s.progress.step("J2 completed by the platform");
    s.pass_after(10).await;
    s.finish();
}

async fn administrator_task(config: &CoordinatorConfig) -> Result<()> {
    let mut s = Scenario::new("administrator repair task", config);
    let mut admin = RepairTask::new("rt1", &config.executor_name, "Reboot", s.clock.now());
    admin.target = vec!["NodeA".into()];
    s.store.insert(admin);
    s.progress.step("rt1 created by an administrator for NodeA");
    s.channel.fail_next_calls(config.retry_max_attempts);
    s.progress.step("control plane rejects the first repair request");
    s.pass_after(0).await;
    s.pass_after(5).await;

    let token = s
        .channel
        .repairs()
        .first()
        .and_then(|r| r.context_token.clone())
        .context("repair request carried no context token")?;
    let mut job = wave_job("J9", 0, &["NodeA"]);
    job.context_token = Some(token);
    s.channel.upsert_job(job);
    s.progress.step("platform opened J9 for the request");
    s.pass_after(5).await;
    s.pass_after(5).await;
    s.channel.update_job("J9", |job| job.status = JobStatus::Completed);
    s.pass_after(5).await;
    s.finish();
    Ok(())
}

async fn orphaned_claim(config: &CoordinatorConfig) {
    let mut s = Scenario::new("orphaned claim", config);
    let mut admin = RepairTask::new("rt2", &config.executor_name, "ReimageOS", s.clock.now());
    admin.target = vec!["NodeB".into()];
    s.store.insert(admin);
    s.pass_after(0).await;
    s.progress.step("no job ever references the claim");
    s.pass_after(10).await;
    s.pass_after(5).await;
    s.finish();
}

async fn admin_suspend(config: &CoordinatorConfig) -> Result<()> {
    let mut s = Scenario::new("administrative suspend and resume", config);
    s.channel.upsert_job(wave_job("J3", 0, &["R0"]));
    s.pass_after(0).await;
    s.command("RequestSuspend:J3").await?;
    s.pass_after(10).await;
    s.pass_after(10).await;
    s.command("RequestResume:J3").await?;
    s.pass_after(10).await;
    s.pass_after(10).await;
    s.progress.print_status(&s.coordinator.status());
    s.finish();
    Ok(())
}

async fn failed_task(config: &CoordinatorConfig) -> Result<()> {
    let mut s = Scenario::new("failed repair task", config);
    s.channel.upsert_job(wave_job("J4", 0, &["R0"]));
    s.pass_after(0).await;

    let task = s
        .store
        .tasks()
        .into_iter()
        .next()
        .context("J4 was not claimed")?;
    let instance = task
        .decode_data()
        .ok()
        .and_then(|data| data.instance)
        .context("claimed task carries no instance")?;
    s.coordinator
        .report_task_outcome(&task.task_id, instance, TaskOutcome::Failed, Duration::from_secs(5), &s.token)
        .await?;
    s.progress.step("executor reports the task failed");
    s.store.fail_next_calls(config.retry_max_attempts);
    s.progress.step("repair store unavailable for one pass");
    s.pass_after(10).await;
    s.pass_after(10).await;
    s.command("RequestResume:J4").await?;
    s.pass_after(10).await;
    s.pass_after(10).await;
    s.finish();
    Ok(())
}

async fn stalled_feed(config: &CoordinatorConfig) {
    let mut s = Scenario::new("stalled feed", config);
    s.pass_after(0).await;
    s.progress.step("incarnation frozen");
    s.pass_after(30).await;
    if let PassOutcome::Exited(_) = s.pass_after(30).await {
        s.progress.step("host would restart the process now");
    }
    s.finish();
}
