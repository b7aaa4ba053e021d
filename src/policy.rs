//! Gates applied before the reconciler advances a job's repair task.
//!
//! Each policy looks at one job and returns a verdict; `PolicyChain` folds
//! them in a fixed order and the first verdict that is not `Proceed` wins.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::model::{JobStatus, MaintenanceJob};

/// Why the coordinator itself is holding a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HoldReason {
    AdminSuspend,
    TaskFailed { task_id: String },
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldReason::AdminSuspend => write!(f, "suspended by administrator"),
            HoldReason::TaskFailed { task_id } => write!(f, "task {task_id} reported failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    /// Keep bookkeeping current but do not advance the task.
    Hold(String),
    /// Leave the job alone for this pass.
    Skip(String),
}

impl Verdict {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Verdict::Proceed)
    }
}

pub struct PolicyContext<'a> {
    pub job: &'a MaintenanceJob,
    pub holds: &'a HashMap<String, HoldReason>,
}

pub trait TransitionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, ctx: &PolicyContext<'_>) -> Verdict;
}

/// Local holds placed by an administrator or by a failed task report.
/// Completion is never held back.
pub struct LocalHoldPolicy;

impl TransitionPolicy for LocalHoldPolicy {
    fn name(&self) -> &'static str {
        "local_hold"
    }

    fn apply(&self, ctx: &PolicyContext<'_>) -> Verdict {
        if ctx.job.status == JobStatus::Completed {
            return Verdict::Proceed;
        }
        match ctx.holds.get(&ctx.job.id) {
            Some(reason) => Verdict::Hold(reason.to_string()),
            None => Verdict::Proceed,
        }
    }
}

pub struct JobSuspendedPolicy;

impl TransitionPolicy for JobSuspendedPolicy {
    fn name(&self) -> &'static str {
        "job_suspended"
    }

    fn apply(&self, ctx: &PolicyContext<'_>) -> Verdict {
        if ctx.job.status == JobStatus::Suspended {
            Verdict::Hold("job suspended by control plane".into())
        } else {
            Verdict::Proceed
        }
    }
}

/// A step naming instances outside the job's impacted set cannot be mapped
/// to the tracked task; wait for the next snapshot.
pub struct ImpactMappingPolicy;

impl TransitionPolicy for ImpactMappingPolicy {
    fn name(&self) -> &'static str {
        "impact_mapping"
    }

    fn apply(&self, ctx: &PolicyContext<'_>) -> Verdict {
        let job = ctx.job;
        if job.status != JobStatus::Executing || job.impacted_role_instances.is_empty() {
            return Verdict::Proceed;
        }
        let unmapped = job.unmapped_step_instances();
        if unmapped.is_empty() {
            Verdict::Proceed
        } else {
            Verdict::Skip(format!("step references unmapped instances: {}", unmapped.join(",")))
        }
    }
}

pub struct PolicyChain {
    policies: Vec<Box<dyn TransitionPolicy>>,
}

impl Default for PolicyChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(LocalHoldPolicy),
            Box::new(JobSuspendedPolicy),
            Box::new(ImpactMappingPolicy),
        ])
    }
}

impl PolicyChain {
    pub fn new(policies: Vec<Box<dyn TransitionPolicy>>) -> Self {
        Self { policies }
    }

    pub fn evaluate(&self, ctx: &PolicyContext<'_>) -> Verdict {
        for policy in &self.policies {
            let verdict = policy.apply(ctx);
            if !verdict.is_proceed() {
                tracing::debug!(job_id = %ctx.job.id, policy = policy.name(), ?verdict, "policy stopped job");
                return verdict;
            }
        }
        Verdict::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AckState, ImpactLevel, ImpactedInstance, JobStep, StepPhase};

    fn job_with_step(status: JobStatus, role_instances: &[&str], step: &[&str]) -> MaintenanceJob {
        let mut job = MaintenanceJob::new("J1", status);
        job.impacted_role_instances = role_instances.iter().map(|s| s.to_string()).collect();
        job.current_step = Some(JobStep {
            phase: StepPhase::WaveStarted,
            ack_state: AckState::AwaitingAck,
            response_deadline: None,
            impacted_instances: step
                .iter()
                .map(|s| ImpactedInstance {
                    instance: s.to_string(),
                    update_domain: 0,
                    impact: ImpactLevel::Reboot,
                })
                .collect(),
        });
        job
    }

    #[test]
    fn executing_job_without_holds_proceeds() {
        let job = job_with_step(JobStatus::Executing, &["R0", "R1"], &["R0", "R1"]);
        let holds = HashMap::new();
        let verdict = PolicyChain::default().evaluate(&PolicyContext { job: &job, holds: &holds });
        assert_eq!(verdict, Verdict::Proceed);
    }

    #[test]
    fn local_hold_wins_over_later_policies() {
        let job = job_with_step(JobStatus::Suspended, &["R0"], &["R9"]);
        let holds = HashMap::from([("J1".to_string(), HoldReason::AdminSuspend)]);
        let verdict = PolicyChain::default().evaluate(&PolicyContext { job: &job, holds: &holds });
        assert_eq!(verdict, Verdict::Hold("suspended by administrator".into()));
    }

    #[test]
    fn completed_job_ignores_local_hold() {
        let job = job_with_step(JobStatus::Completed, &["R0"], &["R0"]);
        let holds = HashMap::from([(
            "J1".to_string(),
            HoldReason::TaskFailed {
                task_id: "t".into(),
            },
        )]);
        let verdict = PolicyChain::default().evaluate(&PolicyContext { job: &job, holds: &holds });
        assert!(verdict.is_proceed());
    }

    #[test]
    fn suspended_job_is_held() {
        let job = job_with_step(JobStatus::Suspended, &["R0"], &["R0"]);
        let holds = HashMap::new();
        let verdict = PolicyChain::default().evaluate(&PolicyContext { job: &job, holds: &holds });
        assert!(matches!(verdict, Verdict::Hold(_)));
    }

    #[test]
    fn unmapped_step_instances_skip_the_job() {
        let job = job_with_step(JobStatus::Executing, &["R0", "R1"], &["R0", "R7"]);
        let holds = HashMap::new();
        let verdict = PolicyChain::default().evaluate(&PolicyContext { job: &job, holds: &holds });
        assert_eq!(
            verdict,
            Verdict::Skip("step references unmapped instances: R7".into())
        );
    }
}
