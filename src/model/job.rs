use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a maintenance job as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Executing,
    Suspended,
    Completed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Executing => write!(f, "Executing"),
            JobStatus::Suspended => write!(f, "Suspended"),
            JobStatus::Completed => write!(f, "Completed"),
        }
    }
}

/// Whether the current wave is about to start or has just ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPhase {
    WaveStarted,
    WaveEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckState {
    AwaitingAck,
    Acknowledged,
}

/// Expected impact of a wave on a single role instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImpactLevel {
    None,
    Restart,
    Reboot,
    ReimageOs,
    DataLoss,
}

/// Who initiated the maintenance and what kind it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    TenantInitiated,
    PlatformInitiated,
    /// Root/platform-update jobs may revisit waves that were already processed.
    PlatformUpdate,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::TenantInitiated => write!(f, "TenantInitiated"),
            ActionKind::PlatformInitiated => write!(f, "PlatformInitiated"),
            ActionKind::PlatformUpdate => write!(f, "PlatformUpdate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactedInstance {
    pub instance: String,
    pub update_domain: u32,
    pub impact: ImpactLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactClassification {
    pub action: ActionKind,
    #[serde(default)]
    pub affects_compute: bool,
    #[serde(default)]
    pub affects_disk: bool,
    #[serde(default)]
    pub affects_network: bool,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
}

impl Default for ImpactClassification {
    fn default() -> Self {
        Self {
            action: ActionKind::PlatformInitiated,
            affects_compute: false,
            affects_disk: false,
            affects_network: false,
            estimated_duration_secs: None,
        }
    }
}

/// The step the control plane is currently waiting on. Its instance set
/// always describes the current wave only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStep {
    pub phase: StepPhase,
    pub ack_state: AckState,
    #[serde(default)]
    pub response_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub impacted_instances: Vec<ImpactedInstance>,
}

impl JobStep {
    pub fn awaiting_ack(&self) -> bool {
        self.ack_state == AckState::AwaitingAck
    }

    /// Lowest update domain touched by this step, if any instance is listed.
    pub fn update_domain(&self) -> Option<u32> {
        self.impacted_instances.iter().map(|i| i.update_domain).min()
    }
}

/// A maintenance job announced by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceJob {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub impacted_role_instances: Vec<String>,
    /// Set only when the coordinator originated the job via a repair request.
    #[serde(default)]
    pub context_token: Option<String>,
    #[serde(default)]
    pub current_step: Option<JobStep>,
    #[serde(default)]
    pub classification: ImpactClassification,
}

impl MaintenanceJob {
    pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            impacted_role_instances: Vec::new(),
            context_token: None,
            current_step: None,
            classification: ImpactClassification::default(),
        }
    }

    pub fn context_token(&self) -> Option<&str> {
        self.context_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Instances of the current wave: the step's set when a step is present,
    /// otherwise the job-level list.
    pub fn wave_instances(&self) -> Vec<String> {
        match &self.current_step {
            Some(step) if !step.impacted_instances.is_empty() => step
                .impacted_instances
                .iter()
                .map(|i| i.instance.clone())
                .collect(),
            _ => self.impacted_role_instances.clone(),
        }
    }

    /// Deterministic identity of the current wave: `ud<N>:<sorted instances>`.
    pub fn wave_fingerprint(&self) -> String {
        let mut instances = self.wave_instances();
        instances.sort();
        instances.dedup();
        let ud = self
            .current_step
            .as_ref()
            .and_then(JobStep::update_domain)
            .map(|ud| ud.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("ud{ud}:{}", instances.join(","))
    }

    /// Step instances that do not appear in the job's impacted role instances.
    pub fn unmapped_step_instances(&self) -> Vec<&str> {
        let Some(step) = &self.current_step else {
            return Vec::new();
        };
        step.impacted_instances
            .iter()
            .map(|i| i.instance.as_str())
            .filter(|name| !self.impacted_role_instances.iter().any(|r| r == name))
            .collect()
    }
}

impl fmt::Display for MaintenanceJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.status)?;
        if let Some(step) = &self.current_step {
            write!(f, " {:?}/{:?}", step.phase, step.ack_state)?;
        }
        write!(f, " {}", self.wave_fingerprint())
    }
}

/// One poll of the job feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Feed-level incarnation; `None` means the feed had nothing to report.
    #[serde(default)]
    pub incarnation: Option<u64>,
    #[serde(default)]
    pub job_document_incarnation: Option<u64>,
    #[serde(default)]
    pub jobs: Vec<MaintenanceJob>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.incarnation.is_none()
    }

    pub fn job(&self, id: &str) -> Option<&MaintenanceJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_with_context_token(&self, token: &str) -> Option<&MaintenanceJob> {
        self.jobs.iter().find(|j| j.context_token() == Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(phase: StepPhase, instances: &[(&str, u32)]) -> JobStep {
        JobStep {
            phase,
            ack_state: AckState::AwaitingAck,
            response_deadline: None,
            impacted_instances: instances
                .iter()
                .map(|(name, ud)| ImpactedInstance {
                    instance: name.to_string(),
                    update_domain: *ud,
                    impact: ImpactLevel::Reboot,
                })
                .collect(),
        }
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let mut a = MaintenanceJob::new("J1", JobStatus::Executing);
        a.current_step = Some(step(StepPhase::WaveStarted, &[("R1", 0), ("R0", 0)]));
        let mut b = a.clone();
        b.current_step = Some(step(StepPhase::WaveStarted, &[("R0", 0), ("R1", 0)]));
        assert_eq!(a.wave_fingerprint(), "ud0:R0,R1");
        assert_eq!(a.wave_fingerprint(), b.wave_fingerprint());
    }

    #[test]
    fn fingerprint_falls_back_to_role_instances() {
        let mut job = MaintenanceJob::new("J1", JobStatus::Executing);
        job.impacted_role_instances = vec!["R3".into(), "R2".into()];
        assert_eq!(job.wave_fingerprint(), "ud-:R2,R3");
    }

    #[test]
    fn unmapped_instances_are_reported() {
        let mut job = MaintenanceJob::new("J1", JobStatus::Executing);
        job.impacted_role_instances = vec!["R0".into()];
        job.current_step = Some(step(StepPhase::WaveStarted, &[("R0", 0), ("R9", 0)]));
        assert_eq!(job.unmapped_step_instances(), vec!["R9"]);
    }

    #[test]
    fn empty_context_token_is_ignored() {
        let mut job = MaintenanceJob::new("J1", JobStatus::Executing);
        job.context_token = Some(String::new());
        assert!(job.context_token().is_none());
    }

    #[test]
    fn snapshot_without_incarnation_is_empty() {
        let snapshot: Snapshot = serde_json::from_str(r#"{"jobs": []}"#).unwrap();
        assert!(snapshot.is_empty());
    }
}
