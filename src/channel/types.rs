use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the coordinator answers a job step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepResponse {
    /// The cluster is ready for the step to proceed.
    Approve,
    /// The step cannot proceed; the reason is surfaced to the control plane.
    Reject { reason: String },
}

/// Maintenance actions an administrator may request for a role instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairAction {
    Reboot,
    ReimageOs,
    FullReimage,
    HostReboot,
    HostRepaveData,
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairAction::Reboot => write!(f, "Reboot"),
            RepairAction::ReimageOs => write!(f, "ReimageOS"),
            RepairAction::FullReimage => write!(f, "FullReimage"),
            RepairAction::HostReboot => write!(f, "HostReboot"),
            RepairAction::HostRepaveData => write!(f, "HostRepaveData"),
        }
    }
}

impl FromStr for RepairAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reboot" => Ok(RepairAction::Reboot),
            "reimageos" => Ok(RepairAction::ReimageOs),
            "fullreimage" => Ok(RepairAction::FullReimage),
            "hostreboot" => Ok(RepairAction::HostReboot),
            "hostrepavedata" => Ok(RepairAction::HostRepaveData),
            other => Err(format!("unknown repair action: {other}")),
        }
    }
}

/// Status change the coordinator may ask the control plane to make on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusChange {
    Suspend,
    Resume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub response: StepResponse,
    pub delete_step_if_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRequest {
    pub role_instance: String,
    pub action: RepairAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeRequest {
    pub change: StatusChange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_action_parses_case_insensitively() {
        assert_eq!("Reboot".parse::<RepairAction>().unwrap(), RepairAction::Reboot);
        assert_eq!("reimageOS".parse::<RepairAction>().unwrap(), RepairAction::ReimageOs);
        assert!("Explode".parse::<RepairAction>().is_err());
    }

    #[test]
    fn repair_action_display_matches_parse() {
        for action in [
            RepairAction::Reboot,
            RepairAction::ReimageOs,
            RepairAction::FullReimage,
            RepairAction::HostReboot,
            RepairAction::HostRepaveData,
        ] {
            assert_eq!(action.to_string().parse::<RepairAction>().unwrap(), action);
        }
    }

    #[test]
    fn step_response_wire_format() {
        let json = serde_json::to_string(&StepResponse::Reject {
            reason: "health check failed".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"reject","reason":"health check failed"}"#);
        assert_eq!(
            serde_json::to_string(&StepResponse::Approve).unwrap(),
            r#"{"kind":"approve"}"#
        );
    }

    #[test]
    fn repair_request_omits_missing_token() {
        let req = RepairRequest {
            role_instance: "NodeA".into(),
            action: RepairAction::Reboot,
            context_token: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("context_token"));
    }
}
