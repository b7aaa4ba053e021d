//! Administrative command surface: `Name[:args]` text commands.

use serde::{Deserialize, Serialize};

use crate::channel::RepairAction;
use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Admin,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    RequestSuspend,
    RequestResume,
    RequestMaintenance,
    FailFast,
    GetCurrentState,
    GetJobs,
}

const COMMANDS: &[(&str, CommandKind, Access)] = &[
    ("RequestSuspend", CommandKind::RequestSuspend, Access::Admin),
    ("RequestResume", CommandKind::RequestResume, Access::Admin),
    ("RequestMaintenance", CommandKind::RequestMaintenance, Access::Admin),
    ("FailFast", CommandKind::FailFast, Access::Admin),
    ("GetCurrentState", CommandKind::GetCurrentState, Access::User),
    ("GetJobs", CommandKind::GetJobs, Access::User),
];

/// A parsed administrative command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RequestSuspend { job_id: String },
    RequestResume { job_id: String },
    RequestMaintenance {
        role_instance: String,
        action: RepairAction,
    },
    FailFast,
    GetCurrentState,
    GetJobs,
}

impl Command {
    /// Parse `Name[:args]`. Names match case-insensitively.
    pub fn parse(is_admin: bool, text: &str) -> Result<Self, CommandError> {
        let text = text.trim();
        let (name, args) = match text.split_once(':') {
            Some((name, args)) => (name.trim(), Some(args.trim())),
            None => (text, None),
        };

        let (canonical, kind, _) = COMMANDS
            .iter()
            .find(|(n, _, access)| {
                n.eq_ignore_ascii_case(name) && (is_admin || *access == Access::User)
            })
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;

        let invalid = |reason: &str| CommandError::InvalidArguments {
            command: canonical.to_string(),
            reason: reason.to_string(),
        };
        let required = |args: Option<&str>| -> Result<String, CommandError> {
            args.filter(|a| !a.is_empty())
                .map(str::to_string)
                .ok_or_else(|| invalid("missing job id"))
        };

        match kind {
            CommandKind::RequestSuspend => Ok(Command::RequestSuspend {
                job_id: required(args)?,
            }),
            CommandKind::RequestResume => Ok(Command::RequestResume {
                job_id: required(args)?,
            }),
            CommandKind::RequestMaintenance => {
                let (instance, action) = args
                    .and_then(|a| a.split_once(':'))
                    .ok_or_else(|| invalid("expected <roleInstance>:<action>"))?;
                let instance = instance.trim();
                if instance.is_empty() {
                    return Err(invalid("empty role instance"));
                }
                let action = action.trim().parse::<RepairAction>().map_err(|e| invalid(&e))?;
                Ok(Command::RequestMaintenance {
                    role_instance: instance.to_string(),
                    action,
                })
            }
            CommandKind::FailFast => Ok(Command::FailFast),
            CommandKind::GetCurrentState => Ok(Command::GetCurrentState),
            CommandKind::GetJobs => Ok(Command::GetJobs),
        }
    }
}

/// What an external executor reports about a task's maintenance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Started,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeReport {
    pub task_id: String,
    pub instance: i64,
    pub outcome: TaskOutcome,
}

/// Work accepted from the command surface, consumed at the start of the next pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedCommand {
    Suspend { job_id: String },
    Resume { job_id: String },
    Maintenance {
        role_instance: String,
        action: RepairAction,
    },
    Outcome(OutcomeReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_admin_commands() {
        assert_eq!(
            Command::parse(true, "RequestSuspend:J1").unwrap(),
            Command::RequestSuspend {
                job_id: "J1".into()
            }
        );
        assert_eq!(
            Command::parse(true, "requestresume: J1 ").unwrap(),
            Command::RequestResume {
                job_id: "J1".into()
            }
        );
        assert_eq!(
            Command::parse(true, "RequestMaintenance:NodeA:reimageos").unwrap(),
            Command::RequestMaintenance {
                role_instance: "NodeA".into(),
                action: RepairAction::ReimageOs,
            }
        );
        assert_eq!(Command::parse(true, "FailFast").unwrap(), Command::FailFast);
    }

    #[test]
    fn non_admin_sees_admin_commands_as_unknown() {
        assert_eq!(
            Command::parse(false, "FailFast").unwrap_err(),
            CommandError::UnknownCommand("FailFast".into())
        );
        assert_eq!(
            Command::parse(false, "NoSuchThing").unwrap_err(),
            CommandError::UnknownCommand("NoSuchThing".into())
        );
        assert_eq!(Command::parse(false, "GetJobs").unwrap(), Command::GetJobs);
    }

    #[test]
    fn missing_arguments_are_rejected() {
        let err = Command::parse(true, "RequestSuspend").unwrap_err();
        assert!(matches!(err, CommandError::InvalidArguments { command, .. } if command == "RequestSuspend"));
        let err = Command::parse(true, "RequestMaintenance:NodeA:Explode").unwrap_err();
        assert!(matches!(err, CommandError::InvalidArguments { .. }));
    }
}
