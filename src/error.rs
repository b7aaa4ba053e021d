use thiserror::Error;

use crate::channel::ChannelError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Coordinator is already running (epoch {0})")]
    AlreadyRunning(u32),

    #[error("Epoch regressed: running {current}, asked for {requested}")]
    EpochRegressed { current: u32, requested: u32 },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Policy agent channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Repair store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures of the administrative command surface.
///
/// An admin-only command issued by a non-admin caller is reported as
/// `UnknownCommand`, so callers cannot enumerate the command table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid arguments for {command}: {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Repair task not found: {0}")]
    TaskNotFound(String),

    #[error("Could not render result: {0}")]
    Render(String),

    #[error("Command timed out")]
    Timeout,

    #[error("Command cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_regression_display() {
        let err = CoordinatorError::EpochRegressed {
            current: 4,
            requested: 3,
        };
        assert_eq!(err.to_string(), "Epoch regressed: running 4, asked for 3");
    }

    #[test]
    fn command_error_converts() {
        let err: CoordinatorError = CommandError::Timeout.into();
        assert!(matches!(err, CoordinatorError::Command(CommandError::Timeout)));
    }
}
