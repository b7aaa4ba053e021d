//! Tipos de erro para o armazenamento de tarefas de reparo.

use thiserror::Error;

use crate::channel::error::is_transient_status;
use crate::model::TransitionError;
use crate::retry::Retryable;

/// Erros que podem ocorrer ao interagir com o repair store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Já existe uma tarefa com o mesmo id.
    #[error("repair task already exists: {0}")]
    AlreadyExists(String),

    /// A versão enviada não é mais a atual; reler e recalcular.
    #[error("version conflict on repair task {task_id} (expected {expected}, found {found})")]
    VersionConflict {
        task_id: String,
        expected: u64,
        found: u64,
    },

    #[error("repair task not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Store temporariamente indisponível (408/429/5xx).
    #[error("repair store unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("repair store rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid store url: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    pub(crate) fn from_status(status: u16, message: String) -> Self {
        if is_transient_status(status) {
            StoreError::Unavailable { status, message }
        } else {
            StoreError::Rejected { status, message }
        }
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable { .. } => true,
            StoreError::Network(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_display() {
        let err = StoreError::VersionConflict {
            task_id: "rt1".into(),
            expected: 3,
            found: 4,
        };
        assert_eq!(
            err.to_string(),
            "version conflict on repair task rt1 (expected 3, found 4)"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn status_classification() {
        assert!(StoreError::from_status(503, String::new()).is_transient());
        assert!(!StoreError::from_status(400, String::new()).is_transient());
    }
}
