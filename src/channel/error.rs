//! Tipos de erro para o canal do agente de políticas (plano de controle).
//!
//! Define [`ChannelError`] com variantes para indisponibilidade, rejeição
//! e falhas de rede. A classificação transitória/fatal fica em
//! [`Retryable`](crate::retry::Retryable).

use thiserror::Error;

use crate::retry::Retryable;

/// Erros que podem ocorrer ao falar com o plano de controle.
///
/// - [`Unavailable`](ChannelError::Unavailable): HTTP 408/429/5xx, vale retentar
/// - [`Rejected`](ChannelError::Rejected): qualquer outro erro HTTP (4xx)
/// - [`Network`](ChannelError::Network): falha na camada de rede
#[derive(Debug, Error)]
pub enum ChannelError {
    /// O plano de controle está temporariamente indisponível.
    #[error("control plane unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    /// O plano de controle recusou o pedido.
    #[error("control plane rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// URL base inválida na configuração.
    #[error("invalid channel url: {0}")]
    InvalidUrl(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),
}

impl Retryable for ChannelError {
    fn is_transient(&self) -> bool {
        match self {
            ChannelError::Unavailable { .. } => true,
            ChannelError::Network(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => false,
        }
    }
}

/// Status HTTP que indicam falha transitória.
pub(crate) fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}
