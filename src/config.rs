//! Configuração do coordenador carregada a partir de `infracoord.toml`.
//!
//! A struct [`CoordinatorConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `INFRACOORD_CHANNEL_URL` e `INFRACOORD_STORE_URL`
//! têm precedência sobre o arquivo.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;
use crate::retry::RetryPolicy;

/// Caminho padrão do arquivo de configuração.
pub const DEFAULT_CONFIG_PATH: &str = "infracoord.toml";

/// Configuração de nível superior carregada de `infracoord.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// Intervalo entre passes de reconciliação, em segundos.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Janela máxima sem mudança de incarnation antes de encerrar o processo.
    /// Zero desabilita a detecção.
    #[serde(default = "default_stall_secs")]
    pub max_incarnation_stall_secs: u64,

    /// Exige que a primeira incarnation observada mude antes de reconciliar.
    #[serde(default)]
    pub require_confirmed_incarnation_at_startup: bool,

    /// Tempo acumulado de retentativas antes de desistir e encerrar.
    #[serde(default = "default_failure_give_up_secs")]
    pub failure_give_up_secs: u64,

    /// Tempo máximo que uma tarefa reivindicada espera por um job correlacionado.
    #[serde(default = "default_orphan_claim_timeout_secs")]
    pub orphan_claim_timeout_secs: u64,

    /// Tentativas por chamada, incluindo a primeira.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Atraso fixo entre tentativas, em milissegundos.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Identidade do executor; também prefixa os ids de tarefa.
    #[serde(default = "default_executor_name")]
    pub executor_name: String,

    #[serde(default = "default_channel_url")]
    pub channel_url: String,

    #[serde(default = "default_store_url")]
    pub store_url: String,
}

// Valor padrão para o intervalo de polling: 10s.
fn default_poll_interval_secs() -> u64 {
    10
}

// Valor padrão para a janela de estagnação: 30 minutos.
fn default_stall_secs() -> u64 {
    1800
}

fn default_failure_give_up_secs() -> u64 {
    1800
}

// Valor padrão para o timeout de reivindicação órfã: 15 minutos.
fn default_orphan_claim_timeout_secs() -> u64 {
    900
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_executor_name() -> String {
    "InfraCoord".to_string()
}

fn default_channel_url() -> String {
    "http://127.0.0.1:7080/".to_string()
}

fn default_store_url() -> String {
    "http://127.0.0.1:7090/".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_incarnation_stall_secs: default_stall_secs(),
            require_confirmed_incarnation_at_startup: false,
            failure_give_up_secs: default_failure_give_up_secs(),
            orphan_claim_timeout_secs: default_orphan_claim_timeout_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            executor_name: default_executor_name(),
            channel_url: default_channel_url(),
            store_url: default_store_url(),
        }
    }
}

impl CoordinatorConfig {
    /// Carrega a configuração de `path` (ou de `infracoord.toml` no diretório atual).
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<CoordinatorConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Variáveis de ambiente têm precedência sobre o arquivo para os endpoints.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("INFRACOORD_CHANNEL_URL").filter(|u| !u.is_empty()) {
            self.channel_url = url;
        }
        if let Some(url) = lookup("INFRACOORD_STORE_URL").filter(|u| !u.is_empty()) {
            self.store_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.poll_interval_secs == 0 {
            return Err(CoordinatorError::Config(
                "poll_interval_secs must be greater than zero".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(CoordinatorError::Config(
                "retry_max_attempts must be at least 1".into(),
            ));
        }
        if self.executor_name.trim().is_empty() {
            return Err(CoordinatorError::Config("executor_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_secs(self.max_incarnation_stall_secs)
    }

    pub fn failure_give_up(&self) -> Duration {
        Duration::from_secs(self.failure_give_up_secs)
    }

    pub fn orphan_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_claim_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}
