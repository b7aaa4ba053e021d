mod channel;
mod claims;
mod cli;
mod command;
mod config;
mod coordinator;
mod demo;
mod error;
mod exit;
mod liveness;
mod memory;
mod model;
mod outbound;
mod policy;
mod reconciler;
mod retry;
mod store;
mod ui;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use channel::HttpPolicyAgentChannel;
use cli::{Cli, Command};
use config::CoordinatorConfig;
use coordinator::{Coordinator, RunOutcome};
use exit::TokenExit;
use store::HttpRepairStore;

fn init_tracing(verbose: bool) {
    let default = if verbose { "infracoord=debug" } else { "infracoord=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = CoordinatorConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { epoch } => run(config, epoch).await,
        Command::Demo => {
            demo::run_all(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: CoordinatorConfig, epoch: u32) -> Result<ExitCode> {
    let channel = HttpPolicyAgentChannel::new(&config.channel_url, config.request_timeout())?;
    let store = HttpRepairStore::new(&config.store_url, config.request_timeout())?;
    tracing::info!(
        channel = %config.channel_url,
        store = %config.store_url,
        executor = %config.executor_name,
        "starting coordinator"
    );

    let shutdown = CancellationToken::new();
    let coordinator = Coordinator::new(config, channel, store, TokenExit::new(shutdown.clone()));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            ctrl_c.cancel();
        }
    });

    match coordinator.run(epoch, &shutdown).await? {
        RunOutcome::Cancelled => Ok(ExitCode::SUCCESS),
        RunOutcome::Exited(reason) => {
            tracing::error!(%reason, "coordinator exited");
            Ok(ExitCode::FAILURE)
        }
    }
}
