//! Interface de linha de comando do infracoord baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, demo, config)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// infracoord: coordena tarefas de reparo do cluster com o feed de manutenção.
#[derive(Debug, Parser)]
#[command(name = "infracoord", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: `infracoord.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o coordenador contra os endpoints configurados até Ctrl-C.
    Run {
        /// Época desta réplica primária; nunca deve regredir entre execuções.
        #[arg(long, default_value_t = 1)]
        epoch: u32,
    },

    /// Executa os cenários embutidos contra o plano de controle em memória.
    Demo,

    /// Mostra a configuração efetiva em TOML.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["infracoord", "run", "--epoch", "7"]);
        match cli.command {
            Command::Run { epoch } => assert_eq!(epoch, 7),
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn run_epoch_defaults_to_one() {
        let cli = Cli::parse_from(["infracoord", "run"]);
        assert!(matches!(cli.command, Command::Run { epoch: 1 }));
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "infracoord",
            "--config",
            "/etc/infracoord.toml",
            "--verbose",
            "demo",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config.unwrap(), PathBuf::from("/etc/infracoord.toml"));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
