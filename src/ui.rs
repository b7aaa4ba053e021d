//! Interface de terminal do infracoord: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`PassProgress`] acompanha visualmente os
//! passes de reconciliação de um cenário no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::coordinator::{CoordinatorStatus, PassOutcome};
use crate::exit::ExitReason;
use crate::model::{RepairTask, RepairTaskState};
use crate::reconciler::PassReport;

/// Indicador visual de progresso para os passes de um cenário.
///
/// Exibe um spinner durante o cenário e uma linha colorida por passe:
/// verde para passes com trabalho, cinza para passes sem efeito, vermelho
/// para saídas e amarelo para passes em espera ou incompletos.
pub struct PassProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
    passes: u32,
}

impl PassProgress {
    /// Inicia o spinner com o título do cenário.
    pub fn start(title: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(title.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb.println(format!("{}", Style::new().cyan().bold().apply_to(format!("─── {title} ───"))));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
            passes: 0,
        }
    }

    /// Descreve o que muda no plano de controle antes do próximo passe.
    pub fn step(&self, message: &str) {
        self.pb.set_message(message.to_string());
        self.pb.println(format!("  {} {message}", self.dim.apply_to("·")));
    }

    /// Imprime o resultado de um passe.
    pub fn pass(&mut self, outcome: &PassOutcome) {
        self.passes += 1;
        let n = self.passes;
        match outcome {
            PassOutcome::Reconciled(report) if report.is_quiet() && !report.incomplete => {
                self.pb
                    .println(format!("  {} pass {n}: quiet", self.dim.apply_to("○")));
            }
            PassOutcome::Reconciled(report) => {
                let mark = if report.incomplete || report.errors > 0 {
                    self.yellow.apply_to("◐")
                } else {
                    self.green.apply_to("●")
                };
                self.pb
                    .println(format!("  {mark} pass {n}: {}", summarize(report)));
            }
            PassOutcome::Waiting => {
                self.pb.println(format!(
                    "  {} pass {n}: waiting for a trusted snapshot",
                    self.yellow.apply_to("…")
                ));
            }
            PassOutcome::Exited(reason) => self.exited(reason),
        }
    }

    pub fn exited(&self, reason: &ExitReason) {
        self.pb
            .println(format!("  {} exit requested: {reason}", self.red.apply_to("✗")));
    }

    /// Finaliza o spinner e lista cada tarefa com os estados por que passou.
    pub fn finish(&self, tasks: &[(RepairTask, Vec<RepairTaskState>)]) {
        self.pb.finish_and_clear();
        for (task, history) in tasks {
            let style = if task.state.is_terminal() {
                &self.green
            } else {
                &self.yellow
            };
            println!(
                "  {} {} [{}] -> {}",
                style.apply_to("▸"),
                task.task_id,
                task.target.join(","),
                style.apply_to(task.state)
            );
            if history.len() > 1 {
                println!("    {}", self.dim.apply_to(state_path(history)));
            }
        }
        println!();
    }

    /// Imprime o estado do coordenador formatado em JSON.
    pub fn print_status(&self, status: &CoordinatorStatus) {
        println!("{}", self.dim.apply_to("─── Coordinator state ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(status).unwrap_or_default()
        );
    }
}

fn summarize(report: &PassReport) -> String {
    let mut parts = Vec::new();
    let lists = [
        ("claimed", &report.claimed),
        ("correlated", &report.correlated),
        ("acked", &report.acknowledged),
        ("repairs", &report.repair_requests),
        ("cancelled", &report.cancelled),
        ("held", &report.held),
        ("skipped", &report.skipped),
        ("retired", &report.retired),
    ];
    for (label, items) in lists {
        if !items.is_empty() {
            parts.push(format!("{label} {}", items.join(",")));
        }
    }
    if !report.transitions.is_empty() {
        let moves: Vec<String> = report
            .transitions
            .iter()
            .map(|(task, state)| format!("{}→{state}", short_id(task)))
            .collect();
        parts.push(format!("moves {}", moves.join(" ")));
    }
    if report.conflicts > 0 {
        parts.push(format!("conflicts {}", report.conflicts));
    }
    if report.errors > 0 {
        parts.push(format!("errors {}", report.errors));
    }
    if report.incomplete {
        parts.push("incomplete".to_string());
    }
    parts.join("; ")
}

fn state_path(history: &[RepairTaskState]) -> String {
    history
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" → ")
}

// Drop the executor prefix from generated task ids.
fn short_id(task_id: &str) -> &str {
    task_id.split_once('/').map_or(task_id, |(_, rest)| rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_only_what_happened() {
        let report = PassReport {
            acknowledged: vec!["J1".into()],
            transitions: vec![("InfraCoord/J1/0000000100000000".into(), RepairTaskState::Executing)],
            conflicts: 1,
            ..PassReport::default()
        };
        assert_eq!(
            summarize(&report),
            "acked J1; moves J1/0000000100000000→EXECUTING; conflicts 1"
        );
    }

    #[test]
    fn state_path_joins_history_in_order() {
        use RepairTaskState::*;
        assert_eq!(state_path(&[Created, Claimed, Cancelled]), "CREATED → CLAIMED → CANCELLED");
    }

    #[test]
    fn short_id_keeps_admin_ids() {
        assert_eq!(short_id("rt1"), "rt1");
        assert_eq!(short_id("InfraCoord/J1/01"), "J1/01");
    }
}
