//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use prof_lib::session::FanOutOutcome;
use tabled::{settings::Style, Table, Tabled};

/// Format of diagnostic logs on stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines (default)
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// One row of the fan-out summary
#[derive(Debug, Tabled)]
pub struct SessionRow {
    #[tabled(rename = "POD")]
    pub pod: String,
    #[tabled(rename = "OUTCOME")]
    pub outcome: String,
    #[tabled(rename = "FILES")]
    pub files: String,
}

pub fn summary_rows(outcome: &FanOutOutcome) -> Vec<SessionRow> {
    let mut rows: Vec<SessionRow> = outcome
        .sessions
        .iter()
        .map(|session| match &session.result {
            Ok(report) => SessionRow {
                pod: session.target_pod.clone(),
                outcome: if report.failed_retrievals.is_empty() {
                    "ok".to_string()
                } else {
                    format!("{} not retrieved", report.failed_retrievals.len())
                },
                files: report
                    .files
                    .iter()
                    .map(|f| f.display().to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            },
            Err(e) => SessionRow {
                pod: session.target_pod.clone(),
                outcome: format!("failed: {}", e.kind()),
                files: String::new(),
            },
        })
        .collect();

    rows.extend(outcome.skipped.iter().map(|pod| SessionRow {
        pod: pod.clone(),
        outcome: "skipped".to_string(),
        files: String::new(),
    }));
    rows.sort_by(|a, b| a.pod.cmp(&b.pod));
    rows
}

/// Print the per-pod table after a fan-out
pub fn print_summary(outcome: &FanOutOutcome) {
    let rows = summary_rows(outcome);
    if rows.is_empty() {
        println!("{}", "No sessions were run".yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "❌".red(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}
