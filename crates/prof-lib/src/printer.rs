//! Human facing progress output

use colored::Colorize;
#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Writes session progress to the terminal.
///
/// In dry-run mode only errors get through, so the rendered manifest is the
/// only thing on stdout. Fan-out sessions prefix every line with their pod.
#[derive(Debug, Clone, Default)]
pub struct Printer {
    prefix: Option<String>,
    dry_run: bool,
    #[cfg(test)]
    captured: Option<Arc<Mutex<Vec<String>>>>,
}

impl Printer {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Printer collecting its lines instead of writing them
    #[cfg(test)]
    pub(crate) fn capturing() -> (Self, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let printer = Self {
            captured: Some(lines.clone()),
            ..Self::default()
        };
        (printer, lines)
    }

    /// Same printer, tagging lines with `[pod]`
    pub fn for_pod(&self, pod: &str) -> Self {
        Self {
            prefix: Some(format!("[{pod}] ")),
            ..self.clone()
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or("")
    }

    fn emit(&self, line: String, to_stderr: bool) {
        #[cfg(test)]
        if let Some(captured) = &self.captured {
            captured.lock().unwrap().push(line);
            return;
        }
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    pub fn print(&self, message: &str) {
        if !self.dry_run {
            self.emit(format!("{}{}", self.prefix(), message), false);
        }
    }

    /// A step that completed, e.g. `Launching profiler ... ✔`
    pub fn print_step(&self, step: &str) {
        if !self.dry_run {
            self.emit(
                format!("{}{} ... {}", self.prefix(), step, "✔".green().bold()),
                false,
            );
        }
    }

    pub fn print_warning(&self, message: &str) {
        if !self.dry_run {
            self.emit(
                format!("{}{} {}", self.prefix(), "⚠".yellow().bold(), message),
                false,
            );
        }
    }

    pub fn print_error(&self, message: &str) {
        self.emit(format!("{}{} {}", self.prefix(), "❌".red(), message), true);
    }

    /// Raw output that must reach stdout even when running dry
    pub fn print_manifest(&self, manifest: &str) {
        print!("{manifest}");
        if !manifest.ends_with('\n') {
            println!();
        }
    }
}
