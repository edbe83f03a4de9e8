//! Drives session state from the worker's event lines

use super::{parse_line, Event, Stage, WorkerLog};
use crate::models::ResultFile;
use crate::printer::Printer;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// How the worker finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Ended,
    Failed(String),
}

pub struct EventHandler {
    printer: Printer,
}

impl EventHandler {
    pub fn new(printer: Printer) -> Self {
        Self { printer }
    }

    /// Consume raw lines until the upstream closes.
    ///
    /// `Progress{ended}` and `Error` are reported on `done`; results go to
    /// `results` in the order the worker announced them.
    pub async fn handle(
        self,
        mut events: mpsc::Receiver<String>,
        done: mpsc::UnboundedSender<Completion>,
        results: mpsc::UnboundedSender<ResultFile>,
    ) {
        while let Some(line) = events.recv().await {
            let Some(event) = parse_line(&line) else {
                continue;
            };
            match event {
                Event::Progress(p) => match p.stage {
                    Stage::Started => self.printer.print("Profiling ..."),
                    Stage::Ended => {
                        let _ = done.send(Completion::Ended);
                    }
                },
                Event::Notice(n) => self.printer.print(&n.msg),
                // Reported by the session once the worker is torn down
                Event::Error(f) => {
                    debug!(reason = %f.reason, "worker reported an error");
                    let _ = done.send(Completion::Failed(f.reason));
                }
                Event::Result(r) => {
                    if results.send(r).is_err() {
                        warn!("result receiver dropped, discarding result");
                    }
                }
                Event::Log(log) => forward_log(&log),
            }
        }
        debug!("worker event stream closed");
    }
}

fn forward_log(log: &WorkerLog) {
    let msg = log.msg.as_str();
    match log.level.as_str() {
        "trace" => trace!(target: "worker", "{msg}"),
        "debug" => debug!(target: "worker", "{msg}"),
        "warn" | "warning" => warn!(target: "worker", "{msg}"),
        "error" | "panic" | "fatal" => error!(target: "worker", "{msg}"),
        _ => info!(target: "worker", "{msg}"),
    }
}
