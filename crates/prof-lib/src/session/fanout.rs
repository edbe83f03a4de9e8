//! Fan-out of one profiling request over every pod matching a selector

use super::{pod_name, pod_phase, SessionOrchestrator, SessionTimings};
use crate::config::ProfilerConfig;
use crate::error::{ProfError, Result};
use crate::gateway::ClusterGateway;
use crate::models::SessionReport;
use crate::printer::Printer;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of one session started by the scheduler
#[derive(Debug)]
pub struct SessionOutcome {
    pub target_pod: String,
    pub result: Result<SessionReport>,
}

/// Sessions in completion order
#[derive(Debug, Default)]
pub struct FanOutOutcome {
    pub sessions: Vec<SessionOutcome>,
    /// Pods skipped because they were not running
    pub skipped: Vec<String>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl FanOutOutcome {
    /// All reports, or the error of the first session that failed
    pub fn into_result(self) -> Result<Vec<SessionReport>> {
        self.sessions.into_iter().map(|s| s.result).collect()
    }

    pub fn failed(&self) -> usize {
        self.sessions.iter().filter(|s| s.result.is_err()).count()
    }
}

pub struct FanOutScheduler {
    gateway: Arc<dyn ClusterGateway>,
    printer: Printer,
    timings: SessionTimings,
    cancel: CancellationToken,
}

impl FanOutScheduler {
    pub fn new(gateway: Arc<dyn ClusterGateway>, printer: Printer) -> Self {
        Self {
            gateway,
            printer,
            timings: SessionTimings::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one session per running pod matching `cfg.target.label_selector`.
    ///
    /// At most `pool_size_launch_jobs` sessions run at once; zero means one
    /// slot per matched pod.
    pub async fn run(&self, cfg: ProfilerConfig) -> Result<FanOutOutcome> {
        let selector = cfg
            .target
            .label_selector
            .clone()
            .ok_or_else(|| ProfError::invalid("no label selector given"))?;
        let namespace = cfg.target.namespace.clone();

        let pods = match self.gateway.list_pods_by_label(&namespace, &selector).await {
            Ok(pods) if !pods.is_empty() => pods,
            Ok(_) => {
                let err = ProfError::NoMatchingPods {
                    namespace,
                    selector,
                };
                self.printer.print_error(&err.to_string());
                return Err(err);
            }
            Err(e) => {
                let err = ProfError::from(e);
                self.printer.print_error(&err.to_string());
                return Err(err);
            }
        };

        let slots = match cfg.target.pool_size_launch_jobs {
            0 => pods.len(),
            n => n,
        };
        info!(
            namespace = %namespace,
            selector = %selector,
            pods = pods.len(),
            slots = slots,
            "Profiling pods matching selector"
        );

        let pool = Arc::new(Semaphore::new(slots));
        let mut tasks = JoinSet::new();
        let mut outcome = FanOutOutcome::default();

        for pod in &pods {
            let name = pod_name(pod);
            let phase = pod_phase(pod);
            if phase != "Running" {
                self.printer
                    .print_warning(&format!("Pod {name} is {phase}, skipping"));
                outcome.skipped.push(name);
                continue;
            }

            let mut session_cfg = cfg.clone();
            session_cfg.target.pod_name = Some(name.clone());
            session_cfg.target.label_selector = None;

            let printer = self.printer.for_pod(&name);
            let orchestrator = SessionOrchestrator::new(self.gateway.clone(), printer.clone())
                .with_timings(self.timings)
                .with_cancel(self.cancel.child_token());
            let pool = pool.clone();

            tasks.spawn(async move {
                let session = async {
                    match pool.acquire_owned().await {
                        Ok(_permit) => orchestrator.run(session_cfg).await,
                        Err(_) => Err(ProfError::Cancelled),
                    }
                };
                // A panicking session still counts as a failed one
                let result = match AssertUnwindSafe(session).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let err = ProfError::SessionPanicked(panic_message(&*panic));
                        printer.print_error(&err.to_string());
                        warn!(pod = %name, error = %err, "Profiling session panicked");
                        Err(err)
                    }
                };
                SessionOutcome {
                    target_pod: name,
                    result,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(session) => outcome.sessions.push(session),
                Err(e) => warn!(error = %e, "Profiling session task did not complete"),
            }
        }
        Ok(outcome)
    }
}
