//! Profiling session orchestration
//!
//! One [`SessionOrchestrator::run`] profiles one target pod:
//!
//! 1. resolve the target pod and container
//! 2. provision the worker (job on the node, or ephemeral container)
//! 3. wait for the worker to run
//! 4. follow its event stream, retrieving every announced result
//! 5. tear the worker down
//!
//! The worker is always torn down once it was created, whatever happened in
//! between. Ephemeral containers cannot be removed, so their teardown is a
//! no-op.

mod fanout;

#[cfg(test)]
mod tests;

pub use fanout::{FanOutOutcome, FanOutScheduler, SessionOutcome};

use crate::config::{LaunchMode, ProfilerConfig};
use crate::error::{ProfError, Result};
use crate::events::{Completion, EventHandler};
use crate::gateway::ClusterGateway;
use crate::models::{FailedRetrieval, ResultFile, SessionReport, WorkerRef};
use crate::observability::SessionLogger;
use crate::printer::Printer;
use crate::retrieve::{ArtifactRetriever, RetrieveOptions};
use crate::worker::{
    ephemeral_patch, WorkerSpec, WorkerSpecBuilder, SESSION_LABEL, WORKER_CONTAINER_NAME,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 64;

/// Polling cadence and deadline while waiting for the worker
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub poll_interval: Duration,
    /// Deadline for a job worker to start running
    pub worker_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            worker_timeout: Duration::from_secs(5 * 60),
        }
    }
}

pub(crate) fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

pub(crate) fn pod_name(pod: &Pod) -> String {
    pod.metadata.name.clone().unwrap_or_default()
}

/// Pick the container to profile.
///
/// A single-container pod needs no name; otherwise `requested` must name
/// one of the pod's containers.
pub fn select_container(pod: &Pod, requested: Option<&str>) -> Result<String> {
    let names: Vec<String> = pod
        .spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();

    if names.len() == 1 {
        return Ok(names[0].clone());
    }
    match requested {
        Some(name) if names.iter().any(|n| n == name) => Ok(name.to_string()),
        _ => Err(ProfError::AmbiguousContainer(names)),
    }
}

/// Runtime id of `container` as reported in the pod status
pub fn container_id(pod: &Pod, container: &str) -> Result<String> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == container))
        .and_then(|s| s.container_id.clone())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProfError::ContainerIdNotFound(container.to_string()))
}

fn ephemeral_started(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.ephemeral_container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == container))
        .and_then(|s| s.state.as_ref())
        .map(|state| state.running.is_some() || state.terminated.is_some())
        .unwrap_or(false)
}

pub struct SessionOrchestrator {
    gateway: Arc<dyn ClusterGateway>,
    printer: Printer,
    timings: SessionTimings,
    cancel: CancellationToken,
}

impl SessionOrchestrator {
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

    /// Profile the pod named in `cfg.target.pod_name`
    pub async fn run(&self, cfg: ProfilerConfig) -> Result<SessionReport> {
        let pod_name = cfg
            .target
            .pod_name
            .clone()
            .ok_or_else(|| ProfError::invalid("no target pod given"))?;
        let logger = SessionLogger::new(&cfg.target.namespace, &pod_name);
        logger.log_session_started(
            cfg.target.language.as_str(),
            cfg.target.tool.as_str(),
            cfg.target.output.as_str(),
            match cfg.mode {
                LaunchMode::Job => "job",
                LaunchMode::EphemeralContainer { .. } => "ephemeral",
            },
        );

        let outcome = self.run_session(cfg, pod_name, &logger).await;
        match &outcome {
            Ok(report) => logger.log_session_finished(report.files.len(), None),
            Err(e) => {
                self.printer.print_error(&e.to_string());
                logger.log_session_finished(0, Some(&e.to_string()));
            }
        }
        outcome
    }

    async fn run_session(
        &self,
        mut cfg: ProfilerConfig,
        pod_name: String,
        logger: &SessionLogger,
    ) -> Result<SessionReport> {
        let target_pod = self.resolve_target(&mut cfg, &pod_name, logger).await?;

        let mut report = SessionReport {
            target_pod: pod_name,
            ..Default::default()
        };

        match WorkerSpecBuilder::build(&target_pod, &cfg)? {
            WorkerSpec::Job { session_id, job } => {
                report.session_id = session_id.clone();
                if cfg.target.dry_run {
                    let manifest = serde_yaml::to_string(&*job)?;
                    self.printer.print_manifest(&manifest);
                    report.manifest = Some(manifest);
                    return Ok(report);
                }

                let namespace = cfg.job.namespace.clone();
                let job_name = job.metadata.name.clone().unwrap_or_default();
                self.gateway.create_job(&namespace, &job).await?;
                logger.log_worker_provisioned(&session_id, &job_name);
                self.printer.print_step("Launching profiler");

                let outcome = self
                    .drive_job(&cfg, &session_id, &job_name, report, logger)
                    .await;

                let teardown = self.gateway.delete_job(&namespace, &job_name).await;
                logger.log_worker_removed(
                    &job_name,
                    teardown.is_ok(),
                    teardown.as_ref().err().map(|e| e.to_string()).as_deref(),
                );
                match (outcome, teardown) {
                    (Ok(report), Ok(())) => Ok(report),
                    (Ok(_), Err(e)) => Err(e.into()),
                    (Err(e), Ok(())) => Err(e),
                    (Err(e), Err(teardown_err)) => {
                        warn!(job = %job_name, error = %teardown_err, "Worker cleanup failed after session error");
                        Err(e)
                    }
                }
            }
            WorkerSpec::Ephemeral { container } => {
                let (patched, patch) = ephemeral_patch(&target_pod, &container);
                if cfg.target.dry_run {
                    let manifest = serde_yaml::to_string(&patched)?;
                    self.printer.print_manifest(&manifest);
                    report.manifest = Some(manifest);
                    return Ok(report);
                }

                let namespace = cfg.target.namespace.clone();
                self.gateway
                    .patch_pod_ephemeral_containers(&namespace, &report.target_pod, &patch)
                    .await
                    .map_err(|e| {
                        if e.is_unnamed_not_found() {
                            ProfError::FeatureDisabled
                        } else {
                            ProfError::PatchFailed {
                                pod: report.target_pod.clone(),
                                source: e,
                            }
                        }
                    })?;
                logger.log_worker_provisioned("", &container.name);
                self.printer.print_step("Launching profiler");

                let timeout = match cfg.mode {
                    LaunchMode::EphemeralContainer { timeout } => timeout,
                    LaunchMode::Job => self.timings.worker_timeout,
                };
                self.await_ephemeral(&namespace, &report.target_pod, &container.name, timeout)
                    .await?;

                let worker = WorkerRef {
                    namespace,
                    pod_name: report.target_pod.clone(),
                    container_name: container.name.clone(),
                    job_name: None,
                };
                logger.log_worker_ready(&worker);
                self.stream_and_retrieve(&cfg, worker, report, logger).await
            }
        }
    }

    async fn resolve_target(
        &self,
        cfg: &mut ProfilerConfig,
        pod_name: &str,
        logger: &SessionLogger,
    ) -> Result<Pod> {
        let namespace = cfg.target.namespace.clone();
        let pod = self
            .gateway
            .get_pod(&namespace, pod_name)
            .await?
            .ok_or_else(|| ProfError::PodNotFound {
                name: pod_name.to_string(),
                namespace: namespace.clone(),
            })?;

        let container = select_container(&pod, cfg.target.container_name.as_deref())?;
        let id = container_id(&pod, &container)?;
        logger.log_target_resolved(
            &container,
            &id,
            pod.spec.as_ref().and_then(|s| s.node_name.as_deref()),
        );
        self.printer.print_step("Verifying target pod");

        cfg.target.container_name = Some(container);
        cfg.target.container_id = Some(id);
        Ok(pod)
    }

    async fn drive_job(
        &self,
        cfg: &ProfilerConfig,
        session_id: &str,
        job_name: &str,
        report: SessionReport,
        logger: &SessionLogger,
    ) -> Result<SessionReport> {
        let namespace = cfg.job.namespace.clone();
        let worker_pod = self.await_worker(&namespace, session_id).await?;
        let worker = WorkerRef {
            namespace,
            pod_name: worker_pod,
            container_name: WORKER_CONTAINER_NAME.to_string(),
            job_name: Some(job_name.to_string()),
        };
        logger.log_worker_ready(&worker);
        self.stream_and_retrieve(cfg, worker, report, logger).await
    }

    /// Sleep one poll interval, or fail if the session was cancelled
    async fn pause(&self) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProfError::Cancelled),
            _ = tokio::time::sleep(self.timings.poll_interval) => Ok(()),
        }
    }

    /// Find the job's pod by session label and wait for it to run
    async fn await_worker(&self, namespace: &str, session_id: &str) -> Result<String> {
        let selector = format!("{SESSION_LABEL}={session_id}");
        let deadline = Instant::now() + self.timings.worker_timeout;

        loop {
            let pods = self.gateway.list_pods_by_label(namespace, &selector).await?;
            if let Some(pod) = pods.first() {
                match pod_phase(pod) {
                    "Running" | "Succeeded" => return Ok(pod_name(pod)),
                    "Failed" => {
                        return Err(ProfError::WorkerFailed(format!(
                            "worker pod {} failed",
                            pod_name(pod)
                        )))
                    }
                    phase => debug!(pod = %pod_name(pod), phase = %phase, "Waiting for worker pod"),
                }
            }
            if Instant::now() >= deadline {
                return Err(ProfError::WorkerTimeout(self.timings.worker_timeout));
            }
            self.pause().await?;
        }
    }

    async fn await_ephemeral(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(current) = self.gateway.get_pod(namespace, pod).await? {
                match pod_phase(&current) {
                    "Failed" => {
                        return Err(ProfError::WorkerFailed(format!("pod {pod} failed")))
                    }
                    "Running" if ephemeral_started(&current, container) => return Ok(()),
                    _ => debug!(pod = %pod, container = %container, "Waiting for ephemeral container"),
                }
            }
            if Instant::now() >= deadline {
                return Err(ProfError::WorkerTimeout(timeout));
            }
            self.pause().await?;
        }
    }

    async fn stream_and_retrieve(
        &self,
        cfg: &ProfilerConfig,
        worker: WorkerRef,
        mut report: SessionReport,
        logger: &SessionLogger,
    ) -> Result<SessionReport> {
        let mut logs = self
            .gateway
            .stream_container_logs(&worker.namespace, &worker.pod_name, &worker.container_name)
            .await?;
        report.worker = Some(worker.clone());

        let (event_tx, event_rx) = mpsc::channel::<String>(EVENT_BUFFER);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        let reader_cancel = self.cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    line = logs.next() => line,
                };
                match line {
                    Some(Ok(line)) => {
                        if event_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Worker log stream failed");
                        break;
                    }
                    None => break,
                }
            }
        });
        let handler = tokio::spawn(
            EventHandler::new(self.printer.clone()).handle(event_rx, done_tx, result_tx),
        );

        let retriever = ArtifactRetriever::new(
            self.gateway.clone(),
            worker,
            RetrieveOptions {
                local_dir: cfg.target.local_path.clone(),
                target_pod: report.target_pod.clone(),
                compressor: cfg.target.compressor,
                retries: cfg.target.retrieve_file_retries,
                pool_size: cfg.target.pool_size_retrieve_chunks,
            },
            self.cancel.clone(),
        );

        let outcome = loop {
            tokio::select! {
                biased;
                Some(result) = result_rx.recv() => {
                    self.retrieve_one(&retriever, &result, &mut report, logger).await;
                }
                completion = done_rx.recv() => match completion {
                    Some(Completion::Ended) => break Ok(()),
                    Some(Completion::Failed(reason)) => break Err(ProfError::WorkerFailed(reason)),
                    None => {
                        break Err(ProfError::WorkerFailed(
                            "worker event stream closed before profiling ended".to_string(),
                        ))
                    }
                },
                _ = self.cancel.cancelled() => break Err(ProfError::Cancelled),
            }
        };

        if outcome.is_ok() {
            while let Ok(result) = result_rx.try_recv() {
                self.retrieve_one(&retriever, &result, &mut report, logger).await;
            }
        }

        reader.abort();
        if let Err(e) = handler.await {
            debug!(error = %e, "Event handler task ended abnormally");
        }

        outcome.map(|()| report)
    }

    async fn retrieve_one(
        &self,
        retriever: &ArtifactRetriever,
        result: &ResultFile,
        report: &mut SessionReport,
        logger: &SessionLogger,
    ) {
        match retriever.retrieve(result).await {
            Ok(path) => {
                self.printer.print(&format!(
                    "Result profiling data saved to: {}",
                    path.display()
                ));
                logger.log_result_retrieved(&result.name, &path);
                report.files.push(path);
            }
            Err(e) => {
                self.printer
                    .print_error(&format!("Could not retrieve {}: {e}", result.name));
                logger.log_result_failed(&result.name, e.kind(), &e.to_string());
                report.failed_retrievals.push(FailedRetrieval {
                    remote_file: result.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}
