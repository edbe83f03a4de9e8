//! Structured logging for profiling sessions
//!
//! Every lifecycle step of a session is emitted as one `tracing` event with
//! an `event` field and the identifiers of the session, so JSON output can be
//! filtered per pod or per worker.

use crate::models::WorkerRef;
use std::path::Path;
use tracing::{info, warn};

/// Structured logger bound to one target pod
#[derive(Debug, Clone)]
pub struct SessionLogger {
    namespace: String,
    target_pod: String,
}

impl SessionLogger {
    pub fn new(namespace: impl Into<String>, target_pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            target_pod: target_pod.into(),
        }
    }

    pub fn log_session_started(&self, language: &str, tool: &str, output: &str, mode: &str) {
        info!(
            event = "session_started",
            namespace = %self.namespace,
            target_pod = %self.target_pod,
            language = %language,
            tool = %tool,
            output = %output,
            mode = %mode,
            "Profiling session started"
        );
    }

    pub fn log_target_resolved(&self, container: &str, container_id: &str, node: Option<&str>) {
        info!(
            event = "target_resolved",
            namespace = %self.namespace,
            target_pod = %self.target_pod,
            container = %container,
            container_id = %container_id,
            node = ?node,
            "Target container resolved"
        );
    }

    pub fn log_worker_provisioned(&self, session_id: &str, worker_name: &str) {
        info!(
            event = "worker_provisioned",
            namespace = %self.namespace,
            target_pod = %self.target_pod,
            session_id = %session_id,
            worker = %worker_name,
            "Profiling worker submitted"
        );
    }

    pub fn log_worker_ready(&self, worker: &WorkerRef) {
        info!(
            event = "worker_ready",
            namespace = %self.namespace,
            target_pod = %self.target_pod,
            worker_pod = %worker.pod_name,
            worker_container = %worker.container_name,
            "Profiling worker running"
        );
    }

    pub fn log_result_retrieved(&self, remote: &str, local: &Path) {
        info!(
            event = "result_retrieved",
            namespace = %self.namespace,
            target_pod = %self.target_pod,
            remote = %remote,
            local = %local.display(),
            "Result file saved"
        );
    }

    pub fn log_result_failed(&self, remote: &str, kind: &str, error: &str) {
        warn!(
            event = "result_failed",
            namespace = %self.namespace,
            target_pod = %self.target_pod,
            remote = %remote,
            kind = %kind,
            error = %error,
            "Result file could not be retrieved"
        );
    }

    pub fn log_worker_removed(&self, job_name: &str, success: bool, error: Option<&str>) {
        if success {
            info!(
                event = "worker_removed",
                namespace = %self.namespace,
                target_pod = %self.target_pod,
                job = %job_name,
                "Profiling worker deleted"
            );
        } else {
            warn!(
                event = "worker_remove_failed",
                namespace = %self.namespace,
                target_pod = %self.target_pod,
                job = %job_name,
                error = ?error,
                "Profiling worker could not be deleted"
            );
        }
    }

    pub fn log_session_finished(&self, files: usize, error: Option<&str>) {
        match error {
            None => info!(
                event = "session_finished",
                namespace = %self.namespace,
                target_pod = %self.target_pod,
                files = files,
                "Profiling session finished"
            ),
            Some(error) => warn!(
                event = "session_failed",
                namespace = %self.namespace,
                target_pod = %self.target_pod,
                files = files,
                error = %error,
                "Profiling session failed"
            ),
        }
    }
}
