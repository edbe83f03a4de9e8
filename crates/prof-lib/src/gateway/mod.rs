//! Cluster access used by profiling sessions
//!
//! The orchestrator only needs a handful of cluster operations. They are
//! collected behind [`ClusterGateway`] so sessions can run against a real
//! API server ([`KubeGateway`]) or an in-memory cluster ([`FakeGateway`]).

mod fake;
mod kube;

pub use self::fake::{ExecCall, ExecReply, FakeGateway};
pub use self::kube::KubeGateway;

use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

pub use async_trait::async_trait;

/// Lines of a container's log, in the order they were written
pub type LogStream = BoxStream<'static, std::io::Result<String>>;

/// Failure talking to the cluster
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The object (or the subresource endpoint) does not exist.
    /// `name` is empty when the server could not even resolve the endpoint.
    #[error("{message}")]
    NotFound {
        name: Option<String>,
        message: String,
    },

    #[error("cluster API error ({code} {reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("log stream failed: {0}")]
    Stream(String),

    #[error("cluster connection failed: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// A NotFound that does not name any object, which is how an API server
    /// answers requests to a subresource it does not serve
    pub fn is_unnamed_not_found(&self) -> bool {
        matches!(self, Self::NotFound { name: None, .. })
    }
}

/// Extract the object name from messages shaped like `pods "web-0" not found`
pub(crate) fn not_found_name(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let len = message[start..].find('"')?;
    let name = &message[start..start + len];
    (!name.is_empty()).then(|| name.to_string())
}

/// Cluster operations a profiling session relies on
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, GatewayError>;

    async fn list_pods_by_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Pod>, GatewayError>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, GatewayError>;

    /// Delete a job and, in the foreground, the pods it owns
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    /// Apply a strategic merge patch to the `ephemeralcontainers` subresource
    async fn patch_pod_ephemeral_containers(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Pod, GatewayError>;

    /// Follow a container's log
    async fn stream_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogStream, GatewayError>;

    /// Run `command` inside a container and collect its stdout
    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<Vec<u8>, GatewayError>;
}
