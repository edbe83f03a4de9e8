//! In-memory cluster for exercising sessions without an API server

use super::{async_trait, ClusterGateway, GatewayError, LogStream};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStatus, EphemeralContainer, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Scripted answer to an exec call
#[derive(Debug, Clone)]
pub enum ExecReply {
    Output(Vec<u8>),
    Fail(String),
}

/// An exec call as the fake received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    pods: Vec<Pod>,
    /// Phase given to pods materialized for created jobs; `None` never
    /// schedules them
    worker_phase: Option<String>,
    log_lines: Vec<String>,
    /// Replies keyed by the last argument of the command (the file path).
    /// The front reply is consumed while more remain, the last one repeats.
    exec_replies: HashMap<String, VecDeque<ExecReply>>,
    patch_error: Option<GatewayError>,
    delete_error: Option<GatewayError>,
    create_error: Option<GatewayError>,

    created_jobs: Vec<Job>,
    deleted_jobs: Vec<(String, String)>,
    /// Jobs created and not yet deleted, and the most seen at once
    live_jobs: usize,
    max_live_jobs: usize,
    label_queries: Vec<(String, String)>,
    patches: Vec<serde_json::Value>,
    exec_calls: Vec<ExecCall>,
    log_requests: Vec<(String, String, String)>,
}

/// [`super::ClusterGateway`] over a scripted in-memory cluster.
///
/// Created jobs materialize a worker pod carrying the job template's labels,
/// so label lookups for the worker behave as on a real cluster.
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                worker_phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.state().pods.push(pod);
        self
    }

    pub fn with_worker_phase(self, phase: &str) -> Self {
        self.state().worker_phase = Some(phase.to_string());
        self
    }

    /// Created jobs never get a pod
    pub fn without_worker(self) -> Self {
        self.state().worker_phase = None;
        self
    }

    pub fn with_log_lines<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().log_lines = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exec_reply(self, path: &str, reply: ExecReply) -> Self {
        self.state()
            .exec_replies
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn with_patch_error(self, err: GatewayError) -> Self {
        self.state().patch_error = Some(err);
        self
    }

    pub fn with_delete_error(self, err: GatewayError) -> Self {
        self.state().delete_error = Some(err);
        self
    }

    pub fn with_create_error(self, err: GatewayError) -> Self {
        self.state().create_error = Some(err);
        self
    }

    pub fn created_jobs(&self) -> Vec<Job> {
        self.state().created_jobs.clone()
    }

    pub fn deleted_jobs(&self) -> Vec<(String, String)> {
        self.state().deleted_jobs.clone()
    }

    /// Most jobs that existed at the same time
    pub fn max_live_jobs(&self) -> usize {
        self.state().max_live_jobs
    }

    pub fn label_queries(&self) -> Vec<(String, String)> {
        self.state().label_queries.clone()
    }

    pub fn patches(&self) -> Vec<serde_json::Value> {
        self.state().patches.clone()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.state().exec_calls.clone()
    }

    /// Number of exec calls that read `path`
    pub fn exec_count(&self, path: &str) -> usize {
        self.state()
            .exec_calls
            .iter()
            .filter(|c| c.command.last().map(String::as_str) == Some(path))
            .count()
    }

    pub fn log_requests(&self) -> Vec<(String, String, String)> {
        self.state().log_requests.clone()
    }
}

fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => {
                let key = key.trim_end_matches('=');
                let value = value.trim_start_matches('=');
                labels.and_then(|l| l.get(key)).map(String::as_str) == Some(value)
            }
            None => labels.map(|l| l.contains_key(term)).unwrap_or(false),
        })
}

fn in_namespace(pod: &Pod, namespace: &str) -> bool {
    pod.metadata.namespace.as_deref() == Some(namespace)
}

#[async_trait]
impl ClusterGateway for FakeGateway {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, GatewayError> {
        Ok(self
            .state()
            .pods
            .iter()
            .find(|p| in_namespace(p, namespace) && p.metadata.name.as_deref() == Some(name))
            .cloned())
    }

    async fn list_pods_by_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Pod>, GatewayError> {
        let mut state = self.state();
        state
            .label_queries
            .push((namespace.to_string(), selector.to_string()));
        Ok(state
            .pods
            .iter()
            .filter(|p| in_namespace(p, namespace))
            .filter(|p| selector_matches(selector, p.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, GatewayError> {
        let mut state = self.state();
        if let Some(err) = state.create_error.clone() {
            return Err(err);
        }
        state.created_jobs.push(job.clone());
        state.live_jobs += 1;
        state.max_live_jobs = state.max_live_jobs.max(state.live_jobs);

        if let Some(phase) = state.worker_phase.clone() {
            let job_name = job.metadata.name.clone().unwrap_or_default();
            let labels = job
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.labels.clone());
            let spec = job.spec.as_ref().and_then(|s| s.template.spec.clone());
            state.pods.push(Pod {
                metadata: ObjectMeta {
                    name: Some(format!("{job_name}-w0rk3")),
                    namespace: Some(namespace.to_string()),
                    labels,
                    ..Default::default()
                },
                spec,
                status: Some(PodStatus {
                    phase: Some(phase),
                    ..Default::default()
                }),
            });
        }
        Ok(job.clone())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let mut state = self.state();
        state
            .deleted_jobs
            .push((namespace.to_string(), name.to_string()));
        state.live_jobs = state.live_jobs.saturating_sub(1);
        match state.delete_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn patch_pod_ephemeral_containers(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Pod, GatewayError> {
        let mut state = self.state();
        state.patches.push(patch.clone());
        if let Some(err) = state.patch_error.clone() {
            return Err(err);
        }

        let added: Vec<EphemeralContainer> =
            serde_json::from_value(patch["spec"]["ephemeralContainers"].clone())
                .map_err(|e| GatewayError::Api {
                    code: 422,
                    reason: "Invalid".into(),
                    message: e.to_string(),
                })?;

        let pod = state
            .pods
            .iter_mut()
            .find(|p| in_namespace(p, namespace) && p.metadata.name.as_deref() == Some(name))
            .ok_or_else(|| GatewayError::NotFound {
                name: Some(name.to_string()),
                message: format!("pods \"{name}\" not found"),
            })?;

        let spec = pod.spec.get_or_insert_with(Default::default);
        let status = pod.status.get_or_insert_with(Default::default);
        for container in added {
            status
                .ephemeral_container_statuses
                .get_or_insert_with(Vec::new)
                .push(ContainerStatus {
                    name: container.name.clone(),
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning::default()),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            spec.ephemeral_containers
                .get_or_insert_with(Vec::new)
                .push(container);
        }
        Ok(pod.clone())
    }

    async fn stream_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogStream, GatewayError> {
        let mut state = self.state();
        state.log_requests.push((
            namespace.to_string(),
            pod.to_string(),
            container.to_string(),
        ));
        let lines = state.log_lines.clone();
        Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<Vec<u8>, GatewayError> {
        let mut state = self.state();
        state.exec_calls.push(ExecCall {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.to_string(),
            command: command.to_vec(),
        });

        let path = command.last().cloned().unwrap_or_default();
        let queue = state
            .exec_replies
            .get_mut(&path)
            .ok_or_else(|| GatewayError::Exec(format!("cat: {path}: No such file or directory")))?;
        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match reply {
            Some(ExecReply::Output(bytes)) => Ok(bytes),
            Some(ExecReply::Fail(msg)) => Err(GatewayError::Exec(msg)),
            None => Err(GatewayError::Exec(format!("no reply scripted for {path}"))),
        }
    }
}
