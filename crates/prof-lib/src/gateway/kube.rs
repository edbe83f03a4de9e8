//! [`ClusterGateway`] backed by a live API server

use super::{async_trait, not_found_name, ClusterGateway, GatewayError, LogStream};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const LOG_LINE_BUFFER: usize = 256;

impl From<kube::Error> for GatewayError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => GatewayError::NotFound {
                name: not_found_name(&resp.message),
                message: resp.message,
            },
            kube::Error::Api(resp) => GatewayError::Api {
                code: resp.code,
                reason: resp.reason,
                message: resp.message,
            },
            other => GatewayError::Transport(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster environment
    pub async fn try_default() -> Result<Self, GatewayError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, GatewayError> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn list_pods_by_label(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Pod>, GatewayError> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job, GatewayError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(jobs.create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.delete(name, &DeleteParams::foreground()).await?;
        Ok(())
    }

    async fn patch_pod_ephemeral_containers(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<Pod, GatewayError> {
        let pod = self
            .pods(namespace)
            .patch_ephemeral_containers(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(pod)
    }

    async fn stream_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<LogStream, GatewayError> {
        let pods = self.pods(namespace);
        let pod = pod.to_string();
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };

        // The reader is pumped by its own task so the returned stream owns
        // nothing borrowed from this call.
        let (opened_tx, opened_rx) = oneshot::channel();
        let (line_tx, line_rx) = mpsc::channel(LOG_LINE_BUFFER);
        tokio::spawn(async move {
            let reader = match pods.log_stream(&pod, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = opened_tx.send(Err(GatewayError::from(err)));
                    return;
                }
            };
            let lines = reader.lines();
            futures::pin_mut!(lines);
            while let Some(line) = lines.next().await {
                if line_tx.send(line).await.is_err() {
                    debug!(pod = %pod, "log consumer went away, closing stream");
                    break;
                }
            }
        });

        opened_rx
            .await
            .map_err(|_| GatewayError::Stream("log stream task ended before opening".into()))??;

        let stream = futures::stream::unfold(line_rx, |mut rx| async move {
            rx.recv().await.map(|line| (line, rx))
        });
        Ok(stream.boxed())
    }

    async fn exec_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<Vec<u8>, GatewayError> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = self.pods(namespace).exec(pod, command.to_vec(), &params).await?;

        let mut stdout = attached
            .stdout()
            .ok_or_else(|| GatewayError::Exec("stdout was not attached".into()))?;
        let stderr = attached.stderr();
        let status = attached.take_status();

        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_err = async {
            if let Some(mut stderr) = stderr {
                stderr.read_to_end(&mut err).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (out_res, err_res) = tokio::join!(stdout.read_to_end(&mut out), read_err);
        out_res.map_err(|e| GatewayError::Exec(format!("reading stdout: {e}")))?;
        if let Err(e) = err_res {
            warn!(pod = %pod, error = %e, "failed to read exec stderr");
        }

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    let stderr = String::from_utf8_lossy(&err);
                    return Err(GatewayError::Exec(format!(
                        "{}: {}",
                        status.message.unwrap_or_default(),
                        stderr.trim()
                    )));
                }
            }
        }

        attached
            .join()
            .await
            .map_err(|e| GatewayError::Exec(e.to_string()))?;
        Ok(out)
    }
}
