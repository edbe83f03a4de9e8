//! Artifact retrieval from the worker container
//!
//! Files are read with `cat` through an exec session, verified against the
//! md5 digest the worker announced, decoded and written under the local
//! output directory. Chunked artifacts are fetched in parallel by a bounded
//! pool and reassembled in their declared order.

pub mod codec;
pub mod naming;


use crate::catalog::Compressor;
use crate::error::{ProfError, Result};
use crate::gateway::ClusterGateway;
use crate::models::{ResultFile, WorkerRef};
use md5::{Digest, Md5};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Retrieval settings of one session
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub local_dir: PathBuf,
    /// Prefix of every local file name
    pub target_pod: String,
    pub compressor: Compressor,
    /// Extra attempts after a checksum mismatch
    pub retries: u32,
    pub pool_size: usize,
}

pub struct ArtifactRetriever {
    gateway: Arc<dyn ClusterGateway>,
    worker: WorkerRef,
    options: RetrieveOptions,
    cancel: CancellationToken,
}

impl ArtifactRetriever {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        worker: WorkerRef,
        options: RetrieveOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            worker,
            options,
            cancel,
        }
    }

    /// Download, verify, decode and store `result`, returning the local path
    pub async fn retrieve(&self, result: &ResultFile) -> Result<PathBuf> {
        let dir = &self.options.local_dir;
        if !dir.is_dir() {
            return Err(ProfError::WriteFailed {
                path: dir.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "output directory does not exist"),
            });
        }

        let payload = if result.is_chunked() {
            self.fetch_chunked(result).await?
        } else {
            fetch_verified(
                self.gateway.as_ref(),
                &self.worker,
                &result.name,
                &result.checksum,
                self.options.retries,
                &self.cancel,
            )
            .await?
        };

        let decoded = codec::decode(self.options.compressor, &payload).map_err(|e| {
            ProfError::DecodeFailed {
                file: result.name.clone(),
                reason: e.to_string(),
            }
        })?;

        let local_name = match self.options.compressor {
            Compressor::None => naming::rename_uncompressed(&result.name, result.timestamp),
            _ => naming::rename(&result.name, result.timestamp),
        };
        let path = dir.join(naming::with_pod_prefix(&self.options.target_pod, &local_name));
        write_file(&path, &decoded).await?;

        info!(
            remote = %result.name,
            local = %path.display(),
            bytes = decoded.len(),
            "Result file retrieved"
        );
        Ok(path)
    }

    async fn fetch_chunked(&self, result: &ResultFile) -> Result<Vec<u8>> {
        let pool = Arc::new(Semaphore::new(self.options.pool_size.max(1)));
        // Stops queued and in-flight downloads once any chunk fails
        let stop = self.cancel.child_token();
        let mut tasks = JoinSet::new();

        for (index, chunk) in result.chunks.iter().cloned().enumerate() {
            let pool = pool.clone();
            let gateway = self.gateway.clone();
            let worker = self.worker.clone();
            let retries = self.options.retries;
            let stop = stop.clone();
            let path = self.options.local_dir.join(naming::with_pod_prefix(
                &self.options.target_pod,
                &naming::rename_chunk(&chunk.name, result.timestamp),
            ));

            tasks.spawn(async move {
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|_| ProfError::Cancelled)?;
                if stop.is_cancelled() {
                    return Err(ProfError::Cancelled);
                }
                let bytes = fetch_verified(
                    gateway.as_ref(),
                    &worker,
                    &chunk.name,
                    &chunk.checksum,
                    retries,
                    &stop,
                )
                .await?;
                write_file(&path, &bytes).await?;
                debug!(chunk = %chunk.name, local = %path.display(), "Chunk retrieved");
                Ok::<_, ProfError>((index, path))
            });
        }

        let mut written: Vec<Option<PathBuf>> = vec![None; result.chunks.len()];
        let mut first_error: Option<ProfError> = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok((index, path))) => {
                    written[index] = Some(path);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join_err) => ProfError::DownloadFailed {
                    file: result.name.clone(),
                    reason: join_err.to_string(),
                },
            };
            stop.cancel();
            if first_error.is_none() && !matches!(err, ProfError::Cancelled) {
                first_error = Some(err);
            }
        }

        if first_error.is_none() && self.cancel.is_cancelled() {
            first_error = Some(ProfError::Cancelled);
        }
        if let Some(e) = first_error {
            remove_chunks(written.iter().flatten()).await;
            return Err(e);
        }

        // The announced size is not trusted for allocation
        let mut joined = Vec::new();
        for path in written.iter().flatten() {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| ProfError::WriteFailed {
                    path: path.display().to_string(),
                    source: e,
                })?;
            joined.extend_from_slice(&bytes);
        }
        remove_chunks(written.iter().flatten()).await;

        let actual = md5_hex(&joined);
        if !actual.eq_ignore_ascii_case(&result.checksum) {
            return Err(ProfError::ChecksumMismatch {
                file: result.name.clone(),
                expected: result.checksum.clone(),
                actual,
            });
        }
        Ok(joined)
    }
}

/// `cat` a file in the worker, retrying only on checksum mismatch
async fn fetch_verified(
    gateway: &dyn ClusterGateway,
    worker: &WorkerRef,
    file: &str,
    checksum: &str,
    retries: u32,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let command = vec!["cat".to_string(), file.to_string()];
    let attempts = retries.saturating_add(1);
    let mut actual = String::new();

    for attempt in 1..=attempts {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(ProfError::Cancelled),
            res = gateway.exec_in_container(
                &worker.namespace,
                &worker.pod_name,
                &worker.container_name,
                &command,
            ) => res.map_err(|e| ProfError::DownloadFailed {
                file: file.to_string(),
                reason: e.to_string(),
            })?,
        };

        actual = md5_hex(&bytes);
        if actual.eq_ignore_ascii_case(checksum) {
            return Ok(bytes);
        }
        warn!(
            file = %file,
            attempt = attempt,
            attempts = attempts,
            expected = %checksum,
            actual = %actual,
            "Checksum mismatch on download"
        );
    }

    Err(ProfError::ChecksumMismatch {
        file: file.to_string(),
        expected: checksum.to_string(),
        actual,
    })
}

/// Write through a temporary sibling so a partial file never carries the
/// final name
async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let wrap = |e| ProfError::WriteFailed {
        path: path.display().to_string(),
        source: e,
    };
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await.map_err(wrap)?;
    tokio::fs::rename(&tmp, path).await.map_err(wrap)
}

async fn remove_chunks<'a>(paths: impl Iterator<Item = &'a PathBuf>) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove chunk file");
        }
    }
}
