//! Core data models shared by the session components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One slice of a chunked result file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFile {
    #[serde(rename = "file")]
    pub name: String,
    #[serde(rename = "file-size-in-bytes", default)]
    pub size: u64,
    #[serde(default)]
    pub checksum: String,
}

/// Artifact produced by the worker, as announced on its event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFile {
    /// Absolute path inside the worker container
    #[serde(rename = "file")]
    pub name: String,
    /// Omitted by the worker for empty files
    #[serde(rename = "file-size-in-bytes", default)]
    pub size: u64,
    /// md5 hex digest of the whole file
    #[serde(default)]
    pub checksum: String,
    /// When present, `name` is the concatenation of these in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkFile>,
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "result-type", default, skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    #[serde(rename = "compressor-type", default, skip_serializing_if = "Option::is_none")]
    pub compressor: Option<String>,
}

impl ResultFile {
    pub fn is_chunked(&self) -> bool {
        !self.chunks.is_empty()
    }
}

/// Where the worker of a session ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRef {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    /// Job owning the worker pod, absent for ephemeral containers
    pub job_name: Option<String>,
}

/// A retrieval that did not produce a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRetrieval {
    pub remote_file: String,
    pub error: String,
}

/// Outcome of one profiling session
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub target_pod: String,
    pub session_id: String,
    pub worker: Option<WorkerRef>,
    pub files: Vec<PathBuf>,
    pub failed_retrievals: Vec<FailedRetrieval>,
    /// Rendered objects when running dry
    pub manifest: Option<String>,
}
