//! Error types surfaced by profiling sessions

use crate::gateway::GatewayError;
use thiserror::Error;

pub type Result<T, E = ProfError> = std::result::Result<T, E>;

/// Everything a profiling session can fail with
#[derive(Debug, Error)]
pub enum ProfError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("pod {name} not found in namespace {namespace}")]
    PodNotFound { name: String, namespace: String },

    #[error("No pods found in namespace {namespace} with label selector {selector}")]
    NoMatchingPods { namespace: String, selector: String },

    #[error("Could not determine container. please specify one of [{}]", .0.join(" "))]
    AmbiguousContainer(Vec<String>),

    #[error("Could not find container id for {0}")]
    ContainerIdNotFound(String),

    #[error("unsupported language {language} with profiling tool {tool}")]
    UnsupportedLanguage { language: String, tool: String },

    #[error("profiling worker failed: {0}")]
    WorkerFailed(String),

    #[error("timed out after {0:?} waiting for the profiling worker to run")]
    WorkerTimeout(std::time::Duration),

    #[error("ephemeral containers are disabled for this cluster")]
    FeatureDisabled,

    #[error("failed to patch ephemeral containers of pod {pod}: {source}")]
    PatchFailed {
        pod: String,
        #[source]
        source: GatewayError,
    },

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download {file}: {reason}")]
    DownloadFailed { file: String, reason: String },

    #[error("failed to decode {file}: {reason}")]
    DecodeFailed { file: String, reason: String },

    #[error("failed to render manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error(transparent)]
    Cluster(#[from] GatewayError),

    #[error("profiling session cancelled")]
    Cancelled,

    #[error("profiling session panicked: {0}")]
    SessionPanicked(String),
}

impl ProfError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Short stable name of the error kind, used in logs and summaries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::PodNotFound { .. } => "PodNotFound",
            Self::NoMatchingPods { .. } => "NoMatchingPods",
            Self::AmbiguousContainer(_) => "AmbiguousContainer",
            Self::ContainerIdNotFound(_) => "ContainerIdNotFound",
            Self::UnsupportedLanguage { .. } => "UnsupportedLanguage",
            Self::WorkerFailed(_) => "WorkerFailed",
            Self::WorkerTimeout(_) => "WorkerTimeout",
            Self::FeatureDisabled => "FeatureDisabled",
            Self::PatchFailed { .. } => "PatchFailed",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::WriteFailed { .. } => "WriteFailed",
            Self::DownloadFailed { .. } => "DownloadFailed",
            Self::DecodeFailed { .. } => "DecodeFailed",
            Self::Manifest(_) => "Manifest",
            Self::Cluster(_) => "Cluster",
            Self::Cancelled => "Cancelled",
            Self::SessionPanicked(_) => "SessionPanicked",
        }
    }
}
