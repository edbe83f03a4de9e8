//! Profiling worker specifications
//!
//! Translates a resolved target pod plus a [`ProfilerConfig`] into the object
//! that runs the worker: a job on the target's node or an ephemeral container
//! inside the target pod. Both share image selection and the worker's
//! command line, which live here.

mod ephemeral;
mod job;

pub use ephemeral::{build_ephemeral_container, ephemeral_patch, EPHEMERAL_LANGUAGES};
pub use job::build_job;

use crate::catalog::{Language, ProfilingTool};
use crate::config::{LaunchMode, ProfilerConfig, TargetConfig};
use crate::duration;
use crate::error::{ProfError, Result};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};

/// Entry point of the worker image
pub const WORKER_COMMAND: &str = "/app/agent";
/// Name of the worker container inside job pods
pub const WORKER_CONTAINER_NAME: &str = "kubectl-prof";
/// Label carrying the session id on jobs and their pods
pub const SESSION_LABEL: &str = "kubectl-prof/id";

const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Image flavour and privileges of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerVariant {
    Jvm,
    Bpf,
    Btf,
    Perf,
    Python,
    Ruby,
}

impl WorkerVariant {
    /// Dispatch on `(language, tool)`.
    ///
    /// Native languages share one image per tool family. `cargo-flamegraph`
    /// and `node-dummy` ship in the bpf image, so they have no variant of
    /// their own.
    pub fn select(language: Language, tool: ProfilingTool) -> Result<Self> {
        if !language.supports(tool) {
            return Err(ProfError::UnsupportedLanguage {
                language: language.to_string(),
                tool: tool.to_string(),
            });
        }
        Ok(match language {
            Language::Java => Self::Jvm,
            Language::Python => Self::Python,
            Language::Ruby => Self::Ruby,
            Language::Go
            | Language::Clang
            | Language::ClangPlusPlus
            | Language::Node
            | Language::Rust => match tool {
                ProfilingTool::Perf => Self::Perf,
                ProfilingTool::Btf => Self::Btf,
                _ => Self::Bpf,
            },
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jvm => "jvm",
            Self::Bpf => "bpf",
            Self::Btf => "btf",
            Self::Perf => "perf",
            Self::Python => "python",
            Self::Ruby => "ruby",
        }
    }

    pub fn default_capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::Jvm => &["PERFMON", "SYSLOG"],
            Self::Perf => &["SYS_ADMIN", "PERFMON", "SYS_PTRACE", "SYSLOG"],
            Self::Btf => &["SYS_ADMIN", "PERFMON", "BPF"],
            Self::Bpf => &["SYS_ADMIN"],
            Self::Python | Self::Ruby => &["SYS_PTRACE"],
        }
    }

    /// Host paths mounted in addition to the container runtime root,
    /// as `(volume name, path)`
    pub fn extra_host_mounts(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Bpf => &[("modules", "/lib/modules")],
            Self::Btf => &[("sys-kernel-btf", "/sys/kernel/btf")],
            _ => &[],
        }
    }
}

/// Default capabilities followed by the user's extra ones, without repeats
pub fn capabilities(variant: WorkerVariant, extra: &[String]) -> Vec<String> {
    let mut caps: Vec<String> = variant
        .default_capabilities()
        .iter()
        .map(|c| c.to_string())
        .collect();
    for cap in extra {
        if !caps.contains(cap) {
            caps.push(cap.clone());
        }
    }
    caps
}

pub fn image_name(target: &TargetConfig, variant: WorkerVariant) -> String {
    if let Some(image) = &target.image {
        return image.clone();
    }
    let mut tag = format!("{}-{}", target.image_version, variant.as_str());
    if target.alpine {
        tag.push_str("-alpine");
    }
    format!("{}:{}", target.image_repository, tag)
}

/// Command line handed to the worker binary
pub fn build_args(target_pod: &Pod, target: &TargetConfig, job_id: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--target-container-runtime".into(),
        target.runtime.to_string(),
        "--target-container-runtime-path".into(),
        target.runtime_path.clone(),
        "--target-pod-uid".into(),
        target_pod.metadata.uid.clone().unwrap_or_default(),
        "--target-container-id".into(),
        target.container_id.clone().unwrap_or_default(),
        "--lang".into(),
        target.language.to_string(),
        "--event-type".into(),
        target.event.to_string(),
        "--compressor-type".into(),
        target.compressor.to_string(),
        "--profiling-tool".into(),
        target.tool.to_string(),
        "--output-type".into(),
        target.output.to_string(),
        "--grace-period-ending".into(),
        duration::format(target.grace_period_ending),
    ];

    if !job_id.is_empty() {
        args.extend(["--job-id".into(), job_id.to_string()]);
    }
    if !target.duration.is_zero() {
        args.extend(["--duration".into(), duration::format(target.duration)]);
    }
    if !target.interval.is_zero() {
        args.extend(["--interval".into(), duration::format(target.interval)]);
    }
    if target.print_logs {
        args.push("--print-logs".into());
    }
    if target.output.is_heap_artifact() {
        args.extend([
            "--heap-dump-split-in-chunk-size".into(),
            target.heap_dump_split_size.clone(),
        ]);
    }
    if let Some(pid) = &target.pid {
        args.extend(["--pid".into(), pid.clone()]);
    }
    if let Some(pgrep) = &target.pgrep {
        args.extend(["--pgrep".into(), pgrep.clone()]);
    }
    if target.language == Language::Node && target.node_heap_snapshot_signal > 0 {
        args.extend([
            "--node-heap-snapshot-signal".into(),
            target.node_heap_snapshot_signal.to_string(),
        ]);
    }

    args
}

/// Fresh id stamped on a worker job
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Five character suffix in the style of generated pod names
pub fn random_suffix() -> String {
    uuid::Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(5)
        .map(|b| NAME_SUFFIX_ALPHABET[*b as usize % NAME_SUFFIX_ALPHABET.len()] as char)
        .collect()
}

/// Worker object ready to be submitted
#[derive(Debug, Clone)]
pub enum WorkerSpec {
    Job { session_id: String, job: Box<Job> },
    Ephemeral { container: Box<EphemeralContainer> },
}

pub struct WorkerSpecBuilder;

impl WorkerSpecBuilder {
    /// Build the worker for `target_pod` according to the launch mode
    pub fn build(target_pod: &Pod, cfg: &ProfilerConfig) -> Result<WorkerSpec> {
        match cfg.mode {
            LaunchMode::Job => {
                let (session_id, job) = build_job(target_pod, cfg)?;
                Ok(WorkerSpec::Job {
                    session_id,
                    job: Box::new(job),
                })
            }
            LaunchMode::EphemeralContainer { .. } => {
                let container = build_ephemeral_container(target_pod, cfg)?;
                Ok(WorkerSpec::Ephemeral {
                    container: Box::new(container),
                })
            }
        }
    }
}
