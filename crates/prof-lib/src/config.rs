//! Profiling session configuration
//!
//! A [`ProfilerConfig`] is built once from user input and cloned for every
//! target pod. Sessions only ever write the derived fields of their own copy
//! (resolved pod name and container id).

use crate::catalog::{
    Compressor, ContainerRuntime, ImagePullPolicy, Language, LogLevel, OutputType,
    ProfilingEvent, ProfilingTool,
};
use crate::error::{ProfError, Result};
use k8s_openapi::api::core::v1::{ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_IMAGE_REPOSITORY: &str = "josepdcs/kubectl-prof";
pub const DEFAULT_HEAP_DUMP_SPLIT_SIZE: &str = "50M";
pub const DEFAULT_POOL_SIZE_RETRIEVE_CHUNKS: usize = 5;
pub const DEFAULT_RETRIEVE_FILE_RETRIES: u32 = 3;
pub const DEFAULT_GRACE_PERIOD_ENDING: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_EPHEMERAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const QUANTITY_PATTERN: &str =
    r"^[0-9]+(\.[0-9]+)?(m|k|M|G|T|P|E|Ki|Mi|Gi|Ti|Pi|Ei|[eE][0-9]+)?$";

fn quantity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(QUANTITY_PATTERN).expect("quantity pattern compiles"))
}

/// Check a Kubernetes resource quantity such as `100m`, `1.5`, `256Mi`
pub fn validate_quantity(what: &str, value: &str) -> Result<()> {
    if quantity_regex().is_match(value) {
        Ok(())
    } else {
        Err(ProfError::invalid(format!(
            "malformed {what} quantity {value:?}"
        )))
    }
}

/// What to profile and how
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub namespace: String,
    pub pod_name: Option<String>,
    pub label_selector: Option<String>,
    pub container_name: Option<String>,
    /// Filled in when the target pod is resolved
    pub container_id: Option<String>,
    pub language: Language,
    pub tool: ProfilingTool,
    pub event: ProfilingEvent,
    pub output: OutputType,
    pub duration: Duration,
    pub interval: Duration,
    pub grace_period_ending: Duration,
    pub local_path: PathBuf,
    pub pid: Option<String>,
    pub pgrep: Option<String>,
    pub node_heap_snapshot_signal: i32,
    pub compressor: Compressor,
    pub heap_dump_split_size: String,
    pub pool_size_retrieve_chunks: usize,
    pub retrieve_file_retries: u32,
    pub pool_size_launch_jobs: usize,
    pub runtime: ContainerRuntime,
    pub runtime_path: String,
    /// Full image reference, bypasses repository/version/variant selection
    pub image: Option<String>,
    pub image_repository: String,
    pub image_version: String,
    pub alpine: bool,
    pub image_pull_policy: ImagePullPolicy,
    pub image_pull_secret: Option<String>,
    pub service_account: Option<String>,
    pub dry_run: bool,
    pub print_logs: bool,
}

impl TargetConfig {
    pub fn new(language: Language) -> Self {
        let tool = language.default_tool(None);
        let runtime = ContainerRuntime::default();
        Self {
            namespace: "default".to_string(),
            pod_name: None,
            label_selector: None,
            container_name: None,
            container_id: None,
            language,
            tool,
            event: ProfilingEvent::default(),
            output: tool.default_output(),
            duration: Duration::ZERO,
            interval: Duration::ZERO,
            grace_period_ending: DEFAULT_GRACE_PERIOD_ENDING,
            local_path: PathBuf::from("."),
            pid: None,
            pgrep: None,
            node_heap_snapshot_signal: 0,
            compressor: Compressor::default(),
            heap_dump_split_size: DEFAULT_HEAP_DUMP_SPLIT_SIZE.to_string(),
            pool_size_retrieve_chunks: DEFAULT_POOL_SIZE_RETRIEVE_CHUNKS,
            retrieve_file_retries: DEFAULT_RETRIEVE_FILE_RETRIES,
            pool_size_launch_jobs: 0,
            runtime,
            runtime_path: runtime.default_root_path().to_string(),
            image: None,
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            image_version: env!("CARGO_PKG_VERSION").to_string(),
            alpine: false,
            image_pull_policy: ImagePullPolicy::default(),
            image_pull_secret: None,
            service_account: None,
            dry_run: false,
            print_logs: false,
        }
    }
}

/// CPU and memory amounts for either requests or limits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceConfig {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

impl ResourceConfig {
    fn validate(&self, kind: &str) -> Result<()> {
        if let Some(cpu) = &self.cpu {
            validate_quantity(&format!("cpu {kind}"), cpu)?;
        }
        if let Some(memory) = &self.memory {
            validate_quantity(&format!("memory {kind}"), memory)?;
        }
        Ok(())
    }

    fn to_map(&self) -> Option<BTreeMap<String, Quantity>> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &self.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &self.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        (!map.is_empty()).then_some(map)
    }
}

/// Cluster-side envelope of the worker job
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub namespace: String,
    pub requests: ResourceConfig,
    pub limits: ResourceConfig,
    pub tolerations: Vec<Toleration>,
    pub privileged: bool,
    /// Added on top of the worker variant's own capabilities
    pub capabilities: Vec<String>,
}

impl JobConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn resource_requirements(&self) -> Result<Option<ResourceRequirements>> {
        self.requests.validate("requests")?;
        self.limits.validate("limits")?;

        let requests = self.requests.to_map();
        let limits = self.limits.to_map();
        if requests.is_none() && limits.is_none() {
            return Ok(None);
        }
        Ok(Some(ResourceRequirements {
            requests,
            limits,
            ..Default::default()
        }))
    }
}

/// How the worker is attached to the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// A privileged job scheduled on the target's node
    Job,
    /// A container injected into the running target pod
    EphemeralContainer { timeout: Duration },
}

impl Default for LaunchMode {
    fn default() -> Self {
        Self::Job
    }
}

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub target: TargetConfig,
    pub job: JobConfig,
    pub mode: LaunchMode,
    pub log_level: LogLevel,
}

impl ProfilerConfig {
    pub fn new(target: TargetConfig, job: JobConfig) -> Self {
        Self {
            target,
            job,
            mode: LaunchMode::Job,
            log_level: LogLevel::default(),
        }
    }

    /// Checks that do not need the cluster
    pub fn validate(&self) -> Result<()> {
        let t = &self.target;
        if t.pod_name.is_none() && t.label_selector.is_none() {
            return Err(ProfError::invalid(
                "a target pod name or a label selector is required",
            ));
        }
        if let Some(pid) = &t.pid {
            if pid.parse::<u32>().is_err() {
                return Err(ProfError::invalid(format!("pid {pid:?} is not numeric")));
            }
        }
        if t.output.is_heap_artifact() {
            validate_quantity("heap dump split", &t.heap_dump_split_size)?;
        }
        self.job.resource_requirements()?;
        Ok(())
    }
}

/// Parse `key[=value][:effect]` into a toleration.
///
/// A value selects the `Equal` operator, no value selects `Exists`. The
/// effect defaults to `NoSchedule`.
pub fn parse_toleration(spec: &str) -> Result<Toleration> {
    let (kv, effect) = match spec.rsplit_once(':') {
        Some((kv, effect)) => (kv, effect),
        None => (spec, "NoSchedule"),
    };
    if !matches!(effect, "NoSchedule" | "PreferNoSchedule" | "NoExecute") {
        return Err(ProfError::invalid(format!(
            "invalid toleration effect {effect:?} in {spec:?}"
        )));
    }

    let (key, value) = match kv.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (kv, None),
    };
    if key.is_empty() {
        return Err(ProfError::invalid(format!(
            "toleration {spec:?} has an empty key"
        )));
    }

    Ok(Toleration {
        key: Some(key.to_string()),
        operator: Some(if value.is_some() { "Equal" } else { "Exists" }.to_string()),
        value: value.map(str::to_string),
        effect: Some(effect.to_string()),
        ..Default::default()
    })
}
