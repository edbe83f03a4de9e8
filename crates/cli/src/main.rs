//! kubectl-prof
//!
//! Profiles workloads running on Kubernetes without restarting them. A
//! profiling worker is started next to the target pod, and its results are
//! copied back to the local machine.

mod commands;
mod config;
mod output;

use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Profile a pod, or every pod matching a selector
#[derive(Debug, Parser)]
#[command(name = "kubectl-prof")]
#[command(author, version, about = "Profile workloads running on Kubernetes", long_about = None)]
pub struct Cli {
    /// Name of the pod to profile
    pub pod: Option<String>,

    /// Language of the target process
    #[arg(long, short = 'l')]
    pub lang: String,

    /// Label selector of the pods to profile, instead of a pod name
    #[arg(long)]
    pub selector: Option<String>,

    /// Namespace of the profiling job (defaults to the kubeconfig namespace)
    #[arg(long, short = 'n')]
    pub namespace: Option<String>,

    /// Namespace of the target pod if different from the job namespace
    #[arg(long)]
    pub target_namespace: Option<String>,

    /// Container to profile when the pod has several
    #[arg(long)]
    pub target_container_name: Option<String>,

    /// Maximum profiling duration, e.g. 30s or 1m
    #[arg(long = "time", short = 't')]
    pub duration: Option<String>,

    /// Interval between partial results (defaults to the duration)
    #[arg(long)]
    pub interval: Option<String>,

    /// Event to sample
    #[arg(long, short = 'e', default_value = "itimer")]
    pub event: String,

    /// Profiling tool (defaults according to the language)
    #[arg(long)]
    pub tool: Option<String>,

    /// Output type (defaults according to the tool)
    #[arg(long, short = 'o')]
    pub output: Option<String>,

    /// PID of the target process if known
    #[arg(long)]
    pub pid: Option<String>,

    /// Name of the target process
    #[arg(long, short = 'p')]
    pub pgrep: Option<String>,

    /// Signal that makes a node process write a heap snapshot
    #[arg(long, default_value_t = 0)]
    pub node_heap_snapshot_signal: i32,

    /// Chunk size of heap dumps, in split(1) size format
    #[arg(long)]
    pub heap_dump_split_size: Option<String>,

    /// Time the worker waits before ending
    #[arg(long)]
    pub grace_period_ending: Option<String>,

    /// Directory receiving the result files
    #[arg(long)]
    pub local_path: Option<std::path::PathBuf>,

    /// Have the worker print its log messages
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub print_logs: bool,

    /// Print the worker manifest instead of running it
    #[arg(long)]
    pub dry_run: bool,

    /// Profiling sessions run at once with --selector (0 means all)
    #[arg(long, default_value_t = 0)]
    pub pool_size_profiling_jobs: usize,

    /// Parallel downloads of heap dump chunks
    #[arg(long)]
    pub pool_size_retrieve_chunks: Option<usize>,

    /// Retries of a download whose checksum does not match
    #[arg(long)]
    pub retrieve_file_retries: Option<u32>,

    /// Container runtime of the target node
    #[arg(long, short = 'r', default_value = "containerd")]
    pub runtime: String,

    /// Root path of the container runtime on the node
    #[arg(long)]
    pub runtime_path: Option<String>,

    /// Worker image, overriding the computed one
    #[arg(long)]
    pub image: Option<String>,

    /// Image pull policy of the worker
    #[arg(long, default_value = "IfNotPresent")]
    pub image_pull_policy: String,

    /// Secret used to pull the worker image
    #[arg(long)]
    pub image_pull_secret: Option<String>,

    /// Service account of the worker
    #[arg(long)]
    pub service_account: Option<String>,

    /// Target image is based on Alpine
    #[arg(long)]
    pub alpine: bool,

    #[arg(long)]
    pub cpu_requests: Option<String>,

    #[arg(long)]
    pub cpu_limits: Option<String>,

    #[arg(long)]
    pub mem_requests: Option<String>,

    #[arg(long)]
    pub mem_limits: Option<String>,

    /// Run the worker privileged
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub privileged: bool,

    /// Worker toleration as key[=value][:effect], repeatable
    #[arg(long = "tolerations")]
    pub tolerations: Vec<String>,

    /// Extra Linux capability of the worker, repeatable
    #[arg(long = "capabilities")]
    pub capabilities: Vec<String>,

    /// Inject the worker as an ephemeral container (experimental)
    #[arg(long)]
    pub ephemeral: bool,

    /// How long to wait for the ephemeral container to start
    #[arg(long)]
    pub ephemeral_timeout: Option<String>,

    /// Compression applied by the worker to its results
    #[arg(long, short = 'c', default_value = "gzip")]
    pub compressor: String,

    /// Log level of the worker and of local diagnostics
    #[arg(long)]
    pub log_level: Option<String>,

    /// Format of diagnostics written to stderr
    #[arg(long, value_enum, default_value_t = output::LogFormat::Text)]
    pub log_format: output::LogFormat,

    /// Path to the kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,
}

fn init_tracing(level: &str, format: output::LogFormat) {
    let level = match level {
        "panic" => "error",
        other => other,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        output::LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        output::LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    let settings = match config::Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            return ExitCode::FAILURE;
        }
    };

    let level = cli.log_level.clone().unwrap_or(settings.log_level.clone());
    init_tracing(&level, cli.log_format);

    match commands::profile::run(cli, settings).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
