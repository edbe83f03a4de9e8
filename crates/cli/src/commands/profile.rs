//! The profiling command
//!
//! Flags are validated and turned into a [`ProfilerConfig`] before any
//! cluster call. A pod name runs one session, `--selector` fans out over the
//! matching pods.

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use prof_lib::catalog::{
    self, ContainerRuntime, ImagePullPolicy, Language, LogLevel, OutputType, ProfilingEvent,
    ProfilingTool,
};
use prof_lib::config::{parse_toleration, JobConfig, LaunchMode, ProfilerConfig, TargetConfig};
use prof_lib::{
    duration, ClusterGateway, Compressor, FanOutScheduler, KubeGateway, Printer, ProfError,
    SessionOrchestrator,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::output::{print_summary, print_warning};
use crate::Cli;

/// A configuration ready to run, plus the substitutions made on the way
#[derive(Debug)]
pub struct Prepared {
    pub config: ProfilerConfig,
    pub notices: Vec<String>,
}

fn optional_duration(value: Option<&str>) -> prof_lib::Result<Option<Duration>> {
    value.map(duration::parse).transpose()
}

/// Validate flags into a profiler configuration
pub fn build_config(cli: &Cli, settings: &Settings) -> prof_lib::Result<Prepared> {
    let language: Language = cli.lang.parse()?;
    let runtime: ContainerRuntime = cli.runtime.parse()?;
    let event: ProfilingEvent = cli.event.parse()?;
    let log_level: LogLevel = cli
        .log_level
        .as_deref()
        .unwrap_or(&settings.log_level)
        .parse()?;
    let compressor: Compressor = cli.compressor.parse()?;
    let pull_policy: ImagePullPolicy = cli.image_pull_policy.parse()?;
    let tool = cli
        .tool
        .as_deref()
        .map(str::parse::<ProfilingTool>)
        .transpose()?;
    let output = cli
        .output
        .as_deref()
        .map(str::parse::<OutputType>)
        .transpose()?;
    let selection = catalog::select(language, tool, output);

    let job_namespace = cli.namespace.clone().unwrap_or_else(|| "default".to_string());
    let mut job = JobConfig::new(job_namespace.clone());
    job.requests.cpu = cli.cpu_requests.clone();
    job.requests.memory = cli.mem_requests.clone();
    job.limits.cpu = cli.cpu_limits.clone();
    job.limits.memory = cli.mem_limits.clone();
    job.resource_requirements()?;

    if let Some(pid) = &cli.pid {
        if pid.parse::<u32>().is_err() {
            return Err(ProfError::invalid(format!("pid {pid:?} is not numeric")));
        }
    }
    job.tolerations = cli
        .tolerations
        .iter()
        .map(|t| parse_toleration(t))
        .collect::<prof_lib::Result<_>>()?;
    job.privileged = cli.privileged;
    job.capabilities = cli.capabilities.clone();

    if cli.pod.is_some() && cli.selector.is_some() {
        return Err(ProfError::invalid(
            "specify either a pod name or --selector, not both",
        ));
    }

    let time = optional_duration(cli.duration.as_deref())?.unwrap_or(Duration::ZERO);
    let interval = optional_duration(cli.interval.as_deref())?.unwrap_or(time);
    let grace_period_ending = duration::parse(
        cli.grace_period_ending
            .as_deref()
            .unwrap_or(&settings.grace_period_ending),
    )?;
    let ephemeral_timeout = duration::parse(
        cli.ephemeral_timeout
            .as_deref()
            .unwrap_or(&settings.ephemeral_timeout),
    )?;

    let mut target = TargetConfig::new(language);
    target.namespace = cli
        .target_namespace
        .clone()
        .unwrap_or_else(|| job_namespace.clone());
    target.pod_name = cli.pod.clone();
    target.label_selector = cli.selector.clone();
    target.container_name = cli.target_container_name.clone();
    target.tool = selection.tool;
    target.output = selection.output;
    target.event = event;
    target.duration = time;
    target.interval = interval;
    target.grace_period_ending = grace_period_ending;
    target.local_path = cli
        .local_path
        .clone()
        .unwrap_or_else(|| settings.local_path.clone());
    target.pid = cli.pid.clone();
    target.pgrep = cli.pgrep.clone();
    target.node_heap_snapshot_signal = cli.node_heap_snapshot_signal;
    target.compressor = compressor;
    target.heap_dump_split_size = cli
        .heap_dump_split_size
        .clone()
        .unwrap_or_else(|| settings.heap_dump_split_size.clone());
    target.pool_size_retrieve_chunks = cli
        .pool_size_retrieve_chunks
        .unwrap_or(settings.pool_size_retrieve_chunks);
    target.retrieve_file_retries = cli
        .retrieve_file_retries
        .unwrap_or(settings.retrieve_file_retries);
    target.pool_size_launch_jobs = cli.pool_size_profiling_jobs;
    target.runtime = runtime;
    target.runtime_path = cli
        .runtime_path
        .clone()
        .unwrap_or_else(|| runtime.default_root_path().to_string());
    target.image = cli.image.clone();
    target.image_repository = settings.image_repository.clone();
    target.image_version = settings.image_version.clone();
    target.alpine = cli.alpine;
    target.image_pull_policy = pull_policy;
    target.image_pull_secret = cli.image_pull_secret.clone();
    target.service_account = cli.service_account.clone();
    target.dry_run = cli.dry_run;
    target.print_logs = cli.print_logs;

    let mut config = ProfilerConfig::new(target, job);
    config.log_level = log_level;
    if cli.ephemeral {
        config.mode = LaunchMode::EphemeralContainer {
            timeout: ephemeral_timeout,
        };
    }
    config.validate()?;

    Ok(Prepared {
        config,
        notices: selection.notices,
    })
}

async fn connect(kubeconfig: Option<&str>) -> Result<Client> {
    let config = match kubeconfig {
        // A KUBECONFIG list is left to the inferred loader
        Some(path) if !path.contains(':') => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {path}"))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        _ => Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };
    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// Cancel the sessions on Ctrl-C so workers still get torn down
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping profiling sessions");
            token.cancel();
        }
    });
    cancel
}

/// Run the command. Session failures were already reported by the sessions
/// themselves and only show up in the exit code.
pub async fn run(cli: Cli, settings: Settings) -> Result<ExitCode> {
    let Prepared {
        mut config,
        notices,
    } = build_config(&cli, &settings)?;
    if !config.target.dry_run {
        for notice in &notices {
            print_warning(notice);
        }
    }

    let client = connect(cli.kubeconfig.as_deref()).await?;
    if cli.namespace.is_none() {
        let namespace = client.default_namespace().to_string();
        if cli.target_namespace.is_none() {
            config.target.namespace = namespace.clone();
        }
        config.job.namespace = namespace;
    }
    info!(
        job_namespace = %config.job.namespace,
        target_namespace = %config.target.namespace,
        "Connected to cluster"
    );

    let gateway: Arc<dyn ClusterGateway> = Arc::new(KubeGateway::new(client));
    let printer = Printer::new(config.target.dry_run);
    let cancel = cancel_on_interrupt();

    if config.target.label_selector.is_some() {
        let dry_run = config.target.dry_run;
        let outcome = match FanOutScheduler::new(gateway, printer)
            .with_cancel(cancel)
            .run(config)
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => return Ok(ExitCode::FAILURE),
        };
        if !dry_run {
            print_summary(&outcome);
        }
        return Ok(if outcome.failed() > 0 {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        });
    }

    match SessionOrchestrator::new(gateway, printer)
        .with_cancel(cancel)
        .run(config)
        .await
    {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(_) => Ok(ExitCode::FAILURE),
    }
}
