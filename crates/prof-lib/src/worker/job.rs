//! Worker job scheduled next to the target pod

use super::{
    build_args, capabilities, image_name, new_session_id, WorkerVariant, SESSION_LABEL,
    WORKER_COMMAND, WORKER_CONTAINER_NAME,
};
use crate::catalog::Language;
use crate::config::ProfilerConfig;
use crate::error::Result;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, HostPathVolumeSource, LocalObjectReference, Pod, PodSpec,
    PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

const RUNTIME_VOLUME: &str = "target-filesystem";

fn job_name(language: Language, variant: WorkerVariant, id: &str) -> String {
    match variant {
        WorkerVariant::Bpf => format!(
            "{WORKER_CONTAINER_NAME}-{}-{}-{id}",
            language.dns_label(),
            variant.as_str()
        ),
        _ => format!("{WORKER_CONTAINER_NAME}-{}-{id}", variant.as_str()),
    }
}

fn object_meta(name: &str, namespace: &str, id: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(SESSION_LABEL.to_string(), id.to_string())])),
        annotations: Some(BTreeMap::from([
            ("sidecar.istio.io/inject".to_string(), "false".to_string()),
            ("linkerd.io/inject".to_string(), "disabled".to_string()),
        ])),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Build the worker job for `target_pod`, returning the fresh session id
/// alongside it
pub fn build_job(target_pod: &Pod, cfg: &ProfilerConfig) -> Result<(String, Job)> {
    let target = &cfg.target;
    let variant = WorkerVariant::select(target.language, target.tool)?;
    let resources = cfg.job.resource_requirements()?;

    let id = new_session_id();
    let name = job_name(target.language, variant, &id);
    let meta = object_meta(&name, &cfg.job.namespace, &id);

    let runtime_path = target.runtime_path.as_str();
    let mut volumes = vec![host_path_volume(RUNTIME_VOLUME, runtime_path)];
    let mut mounts = vec![read_only_mount(RUNTIME_VOLUME, runtime_path)];
    for (volume, path) in variant.extra_host_mounts() {
        volumes.push(host_path_volume(volume, path));
        mounts.push(read_only_mount(volume, path));
    }

    let container = Container {
        name: WORKER_CONTAINER_NAME.to_string(),
        image: Some(image_name(target, variant)),
        image_pull_policy: Some(target.image_pull_policy.to_string()),
        command: Some(vec![WORKER_COMMAND.to_string()]),
        args: Some(build_args(target_pod, target, &id)),
        volume_mounts: Some(mounts),
        security_context: Some(SecurityContext {
            privileged: Some(cfg.job.privileged),
            capabilities: Some(Capabilities {
                add: Some(capabilities(variant, &cfg.job.capabilities)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources,
        ..Default::default()
    };

    let pod_spec = PodSpec {
        host_pid: Some(true),
        node_name: target_pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        restart_policy: Some("Never".to_string()),
        tolerations: (!cfg.job.tolerations.is_empty()).then(|| cfg.job.tolerations.clone()),
        volumes: Some(volumes),
        image_pull_secrets: target
            .image_pull_secret
            .as_ref()
            .map(|secret| vec![LocalObjectReference {
                name: secret.clone().into(),
            }]),
        service_account_name: target.service_account.clone(),
        containers: vec![container],
        ..Default::default()
    };

    let job = Job {
        metadata: meta.clone(),
        spec: Some(JobSpec {
            parallelism: Some(1),
            completions: Some(1),
            ttl_seconds_after_finished: Some(5),
            backoff_limit: Some(2),
            template: PodTemplateSpec {
                metadata: Some(meta),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok((id, job))
}
