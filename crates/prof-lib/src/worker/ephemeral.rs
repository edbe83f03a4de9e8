//! Worker injected into the target pod as an ephemeral container

use super::{
    build_args, capabilities, image_name, random_suffix, WorkerVariant, WORKER_COMMAND,
    WORKER_CONTAINER_NAME,
};
use crate::catalog::Language;
use crate::config::ProfilerConfig;
use crate::error::{ProfError, Result};
use k8s_openapi::api::core::v1::{Capabilities, EphemeralContainer, Pod, SecurityContext};
use serde_json::json;

/// Languages whose tooling can run from inside the target pod
pub const EPHEMERAL_LANGUAGES: &[Language] =
    &[Language::Java, Language::Python, Language::Go, Language::Node];

pub fn build_ephemeral_container(
    target_pod: &Pod,
    cfg: &ProfilerConfig,
) -> Result<EphemeralContainer> {
    let target = &cfg.target;
    if !EPHEMERAL_LANGUAGES.contains(&target.language) {
        return Err(ProfError::UnsupportedLanguage {
            language: target.language.to_string(),
            tool: target.tool.to_string(),
        });
    }
    let variant = WorkerVariant::select(target.language, target.tool)?;

    Ok(EphemeralContainer {
        name: format!("{WORKER_CONTAINER_NAME}-{}", random_suffix()),
        image: Some(image_name(target, variant)),
        image_pull_policy: Some(target.image_pull_policy.to_string()),
        command: Some(vec![WORKER_COMMAND.to_string()]),
        args: Some(build_args(target_pod, target, "")),
        target_container_name: target.container_name.clone(),
        security_context: Some(SecurityContext {
            privileged: Some(cfg.job.privileged),
            capabilities: Some(Capabilities {
                add: Some(capabilities(variant, &cfg.job.capabilities)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Append `container` to a copy of `original` and compute the strategic
/// merge patch between the two.
///
/// Ephemeral containers merge on `name`, so the patch only lists the
/// containers the copy has that the original lacks.
pub fn ephemeral_patch(original: &Pod, container: &EphemeralContainer) -> (Pod, serde_json::Value) {
    let mut updated = original.clone();
    updated
        .spec
        .get_or_insert_with(Default::default)
        .ephemeral_containers
        .get_or_insert_with(Vec::new)
        .push(container.clone());

    let existing: Vec<&str> = original
        .spec
        .as_ref()
        .and_then(|s| s.ephemeral_containers.as_ref())
        .map(|cs| cs.iter().map(|c| c.name.as_str()).collect())
        .unwrap_or_default();

    let added: Vec<&EphemeralContainer> = updated
        .spec
        .as_ref()
        .and_then(|s| s.ephemeral_containers.as_ref())
        .map(|cs| cs.iter().filter(|c| !existing.contains(&c.name.as_str())).collect())
        .unwrap_or_default();

    let patch = json!({ "spec": { "ephemeralContainers": added } });
    (updated, patch)
}
