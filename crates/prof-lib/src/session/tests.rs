//! Tests for target resolution helpers

use super::*;
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateWaiting, ContainerStatus, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn pod(containers: &[&str], ids: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("web-0".into()),
            namespace: Some("apps".into()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: containers
                .iter()
                .map(|name| Container {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".into()),
            container_statuses: Some(
                ids.iter()
                    .map(|(name, id)| ContainerStatus {
                        name: name.to_string(),
                        container_id: Some(id.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

#[test]
fn test_single_container_needs_no_name() {
    let p = pod(&["app"], &[]);
    assert_eq!(select_container(&p, None).unwrap(), "app");
    assert_eq!(select_container(&p, Some("other")).unwrap(), "app");
}

#[test]
fn test_named_container_among_many() {
    let p = pod(&["app", "sidecar"], &[]);
    assert_eq!(select_container(&p, Some("sidecar")).unwrap(), "sidecar");
}

#[test]
fn test_ambiguous_container_lists_all_names() {
    let p = pod(&["app", "sidecar"], &[]);
    let err = select_container(&p, None).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Could not determine container. please specify one of [app sidecar]"
    );
    assert!(matches!(
        select_container(&p, Some("missing")),
        Err(ProfError::AmbiguousContainer(_))
    ));
}

#[test]
fn test_container_id_lookup() {
    let p = pod(&["app", "sidecar"], &[("app", "containerd://abc"), ("sidecar", "")]);
    assert_eq!(container_id(&p, "app").unwrap(), "containerd://abc");

    let err = container_id(&p, "sidecar").unwrap_err();
    assert_eq!(err.to_string(), "Could not find container id for sidecar");
    assert!(matches!(
        container_id(&p, "nope"),
        Err(ProfError::ContainerIdNotFound(_))
    ));
}

#[test]
fn test_ephemeral_started_needs_running_or_terminated_state() {
    let mut p = pod(&["app"], &[]);
    assert!(!ephemeral_started(&p, "kubectl-prof-abcde"));

    p.status.as_mut().unwrap().ephemeral_container_statuses = Some(vec![ContainerStatus {
        name: "kubectl-prof-abcde".into(),
        state: Some(ContainerState {
            waiting: Some(ContainerStateWaiting::default()),
            ..Default::default()
        }),
        ..Default::default()
    }]);
    assert!(!ephemeral_started(&p, "kubectl-prof-abcde"));
}

#[test]
fn test_pod_phase_defaults_to_unknown() {
    assert_eq!(pod_phase(&Pod::default()), "Unknown");
    assert_eq!(pod_phase(&pod(&["app"], &[])), "Running");
}
