//! End-to-end profiling sessions against the in-memory cluster

use flate2::write::GzEncoder;
use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use prof_lib::events::Event;
use prof_lib::gateway::ExecReply;
use prof_lib::retrieve::md5_hex;
use prof_lib::{
    ChunkFile, ClusterGateway, Compressor, FakeGateway, FanOutScheduler, GatewayError, JobConfig,
    Language, LaunchMode, OutputType, Printer, ProfError, ProfilerConfig, ResultFile,
    SessionOrchestrator, SessionTimings, TargetConfig,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TS: &str = "2023-02-28T11:44:12Z";

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(bytes).unwrap();
    enc.finish().unwrap()
}

fn target_pod(name: &str, containers: &[&str], phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("apps".into()),
            uid: Some(format!("uid-{name}")),
            labels: Some([("app".to_string(), "web".to_string())].into()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-a".into()),
            containers: containers
                .iter()
                .map(|c| Container {
                    name: c.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.into()),
            container_statuses: Some(
                containers
                    .iter()
                    .map(|c| ContainerStatus {
                        name: c.to_string(),
                        container_id: Some(format!("containerd://{c}-id")),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
    }
}

fn config(local: &Path) -> ProfilerConfig {
    let mut target = TargetConfig::new(Language::Java);
    target.namespace = "apps".into();
    target.pod_name = Some("p".into());
    target.output = OutputType::Flamegraph;
    target.compressor = Compressor::Gzip;
    target.local_path = local.to_path_buf();
    ProfilerConfig::new(target, JobConfig::new("profiling"))
}

fn result_line(name: &str, payload: &[u8], chunks: Vec<ChunkFile>) -> String {
    Event::Result(ResultFile {
        name: name.into(),
        size: payload.len() as u64,
        checksum: md5_hex(payload),
        chunks,
        timestamp: TS.parse().unwrap(),
        result_type: Some("flamegraph".into()),
        compressor: Some("gzip".into()),
    })
    .to_line()
}

fn session_lines(result: String) -> Vec<String> {
    vec![
        Event::started().to_line(),
        "some unrelated tool output".to_string(),
        result,
        Event::ended().to_line(),
    ]
}

fn orchestrator(fake: &Arc<FakeGateway>) -> SessionOrchestrator {
    SessionOrchestrator::new(fake.clone(), Printer::new(false)).with_timings(SessionTimings {
        poll_interval: Duration::from_millis(10),
        worker_timeout: Duration::from_secs(2),
    })
}

mod job_sessions {
    use super::*;

    #[tokio::test]
    async fn test_happy_path_retrieves_and_tears_down() {
        let dir = TempDir::new().unwrap();
        let packed = gzip(b"<svg>flame</svg>");
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_log_lines(session_lines(result_line("/tmp/flame.svg.gz", &packed, vec![])))
                .with_exec_reply("/tmp/flame.svg.gz", ExecReply::Output(packed)),
        );

        let report = orchestrator(&fake).run(config(dir.path())).await.unwrap();

        let expected = dir.path().join("p-flame-2023-02-28T11_44_12Z.svg");
        assert_eq!(report.files, vec![expected.clone()]);
        assert!(report.failed_retrievals.is_empty());
        assert_eq!(std::fs::read(&expected).unwrap(), b"<svg>flame</svg>");

        let jobs = fake.created_jobs();
        assert_eq!(jobs.len(), 1);
        let job_name = jobs[0].metadata.name.clone().unwrap();
        assert_eq!(fake.deleted_jobs(), vec![("profiling".to_string(), job_name)]);

        let worker = report.worker.unwrap();
        assert_eq!(worker.namespace, "profiling");
        assert_eq!(worker.container_name, "kubectl-prof");
        assert_eq!(
            fake.log_requests(),
            vec![(
                "profiling".to_string(),
                worker.pod_name.clone(),
                "kubectl-prof".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_worker_is_found_by_session_label() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_log_lines(vec![Event::started().to_line(), Event::ended().to_line()]),
        );

        let report = orchestrator(&fake).run(config(dir.path())).await.unwrap();

        assert!(!report.session_id.is_empty());
        assert_eq!(
            fake.label_queries(),
            vec![(
                "profiling".to_string(),
                format!("kubectl-prof/id={}", report.session_id)
            )]
        );
        assert!(report.files.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_renders_job_without_touching_cluster() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeGateway::new().with_pod(target_pod("p", &["app"], "Running")));
        let mut cfg = config(dir.path());
        cfg.target.dry_run = true;

        let report = SessionOrchestrator::new(fake.clone(), Printer::new(true))
            .run(cfg)
            .await
            .unwrap();

        let manifest = report.manifest.unwrap();
        assert!(manifest.contains("kind: Job"));
        assert!(manifest.contains(&report.session_id));
        assert!(fake.created_jobs().is_empty());
        assert!(fake.deleted_jobs().is_empty());
        assert!(fake.log_requests().is_empty());
    }

    #[tokio::test]
    async fn test_ambiguous_container_is_rejected_before_provisioning() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new().with_pod(target_pod("p", &["app", "sidecar"], "Running")),
        );

        let err = orchestrator(&fake)
            .run(config(dir.path()))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Could not determine container. please specify one of [app sidecar]"
        );
        assert!(fake.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_missing_pod() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeGateway::new());

        let err = orchestrator(&fake)
            .run(config(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProfError::PodNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_timeout_still_deletes_job() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .without_worker(),
        );

        let err = SessionOrchestrator::new(fake.clone(), Printer::new(false))
            .run(config(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, ProfError::WorkerTimeout(_)));
        assert!(fake.exec_calls().is_empty());
        assert!(fake.log_requests().is_empty());
        assert_eq!(fake.deleted_jobs().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_worker_deletes_job() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .without_worker(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = SessionOrchestrator::new(fake.clone(), Printer::new(false))
            .with_cancel(cancel)
            .run(config(dir.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, ProfError::Cancelled));
        let poll = SessionTimings::default().poll_interval;
        assert!(started.elapsed() < Duration::from_millis(2500) + poll);
        assert!(fake.log_requests().is_empty());
        assert_eq!(fake.deleted_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_worker_pod() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_worker_phase("Failed"),
        );

        let err = orchestrator(&fake)
            .run(config(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProfError::WorkerFailed(_)));
        assert_eq!(fake.deleted_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_error_event_fails_session() {
        let dir = TempDir::new().unwrap();
        let failure = r#"{"type":"error","data":{"reason":"could not attach to pid 1"}}"#;
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_log_lines(vec![Event::started().to_line(), failure.to_string()]),
        );

        let err = orchestrator(&fake)
            .run(config(dir.path()))
            .await
            .unwrap_err();
        match err {
            ProfError::WorkerFailed(reason) => assert_eq!(reason, "could not attach to pid 1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fake.deleted_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_closing_early_fails_session() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_log_lines(vec![Event::started().to_line()]),
        );

        let err = orchestrator(&fake)
            .run(config(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProfError::WorkerFailed(_)));
    }

    #[tokio::test]
    async fn test_teardown_error_replaces_success() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_log_lines(vec![Event::started().to_line(), Event::ended().to_line()])
                .with_delete_error(GatewayError::Transport("connection reset".into())),
        );

        let err = orchestrator(&fake)
            .run(config(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProfError::Cluster(GatewayError::Transport(_))));
    }

    #[tokio::test]
    async fn test_failed_retrieval_is_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_log_lines(session_lines(result_line("/tmp/gone.svg.gz", b"x", vec![])))
                .with_exec_reply("/tmp/gone.svg.gz", ExecReply::Fail("no such file".into())),
        );

        let report = orchestrator(&fake).run(config(dir.path())).await.unwrap();
        assert!(report.files.is_empty());
        assert_eq!(report.failed_retrievals.len(), 1);
        assert_eq!(report.failed_retrievals[0].remote_file, "/tmp/gone.svg.gz");
    }

    #[tokio::test]
    async fn test_chunk_transient_mismatch_is_retried() {
        let dir = TempDir::new().unwrap();
        let original = b"heap dump that needs two chunks".repeat(16);
        let packed = gzip(&original);
        let mid = packed.len() / 2;
        let parts = [&packed[..mid], &packed[mid..]];
        let chunks: Vec<ChunkFile> = parts
            .iter()
            .enumerate()
            .map(|(i, p)| ChunkFile {
                name: format!("/tmp/heap.hprof.gz.{i:02}"),
                size: p.len() as u64,
                checksum: md5_hex(p),
            })
            .collect();

        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_log_lines(session_lines(result_line(
                    "/tmp/heap.hprof.gz",
                    &packed,
                    chunks.clone(),
                )))
                .with_exec_reply(&chunks[0].name, ExecReply::Output(parts[0].to_vec()))
                .with_exec_reply(&chunks[1].name, ExecReply::Output(b"truncated".to_vec()))
                .with_exec_reply(&chunks[1].name, ExecReply::Output(parts[1].to_vec())),
        );
        let mut cfg = config(dir.path());
        cfg.target.output = OutputType::HeapDump;

        let report = orchestrator(&fake).run(cfg).await.unwrap();

        let expected = dir.path().join("p-heap-2023-02-28T11_44_12Z.hprof");
        assert_eq!(report.files, vec![expected.clone()]);
        assert_eq!(std::fs::read(&expected).unwrap(), original);
        assert_eq!(fake.exec_count(&chunks[0].name), 1);
        assert_eq!(fake.exec_count(&chunks[1].name), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}

mod ephemeral_sessions {
    use super::*;

    fn ephemeral(cfg: &mut ProfilerConfig) {
        cfg.mode = LaunchMode::EphemeralContainer {
            timeout: Duration::from_secs(2),
        };
    }

    #[tokio::test]
    async fn test_ephemeral_session_reads_from_target_pod() {
        let dir = TempDir::new().unwrap();
        let packed = gzip(b"<svg/>");
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_log_lines(session_lines(result_line("/tmp/flame.svg.gz", &packed, vec![])))
                .with_exec_reply("/tmp/flame.svg.gz", ExecReply::Output(packed)),
        );
        let mut cfg = config(dir.path());
        ephemeral(&mut cfg);

        let report = orchestrator(&fake).run(cfg).await.unwrap();

        assert_eq!(report.files.len(), 1);
        assert!(fake.created_jobs().is_empty());
        assert!(fake.deleted_jobs().is_empty());

        let patches = fake.patches();
        assert_eq!(patches.len(), 1);
        let added = patches[0]["spec"]["ephemeralContainers"].as_array().unwrap();
        assert_eq!(added.len(), 1);

        let worker = report.worker.unwrap();
        assert_eq!(worker.pod_name, "p");
        assert_eq!(worker.namespace, "apps");
        assert_eq!(added[0]["name"], worker.container_name.as_str());
        assert!(worker.job_name.is_none());
    }

    #[tokio::test]
    async fn test_unnamed_not_found_means_feature_disabled() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_patch_error(GatewayError::NotFound {
                    name: None,
                    message: "the server could not find the requested resource".into(),
                }),
        );
        let mut cfg = config(dir.path());
        ephemeral(&mut cfg);

        let err = orchestrator(&fake).run(cfg).await.unwrap_err();

        assert!(matches!(err, ProfError::FeatureDisabled));
        assert!(fake.log_requests().is_empty());
        assert!(fake.exec_calls().is_empty());
    }

    #[tokio::test]
    async fn test_other_patch_errors_are_wrapped() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("p", &["app"], "Running"))
                .with_patch_error(GatewayError::Api {
                    code: 403,
                    reason: "Forbidden".into(),
                    message: "forbidden".into(),
                }),
        );
        let mut cfg = config(dir.path());
        ephemeral(&mut cfg);

        let err = orchestrator(&fake).run(cfg).await.unwrap_err();
        assert!(matches!(err, ProfError::PatchFailed { ref pod, .. } if pod == "p"));
    }

    #[tokio::test]
    async fn test_dry_run_renders_patched_pod() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeGateway::new().with_pod(target_pod("p", &["app"], "Running")));
        let mut cfg = config(dir.path());
        ephemeral(&mut cfg);
        cfg.target.dry_run = true;

        let report = orchestrator(&fake).run(cfg).await.unwrap();

        let manifest = report.manifest.unwrap();
        assert!(manifest.contains("kind: Pod"));
        assert!(manifest.contains("ephemeralContainers"));
        assert!(fake.patches().is_empty());
    }
}

mod fan_out {
    use super::*;

    fn selector_config(local: &Path) -> ProfilerConfig {
        let mut cfg = config(local);
        cfg.target.pod_name = None;
        cfg.target.label_selector = Some("app=web".into());
        cfg
    }

    #[tokio::test]
    async fn test_only_running_pods_are_profiled() {
        let dir = TempDir::new().unwrap();
        let packed = gzip(b"<svg/>");
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("web-0", &["app"], "Running"))
                .with_pod(target_pod("web-1", &["app"], "Running"))
                .with_pod(target_pod("web-2", &["app"], "Pending"))
                .with_log_lines(session_lines(result_line("/tmp/flame.svg.gz", &packed, vec![])))
                .with_exec_reply("/tmp/flame.svg.gz", ExecReply::Output(packed)),
        );
        let mut cfg = selector_config(dir.path());
        cfg.target.pool_size_launch_jobs = 1;

        let outcome = FanOutScheduler::new(fake.clone(), Printer::new(false))
            .with_timings(SessionTimings {
                poll_interval: Duration::from_millis(10),
                worker_timeout: Duration::from_secs(2),
            })
            .run(cfg)
            .await
            .unwrap();

        assert_eq!(outcome.skipped, vec!["web-2".to_string()]);
        assert_eq!(outcome.failed(), 0);
        let mut pods: Vec<_> = outcome.sessions.iter().map(|s| s.target_pod.clone()).collect();
        pods.sort();
        assert_eq!(pods, vec!["web-0", "web-1"]);

        assert!(dir
            .path()
            .join("web-0-flame-2023-02-28T11_44_12Z.svg")
            .exists());
        assert!(dir
            .path()
            .join("web-1-flame-2023-02-28T11_44_12Z.svg")
            .exists());
        assert_eq!(fake.created_jobs().len(), 2);
        assert_eq!(fake.deleted_jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_pool_size_bounds_concurrent_sessions() {
        let dir = TempDir::new().unwrap();
        let packed = gzip(b"<svg/>");
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("web-0", &["app"], "Running"))
                .with_pod(target_pod("web-1", &["app"], "Running"))
                .with_pod(target_pod("web-2", &["app"], "Running"))
                .with_log_lines(session_lines(result_line("/tmp/flame.svg.gz", &packed, vec![])))
                .with_exec_reply("/tmp/flame.svg.gz", ExecReply::Output(packed)),
        );
        let mut cfg = selector_config(dir.path());
        cfg.target.pool_size_launch_jobs = 1;

        let outcome = FanOutScheduler::new(fake.clone(), Printer::new(false))
            .with_timings(SessionTimings {
                poll_interval: Duration::from_millis(10),
                worker_timeout: Duration::from_secs(2),
            })
            .run(cfg)
            .await
            .unwrap();

        assert_eq!(outcome.sessions.len(), 3);
        assert_eq!(outcome.failed(), 0);
        assert_eq!(fake.created_jobs().len(), 3);
        assert_eq!(fake.max_live_jobs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_every_session_and_deletes_jobs() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("web-0", &["app"], "Running"))
                .with_pod(target_pod("web-1", &["app"], "Running"))
                .without_worker(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let outcome = FanOutScheduler::new(fake.clone(), Printer::new(false))
            .with_cancel(cancel)
            .run(selector_config(dir.path()))
            .await
            .unwrap();

        assert_eq!(outcome.failed(), 2);
        assert!(outcome
            .sessions
            .iter()
            .all(|s| matches!(s.result, Err(ProfError::Cancelled))));
        // Unbounded pool: both workers were pending together
        assert_eq!(fake.max_live_jobs(), 2);
        assert_eq!(fake.deleted_jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_no_matching_pods() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(FakeGateway::new());

        let err = FanOutScheduler::new(fake.clone(), Printer::new(false))
            .run(selector_config(dir.path()))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "No pods found in namespace apps with label selector app=web"
        );
        assert_eq!(
            fake.list_pods_by_label("apps", "app=web").await.unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn test_session_failure_surfaces_first_error() {
        let dir = TempDir::new().unwrap();
        let fake = Arc::new(
            FakeGateway::new()
                .with_pod(target_pod("web-0", &["app", "sidecar"], "Running"))
                .with_pod(target_pod("web-1", &["app", "sidecar"], "Running")),
        );

        let outcome = FanOutScheduler::new(fake.clone(), Printer::new(false))
            .run(selector_config(dir.path()))
            .await
            .unwrap();

        assert_eq!(outcome.failed(), 2);
        assert!(matches!(
            outcome.into_result(),
            Err(ProfError::AmbiguousContainer(_))
        ));
        assert!(fake.created_jobs().is_empty());
    }
}
