//! End-to-end lifecycle test against a real Docker daemon.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use skiff_backend::docker::DockerBackend;
use skiff_backend::qemu::{QemuBackend, QemuConfig};
use skiff_backend::require_docker;
use skiff_common::{ContainerSpec, ResourceBackend, ResourceSpec, ResourceState};
use skiff_orchestrator::{Orchestrator, OrchestratorConfig};

#[tokio::test]
#[serial]
async fn container_lifecycle_end_to_end() {
    require_docker!();

    let docker = Arc::new(DockerBackend::connect().expect("connect"));
    docker
        .pull("alpine:latest", |_| {})
        .await
        .expect("pull alpine");

    let storage = tempfile::tempdir().unwrap();
    let qemu = Arc::new(QemuBackend::new(QemuConfig {
        storage_dir: storage.path().to_path_buf(),
        ..Default::default()
    }));
    let orchestrator = Orchestrator::new(
        docker.clone(),
        qemu,
        OrchestratorConfig {
            probe_interval: None,
            ..Default::default()
        },
    );

    let id = orchestrator
        .provision(ResourceSpec::Container(ContainerSpec {
            name: "skiff-e2e-sleeper".to_string(),
            image: "alpine:latest".to_string(),
            command: vec!["sleep".to_string(), "30".to_string()],
            env: None,
            memory_mb: None,
            cpu_count: None,
        }))
        .await
        .expect("provision");

    let snapshot = orchestrator
        .wait_settled(&id, Duration::from_secs(30))
        .await
        .expect("get");
    assert_eq!(snapshot.state, ResourceState::Running, "{snapshot:?}");
    assert!(snapshot.backend_ref.is_some());

    orchestrator.stop(&id).await.expect("stop");
    let snapshot = orchestrator.get(&id).await.expect("get");
    assert_eq!(snapshot.state, ResourceState::Stopped);

    // Remove the stopped container so reruns start clean.
    docker.reap(&id).await;
}
