//! End-to-end rolling updates over an in-memory daemon.
//!
//! A cluster holds three containers on `testimage:1` plus one pinned to a
//! bare image digest. Each strategy must move the tagged three to
//! `testimage:2`, leave the digest-pinned one untouched, and reach
//! COMPLETED.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{image_id_for, DockerServiceMock};
use dockfleet::batch::{self, DockerHealthCheck, TagReconcileConfig};
use dockfleet::bus::EventBus;
use dockfleet::docker::DockerService;
use dockfleet::jobs::{JobParameters, JobStatus, JobsManager, ServiceResolver};
use dockfleet::registry::RegistryRepository;

const TESTIMAGE: &str = "testimage";
const SRC_VERSION: &str = "1";
const TARGET_VERSION: &str = "2";
const TESTCLUSTER: &str = "testcluster";
const IMAGE_ID: &str = "sha256:4355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd865";

struct MockResolver(Arc<DockerServiceMock>);

impl ServiceResolver for MockResolver {
    fn resolve(&self, cluster: &str) -> Option<Arc<dyn DockerService>> {
        (cluster == self.0.cluster_name()).then(|| self.0.clone() as Arc<dyn DockerService>)
    }
}

fn setup() -> (Arc<DockerServiceMock>, Arc<JobsManager>, HashSet<String>) {
    let mock = DockerServiceMock::new(TESTCLUSTER);
    let src = format!("{TESTIMAGE}:{SRC_VERSION}");
    mock.add_container("one-container", &src);
    mock.add_container("two-container", &src);
    mock.add_container("three-container", &src);
    mock.add_container("buggy-container", IMAGE_ID);

    let manager = JobsManager::new(
        Arc::new(EventBus::new()),
        Arc::new(MockResolver(mock.clone())),
    );
    batch::register_jobs(
        &manager,
        RegistryRepository::new(Vec::new()),
        DockerHealthCheck::shared(),
        TagReconcileConfig::default(),
    );

    let names: HashSet<String> = [
        "one-container",
        "two-container",
        "three-container",
        "buggy-container",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    (mock, manager, names)
}

async fn run_strategy(manager: &Arc<JobsManager>, strategy: &str) -> JobStatus {
    let params = JobParameters::builder(format!("job.updateContainers.{strategy}"))
        .parameter("cluster", TESTCLUSTER)
        .parameter("image", "*")
        .parameter("target_version", TARGET_VERSION)
        .parameter("health_check_enabled", true)
        .build();
    let instance = manager.submit(params).expect("job submission");
    instance.at_end().await
}

/// Every container still exists under its original name, the tagged ones
/// moved to the target image, the digest-pinned one did not.
fn check_containers(mock: &DockerServiceMock, names: &HashSet<String>) {
    let target = format!("{TESTIMAGE}:{TARGET_VERSION}");
    let all = mock.snapshot();
    assert_eq!(all.len(), names.len(), "container count changed");
    for c in &all {
        assert!(
            names.contains(&c.name),
            "unexpected container name '{}'",
            c.name
        );
        assert!(c.running, "container '{}' is not running", c.name);
        if c.image == IMAGE_ID {
            continue;
        }
        assert_eq!(c.image, target, "container '{}' missed the update", c.name);
    }
    // The digest-pinned container must have survived untouched.
    assert!(all.iter().any(|c| c.image == IMAGE_ID));
}

#[tokio::test]
async fn test_stop_then_start_each() {
    let (mock, manager, names) = setup();
    let end = run_strategy(&manager, "stopThenStartEach").await;
    assert_eq!(end, JobStatus::Completed);
    check_containers(&mock, &names);
}

#[tokio::test]
async fn test_stop_then_start_all() {
    let (mock, manager, names) = setup();
    let end = run_strategy(&manager, "stopThenStartAll").await;
    assert_eq!(end, JobStatus::Completed);
    check_containers(&mock, &names);
}

#[tokio::test]
async fn test_start_then_stop_each() {
    let (mock, manager, names) = setup();
    // Audit availability of the updated services on every state change.
    mock.watch_service("one-container");
    mock.watch_service("two-container");
    mock.watch_service("three-container");

    let end = run_strategy(&manager, "startThenStopEach").await;
    assert_eq!(end, JobStatus::Completed);
    check_containers(&mock, &names);

    // At no instant did a service lose its last running instance.
    assert!(
        mock.violations().is_empty(),
        "availability violations: {:?}",
        mock.violations()
    );
}

#[tokio::test]
async fn test_update_pulls_target_image() {
    let (mock, manager, _) = setup();
    run_strategy(&manager, "stopThenStartEach").await;

    let target = format!("{TESTIMAGE}:{TARGET_VERSION}");
    let pulled = mock.pulled_images();
    assert!(
        pulled.iter().any(|p| p == &target),
        "target image was never pulled: {pulled:?}"
    );
    // The digest-pinned container triggers no pull at all.
    assert!(!pulled.iter().any(|p| p.starts_with("sha256:")));
}

#[tokio::test]
async fn test_nothing_to_update_completes() {
    let mock = DockerServiceMock::new(TESTCLUSTER);
    mock.add_container("web", &format!("{TESTIMAGE}:{TARGET_VERSION}"));

    let manager = JobsManager::new(
        Arc::new(EventBus::new()),
        Arc::new(MockResolver(mock.clone())),
    );
    batch::register_jobs(
        &manager,
        RegistryRepository::new(Vec::new()),
        DockerHealthCheck::shared(),
        TagReconcileConfig::default(),
    );

    let end = run_strategy(&manager, "stopThenStartEach").await;
    assert_eq!(end, JobStatus::Completed);
    // Already at the target: untouched, still running.
    let all = mock.snapshot();
    assert_eq!(all.len(), 1);
    assert!(all[0].running);
}

#[tokio::test]
async fn test_non_repeatable_per_cluster() {
    let (_, manager, _) = setup();
    // Hold the type busy with an instance that is created but not started.
    let params = JobParameters::builder("job.updateContainers.stopThenStartEach")
        .parameter("cluster", TESTCLUSTER)
        .parameter("image", "*")
        .parameter("target_version", TARGET_VERSION)
        .build();
    let first = manager.create(params.clone()).expect("first instance");

    let second = manager.create(params);
    assert!(second.is_err(), "duplicate update job was accepted");

    first.cancel();
    assert_eq!(first.at_end().await, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_image_ids_are_stable() {
    // The mock hands the same id for the same reference, and digests map
    // to themselves, which the filter relies on.
    assert_eq!(image_id_for("a:1"), image_id_for("a:1"));
    assert_ne!(image_id_for("a:1"), image_id_for("a:2"));
    assert_eq!(image_id_for(IMAGE_ID), IMAGE_ID);
}
