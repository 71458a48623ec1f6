//! In-memory daemon shared by the integration tests.
//!
//! Behaves like a small orchestrator endpoint: containers with unique
//! names, start/stop/rename/delete semantics, deterministic image ids.
//! When asked to, it also audits service availability on every mutation,
//! which the start-then-stop strategy test uses to prove that no service
//! name ever loses its last running instance.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use dockfleet::docker::{
    ClusterConfig, Container, ContainerConfig, ContainerDetails, CreateContainerResult,
    CreateContainerSpec, DeleteContainerArg, DockerError, DockerService, GetContainersArg,
    GetEventsArg, GetImagesArg, GetLogsArg, GetStatisticsArg, ImageDescriptor, ImageItem,
    KillContainerArg, Network, ProcessEvent, RemoveImageArg, ResultCode, ServiceCallResult,
    ServiceInfo, StopContainerArg, TagImageArg, UpdateContainerSpec,
};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub spec: CreateContainerSpec,
}

/// Deterministic image id for a reference; digest references are their
/// own id.
pub fn image_id_for(image: &str) -> String {
    if image.starts_with("sha256:") {
        return image.to_string();
    }
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in image.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("sha256:{hash:016x}{hash:016x}")
}

/// Base service name of a container: the generated `-N` suffix of a
/// side-by-side replacement does not make a new service.
fn service_name(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((base, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => base,
        _ => name,
    }
}

pub struct DockerServiceMock {
    id: String,
    cluster: String,
    config: ClusterConfig,
    containers: Mutex<HashMap<String, MockContainer>>,
    next_id: AtomicU64,
    pulled: Mutex<Vec<String>>,
    watched: Mutex<HashSet<String>>,
    violations: Mutex<Vec<String>>,
}

impl DockerServiceMock {
    pub fn new(cluster: &str) -> Arc<Self> {
        Arc::new(Self {
            id: format!("cluster:{cluster}"),
            cluster: cluster.to_string(),
            config: ClusterConfig::default(),
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pulled: Mutex::new(Vec::new()),
            watched: Mutex::new(HashSet::new()),
            violations: Mutex::new(Vec::new()),
        })
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster
    }

    /// Seed a running container.
    pub fn add_container(&self, name: &str, image: &str) {
        let id = self.fresh_id();
        self.lock().insert(
            id.clone(),
            MockContainer {
                id,
                name: name.to_string(),
                image: image.to_string(),
                running: true,
                spec: CreateContainerSpec {
                    name: Some(name.to_string()),
                    image: image.to_string(),
                    ..Default::default()
                },
            },
        );
    }

    /// Audit this service name on every mutation from now on.
    pub fn watch_service(&self, name: &str) {
        self.lock_other(&self.watched).insert(name.to_string());
    }

    /// Availability violations observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.lock_other(&self.violations).clone()
    }

    pub fn snapshot(&self) -> Vec<MockContainer> {
        let mut all: Vec<MockContainer> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.lock_other(&self.pulled).clone()
    }

    fn fresh_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("mock{n:010}")
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MockContainer>> {
        self.containers.lock().unwrap()
    }

    fn lock_other<'a, T>(&self, m: &'a Mutex<T>) -> MutexGuard<'a, T> {
        m.lock().unwrap()
    }

    /// Record a violation for every watched service with no running
    /// instance at this instant.
    fn audit(&self) {
        let watched = self.lock_other(&self.watched).clone();
        if watched.is_empty() {
            return;
        }
        let missing: Vec<String> = {
            let containers = self.lock();
            watched
                .into_iter()
                .filter(|service| {
                    !containers
                        .values()
                        .any(|c| c.running && service_name(&c.name) == service)
                })
                .collect()
        };
        let mut violations = self.lock_other(&self.violations);
        for service in missing {
            violations.push(format!("service '{service}' had no running instance"));
        }
    }

    fn not_found(id: &str) -> ServiceCallResult {
        ServiceCallResult::with_message(ResultCode::NotFound, format!("no such container {id}"))
    }
}

#[async_trait]
impl DockerService for DockerServiceMock {
    fn id(&self) -> &str {
        &self.id
    }

    fn cluster(&self) -> Option<&str> {
        Some(&self.cluster)
    }

    fn node(&self) -> Option<&str> {
        None
    }

    fn is_online(&self) -> bool {
        true
    }

    fn config(&self) -> &ClusterConfig {
        &self.config
    }

    async fn get_containers(&self, arg: &GetContainersArg) -> Result<Vec<Container>, DockerError> {
        let rows = self
            .lock()
            .values()
            .filter(|c| arg.all || c.running)
            .map(|c| {
                serde_json::from_value(serde_json::json!({
                    "Id": c.id,
                    "Names": [format!("/{}", c.name)],
                    "Image": c.image,
                    "ImageID": image_id_for(&c.image),
                    "Created": 0,
                    "Status": if c.running { "Up 1 second" } else { "Exited (0)" },
                }))
                .expect("mock container row")
            })
            .collect();
        Ok(rows)
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, DockerError> {
        let containers = self.lock();
        let Some(c) = containers.get(id) else {
            return Ok(None);
        };
        let details = ContainerDetails {
            id: c.id.clone(),
            name: Some(format!("/{}", c.name)),
            created: None,
            image_id: Some(image_id_for(&c.image)),
            config: Some(ContainerConfig {
                image: Some(c.image.clone()),
                env: c.spec.env.clone(),
                cmd: c.spec.cmd.clone(),
                entrypoint: c.spec.entrypoint.clone(),
                labels: c.spec.labels.clone(),
                exposed_ports: Default::default(),
            }),
            host_config: c.spec.host_config.clone(),
            state: Some(serde_json::from_value(serde_json::json!({
                "Running": c.running,
                "Status": if c.running { "running" } else { "exited" },
            }))
            .expect("mock state")),
            node: None,
        };
        Ok(Some(details))
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> CreateContainerResult {
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("unnamed-{}", self.next_id.load(Ordering::SeqCst)));
        {
            let mut containers = self.lock();
            if containers.values().any(|c| c.name == name) {
                return CreateContainerResult::failure(ServiceCallResult::with_message(
                    ResultCode::Conflict,
                    format!("Conflict. The name \"{name}\" is already in use"),
                ));
            }
            let id = self.fresh_id();
            containers.insert(
                id.clone(),
                MockContainer {
                    id: id.clone(),
                    name,
                    image: spec.image.clone(),
                    running: false,
                    spec: spec.clone(),
                },
            );
            drop(containers);
            self.audit();
            CreateContainerResult {
                code: ResultCode::Ok,
                message: None,
                id: Some(id),
            }
        }
    }

    async fn start_container(&self, id: &str) -> ServiceCallResult {
        let res = {
            let mut containers = self.lock();
            match containers.get_mut(id) {
                Some(c) => {
                    c.running = true;
                    ServiceCallResult::ok()
                }
                None => Self::not_found(id),
            }
        };
        self.audit();
        res
    }

    async fn stop_container(&self, arg: &StopContainerArg) -> ServiceCallResult {
        let res = {
            let mut containers = self.lock();
            match containers.get_mut(&arg.id) {
                Some(c) => {
                    c.running = false;
                    ServiceCallResult::ok()
                }
                None => Self::not_found(&arg.id),
            }
        };
        self.audit();
        res
    }

    async fn restart_container(&self, arg: &StopContainerArg) -> ServiceCallResult {
        self.start_container(&arg.id).await
    }

    async fn kill_container(&self, arg: &KillContainerArg) -> ServiceCallResult {
        self.stop_container(&StopContainerArg::new(&arg.id)).await
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> ServiceCallResult {
        let res = {
            let mut containers = self.lock();
            if containers.values().any(|c| c.name == new_name && c.id != id) {
                ServiceCallResult::with_message(
                    ResultCode::Conflict,
                    format!("name \"{new_name}\" is already in use"),
                )
            } else {
                match containers.get_mut(id) {
                    Some(c) => {
                        c.name = new_name.to_string();
                        ServiceCallResult::ok()
                    }
                    None => Self::not_found(id),
                }
            }
        };
        self.audit();
        res
    }

    async fn update_container(&self, id: &str, _spec: &UpdateContainerSpec) -> ServiceCallResult {
        if self.lock().contains_key(id) {
            ServiceCallResult::ok()
        } else {
            Self::not_found(id)
        }
    }

    async fn delete_container(&self, arg: &DeleteContainerArg) -> ServiceCallResult {
        let res = {
            let mut containers = self.lock();
            match containers.get(&arg.id) {
                Some(c) if c.running && !arg.kill => ServiceCallResult::with_message(
                    ResultCode::Conflict,
                    "You cannot remove a running container",
                ),
                Some(_) => {
                    containers.remove(&arg.id);
                    ServiceCallResult::ok()
                }
                None => Self::not_found(&arg.id),
            }
        };
        self.audit();
        res
    }

    async fn get_images(&self, _arg: &GetImagesArg) -> Result<Vec<ImageItem>, DockerError> {
        Ok(Vec::new())
    }

    async fn pull_image(
        &self,
        name: &str,
        _watcher: mpsc::Sender<ProcessEvent>,
    ) -> Result<Option<ImageDescriptor>, DockerError> {
        self.lock_other(&self.pulled).push(name.to_string());
        Ok(Some(ImageDescriptor {
            id: image_id_for(name),
            created: None,
            labels: Default::default(),
        }))
    }

    async fn get_image(&self, name: &str) -> Result<Option<ImageDescriptor>, DockerError> {
        Ok(Some(ImageDescriptor {
            id: image_id_for(name),
            created: None,
            labels: Default::default(),
        }))
    }

    async fn tag_image(&self, _arg: &TagImageArg) -> ServiceCallResult {
        ServiceCallResult::ok()
    }

    async fn remove_image(&self, _arg: &RemoveImageArg) -> ServiceCallResult {
        ServiceCallResult::ok()
    }

    async fn get_networks(&self) -> Result<Vec<Network>, DockerError> {
        Ok(Vec::new())
    }

    async fn create_network(&self, _network: &Network) -> ServiceCallResult {
        ServiceCallResult::ok()
    }

    async fn get_info(&self) -> Result<ServiceInfo, DockerError> {
        let containers = self.lock();
        Ok(ServiceInfo {
            name: Some(self.cluster.clone()),
            containers: containers.values().filter(|c| c.running).count() as u32,
            off_containers: containers.values().filter(|c| !c.running).count() as u32,
            ..Default::default()
        })
    }

    async fn subscribe_events(&self, arg: GetEventsArg) -> ServiceCallResult {
        arg.cancel.cancelled().await;
        ServiceCallResult::with_message(ResultCode::Ok, "interrupted")
    }

    async fn get_container_log(&self, arg: GetLogsArg) -> ServiceCallResult {
        if self.lock().contains_key(&arg.id) {
            ServiceCallResult::ok()
        } else {
            Self::not_found(&arg.id)
        }
    }

    async fn get_statistics(&self, arg: GetStatisticsArg) -> ServiceCallResult {
        if self.lock().contains_key(&arg.id) {
            ServiceCallResult::ok()
        } else {
            Self::not_found(&arg.id)
        }
    }
}
