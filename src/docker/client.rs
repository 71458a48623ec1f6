//! HTTP client for one daemon endpoint.
//!
//! A [`DockerEndpoint`] talks to exactly one daemon: either a single
//! node's engine or a cluster-level orchestrator. Reads use a short
//! timeout, mutations a long one, and connectivity failures flip the
//! endpoint into an offline cooldown during which every call fails fast
//! without touching the network.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::EventBus;

use super::args::{
    DeleteContainerArg, GetContainersArg, GetEventsArg, GetImagesArg, GetLogsArg,
    GetStatisticsArg, KillContainerArg, RemoveImageArg, StopContainerArg, TagImageArg,
};
use super::model::{
    Container, ContainerDetails, CreateContainerResponse, CreateContainerSpec, Image,
    ImageDescriptor, ImageItem, Info, Network, UpdateContainerResponse, UpdateContainerSpec,
};
use super::result::{ResultCode, ServiceCallResult};
use super::service::{
    service_topic, ClusterConfig, CreateContainerResult, DockerError, DockerService,
    DockerServiceEvent, DockerServiceEventKind, NodeInfoProvider, ServiceInfo, ServiceNodeInfo,
};
use super::stream::{CancelToken, JsonLineDecoder, LogFrameDecoder, ProcessEvent, StreamKind};

/// Base timeout for idempotent reads.
const FAST_TIMEOUT: Duration = Duration::from_secs(10);

/// Floor of the slow-call bound; `docker_timeout_s` can only raise it.
const MAX_TIMEOUT_FLOOR: Duration = Duration::from_secs(100);

/// Why an endpoint is considered unreachable, and until when we refuse to
/// retry it.
#[derive(Debug, Clone)]
pub struct OfflineCause {
    pub since: Instant,
    pub cooldown: Duration,
    pub error: String,
}

impl OfflineCause {
    fn new(cooldown: Duration, error: String) -> Self {
        Self {
            since: Instant::now(),
            cooldown,
            error,
        }
    }

    /// Whether the cooldown still holds.
    pub fn is_active(&self) -> bool {
        self.since.elapsed() < self.cooldown
    }
}

/// Builder for [`DockerEndpoint`]. Exactly one of `cluster` / `node` must
/// be set.
#[derive(Default)]
pub struct Builder {
    cluster: Option<String>,
    node: Option<String>,
    config: ClusterConfig,
    events: Option<Arc<EventBus<DockerServiceEvent>>>,
    nodes: Option<Arc<dyn NodeInfoProvider>>,
}

impl Builder {
    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: Arc<EventBus<DockerServiceEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn node_info(mut self, nodes: Arc<dyn NodeInfoProvider>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn build(self) -> Result<Arc<DockerEndpoint>, DockerError> {
        let id = match (&self.cluster, &self.node) {
            (Some(c), None) => format!("cluster:{c}"),
            (None, Some(n)) => format!("node:{n}"),
            _ => {
                return Err(DockerError::InvalidConfig(format!(
                    "service must have exactly one of cluster/node, got cluster={:?} node={:?}",
                    self.cluster, self.node
                )))
            }
        };
        let base_url = base_url(&self.config)?;
        let events = self
            .events
            .ok_or_else(|| DockerError::InvalidConfig("event bus is required".to_string()))?;
        let nodes = self
            .nodes
            .ok_or_else(|| DockerError::InvalidConfig("node info provider is required".to_string()))?;

        let max_timeout = Duration::from_secs(self.config.docker_timeout_s).max(MAX_TIMEOUT_FLOOR);
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DockerError::InvalidConfig(e.to_string()))?;

        Ok(Arc::new(DockerEndpoint {
            id,
            cluster: self.cluster,
            node: self.node,
            config: self.config,
            base_url,
            max_timeout,
            http,
            events,
            nodes,
            offline: Mutex::new(None),
            info_cache: tokio::sync::Mutex::new(None),
            last_info: Mutex::new(None),
        }))
    }
}

fn base_url(config: &ClusterConfig) -> Result<String, DockerError> {
    let host = config
        .hosts
        .first()
        .ok_or_else(|| DockerError::InvalidConfig("no hosts in config".to_string()))?;
    if config.hosts.len() > 1 {
        warn!(
            "Only one host per endpoint is supported, using the first of {:?}",
            config.hosts
        );
    }
    if host.starts_with("http://") || host.starts_with("https://") {
        Ok(host.trim_end_matches('/').to_string())
    } else {
        Ok(format!("http://{host}"))
    }
}

struct CachedInfo {
    at: Instant,
    info: ServiceInfo,
}

/// The HTTP implementation of [`DockerService`].
pub struct DockerEndpoint {
    id: String,
    cluster: Option<String>,
    node: Option<String>,
    config: ClusterConfig,
    base_url: String,
    max_timeout: Duration,
    http: reqwest::Client,
    events: Arc<EventBus<DockerServiceEvent>>,
    nodes: Arc<dyn NodeInfoProvider>,
    offline: Mutex<Option<OfflineCause>>,
    info_cache: tokio::sync::Mutex<Option<CachedInfo>>,
    last_info: Mutex<Option<ServiceInfo>>,
}

impl DockerEndpoint {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Current offline cause, for diagnostics.
    pub fn offline_cause(&self) -> Option<OfflineCause> {
        self.lock_offline().clone()
    }

    fn lock_offline(&self) -> MutexGuard<'_, Option<OfflineCause>> {
        self.offline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fast_timeout(&self) -> Duration {
        // A cluster endpoint aggregates many engines and may answer reads
        // slower than a single node.
        let mult = if self.cluster.is_some() { 3 } else { 1 };
        (FAST_TIMEOUT * mult).min(self.max_timeout)
    }

    fn slow_timeout(&self) -> Duration {
        self.max_timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn container_url(&self, id: &str, suffix: Option<&str>) -> Result<String, DockerError> {
        if id.contains('/') {
            return Err(DockerError::InvalidConfig(format!("bad id format: '{id}'")));
        }
        Ok(match suffix {
            Some(s) => self.url(&format!("containers/{id}/{s}")),
            None => self.url(&format!("containers/{id}")),
        })
    }

    fn gate(&self) -> Result<(), DockerError> {
        if let Some(cause) = &*self.lock_offline() {
            if cause.is_active() {
                return Err(DockerError::Offline {
                    id: self.id.clone(),
                    message: cause.error.clone(),
                });
            }
        }
        Ok(())
    }

    fn mark_online(&self) {
        let prev = self.lock_offline().take();
        if prev.is_some() {
            info!("Endpoint {} is back online", self.id);
            self.publish(DockerServiceEventKind::Online);
        }
    }

    fn mark_offline(&self, error: &DockerError) {
        let went_offline = {
            let mut slot = self.lock_offline();
            match &*slot {
                // An active cooldown stays as-is; cooldowns never shrink
                // within one offline episode.
                Some(old) if old.is_active() => false,
                Some(old) => {
                    let cooldown = (old.cooldown * 2).min(self.max_timeout);
                    *slot = Some(OfflineCause::new(cooldown, error.to_string()));
                    false
                }
                None => {
                    *slot = Some(OfflineCause::new(FAST_TIMEOUT, error.to_string()));
                    true
                }
            }
        };
        if went_offline {
            warn!("Endpoint {} went offline: {}", self.id, error);
            self.publish(DockerServiceEventKind::Offline);
        }
    }

    fn publish(&self, kind: DockerServiceEventKind) {
        self.events.publish(
            &service_topic(&self.id),
            DockerServiceEvent {
                service_id: self.id.clone(),
                kind,
            },
        );
    }

    fn transport_error(&self, e: reqwest::Error) -> DockerError {
        if e.is_timeout() {
            DockerError::Timeout {
                id: self.id.clone(),
                millis: 0,
            }
        } else {
            DockerError::Transport {
                id: self.id.clone(),
                message: e.to_string(),
            }
        }
    }

    /// Execute a request within `timeout`, classify the outcome and keep
    /// the offline slot in sync.
    async fn request_raw(
        &self,
        timeout: Duration,
        rb: reqwest::RequestBuilder,
    ) -> Result<(u16, Vec<u8>), DockerError> {
        self.gate()?;
        let fut = async {
            let resp = rb.send().await.map_err(|e| self.transport_error(e))?;
            let status = resp.status().as_u16();
            let body = resp
                .bytes()
                .await
                .map_err(|e| self.transport_error(e))?
                .to_vec();
            Ok::<_, DockerError>((status, body))
        };
        let outcome = match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(DockerError::Timeout {
                id: self.id.clone(),
                millis: timeout.as_millis() as u64,
            }),
        };
        match outcome {
            Ok((status, body)) => {
                if (200..300).contains(&status) {
                    self.mark_online();
                    Ok((status, body))
                } else {
                    // The daemon answered; connectivity is not in question.
                    Err(DockerError::Api {
                        code: ResultCode::from_status(status),
                        message: format!(
                            "Response from server: {} {}",
                            status,
                            String::from_utf8_lossy(&body).trim()
                        ),
                    })
                }
            }
            Err(e) => {
                if e.is_connectivity() {
                    self.mark_offline(&e);
                }
                Err(e)
            }
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        timeout: Duration,
        rb: reqwest::RequestBuilder,
    ) -> Result<T, DockerError> {
        let (_, body) = self.request_raw(timeout, rb).await?;
        serde_json::from_slice(&body).map_err(|e| DockerError::Decode(e.to_string()))
    }

    /// Run a mutation; protocol failures fold into the result instead of
    /// erroring.
    async fn mutate(&self, rb: reqwest::RequestBuilder) -> ServiceCallResult {
        match self.request_raw(self.slow_timeout(), rb).await {
            Ok(_) => ServiceCallResult::ok(),
            Err(e) => {
                debug!("Call on {} failed: {}", self.id, e);
                e.into()
            }
        }
    }

    /// Open a streaming response: no timeout, online marked as soon as the
    /// daemon answers.
    async fn open_stream(
        &self,
        rb: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DockerError> {
        self.gate()?;
        let resp = match rb.send().await {
            Ok(r) => r,
            Err(e) => {
                let err = self.transport_error(e);
                if err.is_connectivity() {
                    self.mark_offline(&err);
                }
                return Err(err);
            }
        };
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(DockerError::Api {
                code: ResultCode::from_status(status),
                message: format!("Response from server: {} {}", status, body.trim()),
            });
        }
        self.mark_online();
        Ok(resp)
    }

    /// Drive a streaming response through a decoder into a sink until the
    /// stream closes, the sink goes away or the token fires.
    async fn pump<T, F>(
        &self,
        resp: reqwest::Response,
        cancel: CancelToken,
        sink: mpsc::Sender<T>,
        mut decode: F,
    ) -> ServiceCallResult
    where
        F: FnMut(&[u8]) -> Vec<T> + Send,
        T: Send,
    {
        let mut stream = resp.bytes_stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the response body closes the connection.
                    return ServiceCallResult::with_message(ResultCode::Ok, "interrupted");
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for item in decode(&bytes) {
                            if sink.send(item).await.is_err() {
                                return ServiceCallResult::with_message(ResultCode::Ok, "interrupted");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let err = self.transport_error(e);
                        if err.is_connectivity() {
                            self.mark_offline(&err);
                        }
                        return err.into();
                    }
                    None => return ServiceCallResult::ok(),
                }
            }
        }
    }

    async fn fetch_info(&self) -> Result<ServiceInfo, DockerError> {
        let info: Info = self
            .request_json(self.fast_timeout(), self.http.get(self.url("info")))
            .await?;
        let mut service_info = digest_info(&info);
        service_info.name = service_info
            .name
            .or_else(|| self.cluster.clone())
            .or_else(|| self.node.clone());
        // A node endpoint reports no node rows; it is its own single node.
        if self.node.is_some() && service_info.nodes.is_empty() {
            if let Some(n) = self.node.as_ref() {
                service_info.nodes.push(ServiceNodeInfo {
                    name: n.clone(),
                    ..Default::default()
                });
            }
        }
        for row in &mut service_info.nodes {
            if let Some(agent) = self.nodes.node_info(&row.name) {
                row.merge_from(&agent);
            }
        }
        service_info.node_count = service_info.nodes.len() as u32;
        service_info.off_node_count = service_info
            .nodes
            .iter()
            .filter(|n| n.healthy == Some(false))
            .count() as u32;
        Ok(service_info)
    }
}

/// Reduce the raw `/info` answer. Swarm managers flatten per-node details
/// into indented `SystemStatus` rows; a row whose key has no leading
/// space opens a node, `└ Status` rows below it carry health.
fn digest_info(info: &Info) -> ServiceInfo {
    let mut nodes = Vec::new();
    if let Some(rows) = &info.system_status {
        let mut current: Option<ServiceNodeInfo> = None;
        for row in rows {
            let (key, value) = match row.as_slice() {
                [k, v] => (k.as_str(), v.as_str()),
                _ => continue,
            };
            if !key.starts_with(' ') && value.contains(':') && !key.contains(':') {
                if let Some(done) = current.take() {
                    nodes.push(done);
                }
                current = Some(ServiceNodeInfo {
                    name: key.trim().to_string(),
                    address: Some(value.to_string()),
                    ..Default::default()
                });
            } else if let Some(node) = current.as_mut() {
                if key.trim().trim_start_matches('└').trim() == "Status" {
                    node.healthy = Some(value.eq_ignore_ascii_case("healthy"));
                }
            }
        }
        if let Some(done) = current.take() {
            nodes.push(done);
        }
    }
    ServiceInfo {
        name: info.name.clone(),
        containers: info.containers,
        off_containers: 0,
        images: info.images,
        node_count: nodes.len() as u32,
        off_node_count: 0,
        mem_total: info.mem_total,
        server_version: info.server_version.clone(),
        nodes,
    }
}

#[async_trait]
impl DockerService for DockerEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    fn is_online(&self) -> bool {
        self.lock_offline()
            .as_ref()
            .map(|c| !c.is_active())
            .unwrap_or(true)
    }

    fn config(&self) -> &ClusterConfig {
        &self.config
    }

    async fn get_containers(&self, arg: &GetContainersArg) -> Result<Vec<Container>, DockerError> {
        let rb = self
            .http
            .get(self.url("containers/json"))
            .query(&[("all", if arg.all { "1" } else { "0" })]);
        self.request_json(self.fast_timeout(), rb).await
    }

    async fn get_container(&self, id: &str) -> Result<Option<ContainerDetails>, DockerError> {
        let url = self.container_url(id, Some("json"))?;
        match self.request_raw(self.fast_timeout(), self.http.get(url)).await {
            Ok((_, body)) => match serde_json::from_slice(&body) {
                Ok(details) => Ok(Some(details)),
                Err(e) => {
                    // Mid-removal the daemon can answer 200 with truncated
                    // JSON; the container is gone for our purposes.
                    warn!("On get container '{}' got undecodable body: {}", id, e);
                    Ok(None)
                }
            },
            Err(DockerError::Api {
                code: ResultCode::NotFound,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, spec: &CreateContainerSpec) -> CreateContainerResult {
        let mut rb = self.http.post(self.url("containers/create")).json(spec);
        if let Some(name) = &spec.name {
            rb = rb.query(&[("name", name.as_str())]);
        }
        match self.request_raw(self.slow_timeout(), rb).await {
            Ok((_, body)) => {
                let parsed: CreateContainerResponse =
                    serde_json::from_slice(&body).unwrap_or_default();
                let message = parsed.warnings.map(|w| w.join(", "));
                CreateContainerResult {
                    code: ResultCode::Ok,
                    message,
                    id: parsed.id,
                }
            }
            Err(e) => CreateContainerResult::failure(e.into()),
        }
    }

    async fn start_container(&self, id: &str) -> ServiceCallResult {
        debug!("Trying to start container {}", id);
        match self.container_url(id, Some("start")) {
            Ok(url) => self.mutate(self.http.post(url)).await,
            Err(e) => e.into(),
        }
    }

    async fn stop_container(&self, arg: &StopContainerArg) -> ServiceCallResult {
        self.timed_action(&arg.id, "stop", arg.time_before_kill).await
    }

    async fn restart_container(&self, arg: &StopContainerArg) -> ServiceCallResult {
        self.timed_action(&arg.id, "restart", arg.time_before_kill)
            .await
    }

    async fn kill_container(&self, arg: &KillContainerArg) -> ServiceCallResult {
        let url = match self.container_url(&arg.id, Some("kill")) {
            Ok(u) => u,
            Err(e) => return e.into(),
        };
        let mut rb = self.http.post(url);
        if let Some(signal) = &arg.signal {
            rb = rb.query(&[("signal", signal.as_str())]);
        }
        self.mutate(rb).await
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> ServiceCallResult {
        match self.container_url(id, Some("rename")) {
            Ok(url) => {
                self.mutate(self.http.post(url).query(&[("name", new_name)]))
                    .await
            }
            Err(e) => e.into(),
        }
    }

    async fn update_container(&self, id: &str, spec: &UpdateContainerSpec) -> ServiceCallResult {
        let url = match self.container_url(id, Some("update")) {
            Ok(u) => u,
            Err(e) => return e.into(),
        };
        match self
            .request_raw(self.slow_timeout(), self.http.post(url).json(spec))
            .await
        {
            Ok((_, body)) => {
                let parsed: UpdateContainerResponse =
                    serde_json::from_slice(&body).unwrap_or_default();
                match parsed.warnings {
                    Some(w) if !w.is_empty() => {
                        ServiceCallResult::with_message(ResultCode::Ok, w.join(", "))
                    }
                    _ => ServiceCallResult::ok(),
                }
            }
            Err(e) => e.into(),
        }
    }

    async fn delete_container(&self, arg: &DeleteContainerArg) -> ServiceCallResult {
        let url = match self.container_url(&arg.id, None) {
            Ok(u) => u,
            Err(e) => return e.into(),
        };
        let mut rb = self.http.delete(url);
        if arg.delete_volumes {
            rb = rb.query(&[("v", "1")]);
        }
        if arg.kill {
            rb = rb.query(&[("force", "1")]);
        }
        self.mutate(rb).await
    }

    async fn get_images(&self, arg: &GetImagesArg) -> Result<Vec<ImageItem>, DockerError> {
        let mut rb = self
            .http
            .get(self.url("images/json"))
            .query(&[("all", if arg.all { "1" } else { "0" })]);
        if let Some(name) = &arg.name {
            // Only a full image name works here; the daemon has no mask
            // support in this parameter.
            rb = rb.query(&[("filter", name.as_str())]);
        }
        self.request_json(self.fast_timeout(), rb).await
    }

    async fn pull_image(
        &self,
        name: &str,
        watcher: mpsc::Sender<ProcessEvent>,
    ) -> Result<Option<ImageDescriptor>, DockerError> {
        let _ = watcher
            .send(ProcessEvent {
                stream: StreamKind::Stdout,
                data: format!("pulling image {name}\n").into_bytes(),
            })
            .await;
        let rb = self
            .http
            .post(self.url("images/create"))
            .query(&[("fromImage", name)]);
        let resp = self.open_stream(rb).await?;
        let cancel = CancelToken::new();
        let res = self
            .pump(resp, cancel, watcher.clone(), |chunk| {
                vec![ProcessEvent {
                    stream: StreamKind::Stdout,
                    data: chunk.to_vec(),
                }]
            })
            .await;
        if !res.is_ok() {
            return Err(DockerError::Api {
                code: res.code,
                message: res.message.unwrap_or_default(),
            });
        }
        let _ = watcher
            .send(ProcessEvent {
                stream: StreamKind::Stdout,
                data: format!("trying to get image info {name}\n").into_bytes(),
            })
            .await;
        self.get_image(name).await
    }

    async fn get_image(&self, name: &str) -> Result<Option<ImageDescriptor>, DockerError> {
        let url = self.url(&format!("images/{name}/json"));
        match self
            .request_json::<Image>(self.fast_timeout(), self.http.get(url))
            .await
        {
            Ok(image) => Ok(Some(image.into())),
            Err(DockerError::Api {
                code: ResultCode::NotFound,
                ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn tag_image(&self, arg: &TagImageArg) -> ServiceCallResult {
        let source = format!(
            "images/{}/{}:{}/tag",
            arg.repository, arg.image_name, arg.current_tag
        );
        let repo = format!("{}/{}", arg.repository, arg.image_name);
        let res = self
            .mutate(self.http.post(self.url(&source)).query(&[
                ("force", if arg.force { "1" } else { "0" }),
                ("repo", repo.as_str()),
                ("tag", arg.new_tag.as_str()),
            ]))
            .await;
        if res.is_ok() && arg.remote {
            let push = format!("images/{}/push", repo);
            return self
                .mutate(
                    self.http
                        .post(self.url(&push))
                        .query(&[("tag", arg.new_tag.as_str())]),
                )
                .await;
        }
        res
    }

    async fn remove_image(&self, arg: &RemoveImageArg) -> ServiceCallResult {
        let url = self.url(&format!("images/{}", arg.image_id));
        let res = self
            .mutate(self.http.delete(url).query(&[
                ("force", if arg.force { "1" } else { "0" }),
                ("noprune", if arg.no_prune { "1" } else { "0" }),
            ]))
            .await;
        if res.is_ok() {
            info!("Image {} deleted", arg.image_id);
        } else {
            warn!(
                "Can not delete image {}: {:?}",
                arg.image_id, res.message
            );
        }
        res
    }

    async fn get_networks(&self) -> Result<Vec<Network>, DockerError> {
        self.request_json(self.fast_timeout(), self.http.get(self.url("networks")))
            .await
    }

    async fn create_network(&self, network: &Network) -> ServiceCallResult {
        self.mutate(self.http.post(self.url("networks/create")).json(network))
            .await
    }

    async fn get_info(&self) -> Result<ServiceInfo, DockerError> {
        let ttl = Duration::from_secs(self.config.cache_after_write_s);
        let mut cache = self.info_cache.lock().await;
        if let Some(cached) = &*cache {
            if cached.at.elapsed() < ttl {
                return Ok(cached.info.clone());
            }
        }
        let fresh = self.fetch_info().await?;
        // Announce only real changes so subscribers are not flooded with
        // identical snapshots on every cache refresh.
        let changed = {
            let mut last = self.last_info.lock().unwrap_or_else(|e| e.into_inner());
            let changed = last.as_ref() != Some(&fresh);
            *last = Some(fresh.clone());
            changed
        };
        if changed {
            self.publish(DockerServiceEventKind::InfoChanged(fresh.clone()));
        }
        *cache = Some(CachedInfo {
            at: Instant::now(),
            info: fresh.clone(),
        });
        Ok(fresh)
    }

    async fn subscribe_events(&self, arg: GetEventsArg) -> ServiceCallResult {
        let mut rb = self.http.get(self.url("events"));
        if let Some(since) = arg.since {
            rb = rb.query(&[("since", since)]);
        }
        if let Some(until) = arg.until {
            rb = rb.query(&[("until", until)]);
        }
        let resp = match self.open_stream(rb).await {
            Ok(r) => r,
            Err(e) => return e.into(),
        };
        let mut decoder = JsonLineDecoder::new();
        let service_id = self.id.clone();
        self.pump(resp, arg.cancel, arg.sink, move |chunk| {
            let mut events: Vec<super::model::DockerEvent> = decoder.feed(chunk);
            for e in &mut events {
                e.service_id = Some(service_id.clone());
            }
            events
        })
        .await
    }

    async fn get_container_log(&self, arg: GetLogsArg) -> ServiceCallResult {
        let url = match self.container_url(&arg.id, Some("logs")) {
            Ok(u) => u,
            Err(e) => return e.into(),
        };
        // At least one stream must be requested, usually both.
        let (stdout, stderr) = if !arg.stdout && !arg.stderr {
            (true, true)
        } else {
            (arg.stdout, arg.stderr)
        };
        let mut rb = self.http.get(url).query(&[
            ("stdout", if stdout { "1" } else { "0" }),
            ("stderr", if stderr { "1" } else { "0" }),
            ("follow", if arg.follow { "1" } else { "0" }),
            ("timestamps", if arg.timestamps { "1" } else { "0" }),
        ]);
        if let Some(since) = arg.since {
            rb = rb.query(&[("since", since)]);
        }
        if let Some(tail) = arg.tail {
            rb = rb.query(&[("tail", tail)]);
        }
        let resp = match self.open_stream(rb).await {
            Ok(r) => r,
            Err(e) => return e.into(),
        };
        let mut decoder = LogFrameDecoder::new();
        self.pump(resp, arg.cancel, arg.sink, move |chunk| decoder.feed(chunk))
            .await
    }

    async fn get_statistics(&self, arg: GetStatisticsArg) -> ServiceCallResult {
        let url = match self.container_url(&arg.id, Some("stats")) {
            Ok(u) => u,
            Err(e) => return e.into(),
        };
        let rb = self
            .http
            .get(url)
            .query(&[("stream", if arg.stream { "1" } else { "0" })]);
        let resp = match self.open_stream(rb).await {
            Ok(r) => r,
            Err(e) => return e.into(),
        };
        let mut decoder = JsonLineDecoder::new();
        self.pump(resp, arg.cancel, arg.sink, move |chunk| decoder.feed(chunk))
            .await
    }
}

impl DockerEndpoint {
    async fn timed_action(&self, id: &str, action: &str, time_before_kill: u32) -> ServiceCallResult {
        let url = match self.container_url(id, Some(action)) {
            Ok(u) => u,
            Err(e) => return e.into(),
        };
        let mut rb = self.http.post(url);
        if time_before_kill > 0 {
            rb = rb.query(&[("t", time_before_kill)]);
        }
        let res = self.mutate(rb).await;
        if !res.is_ok() {
            warn!(
                "In {}, can not '{}' container {}: {:?}",
                self.id, action, id, res.message
            );
        }
        res
    }
}

impl std::fmt::Debug for DockerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEndpoint")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoNodes;

    impl NodeInfoProvider for NoNodes {
        fn node_info(&self, _name: &str) -> Option<ServiceNodeInfo> {
            None
        }
    }

    fn endpoint(hosts: Vec<String>) -> Arc<DockerEndpoint> {
        DockerEndpoint::builder()
            .node("n1")
            .config(ClusterConfig {
                hosts,
                ..Default::default()
            })
            .events(Arc::new(EventBus::new()))
            .node_info(Arc::new(NoNodes))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_exactly_one_identity() {
        let result = DockerEndpoint::builder()
            .config(ClusterConfig {
                hosts: vec!["localhost:2375".to_string()],
                ..Default::default()
            })
            .events(Arc::new(EventBus::new()))
            .node_info(Arc::new(NoNodes))
            .build();
        assert!(matches!(result, Err(DockerError::InvalidConfig(_))));

        let result = DockerEndpoint::builder()
            .cluster("c")
            .node("n")
            .config(ClusterConfig {
                hosts: vec!["localhost:2375".to_string()],
                ..Default::default()
            })
            .events(Arc::new(EventBus::new()))
            .node_info(Arc::new(NoNodes))
            .build();
        assert!(matches!(result, Err(DockerError::InvalidConfig(_))));
    }

    #[test]
    fn test_timeouts() {
        let node = endpoint(vec!["localhost:2375".to_string()]);
        assert_eq!(node.fast_timeout(), Duration::from_secs(10));
        assert_eq!(node.slow_timeout(), Duration::from_secs(300));

        let cluster = DockerEndpoint::builder()
            .cluster("c1")
            .config(ClusterConfig {
                hosts: vec!["localhost:4000".to_string()],
                docker_timeout_s: 5,
                ..Default::default()
            })
            .events(Arc::new(EventBus::new()))
            .node_info(Arc::new(NoNodes))
            .build()
            .unwrap();
        assert_eq!(cluster.fast_timeout(), Duration::from_secs(30));
        // docker_timeout below the floor is clamped up.
        assert_eq!(cluster.slow_timeout(), Duration::from_secs(100));
    }

    #[test]
    fn test_offline_slot_cooldown() {
        let ep = endpoint(vec!["localhost:2375".to_string()]);
        assert!(ep.is_online());

        let err = DockerError::Transport {
            id: ep.id().to_string(),
            message: "connection refused".to_string(),
        };
        ep.mark_offline(&err);
        assert!(!ep.is_online());
        let first = ep.offline_cause().unwrap();
        assert_eq!(first.cooldown, FAST_TIMEOUT);

        // During an active cooldown the gate fails without network.
        assert!(matches!(ep.gate(), Err(DockerError::Offline { .. })));

        // A failure after expiry doubles the cooldown.
        {
            let mut slot = ep.lock_offline();
            if let Some(c) = slot.as_mut() {
                c.since = Instant::now() - c.cooldown - Duration::from_millis(1);
            }
        }
        ep.mark_offline(&err);
        let second = ep.offline_cause().unwrap();
        assert_eq!(second.cooldown, FAST_TIMEOUT * 2);

        ep.mark_online();
        assert!(ep.is_online());
        assert!(ep.offline_cause().is_none());
    }

    #[tokio::test]
    async fn test_offline_emits_events_once() {
        let bus = Arc::new(EventBus::new());
        let ep = DockerEndpoint::builder()
            .node("n1")
            .config(ClusterConfig {
                hosts: vec!["localhost:1".to_string()],
                ..Default::default()
            })
            .events(bus.clone())
            .node_info(Arc::new(NoNodes))
            .build()
            .unwrap();
        let mut rx = bus.subscribe(&service_topic(ep.id()));

        let err = DockerError::Timeout {
            id: ep.id().to_string(),
            millis: 10,
        };
        ep.mark_offline(&err);
        ep.mark_offline(&err); // still within cooldown, no second event
        ep.mark_online();

        assert_eq!(rx.recv().await.unwrap().kind, DockerServiceEventKind::Offline);
        assert_eq!(rx.recv().await.unwrap().kind, DockerServiceEventKind::Online);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_fail_fast_without_network() {
        let ep = endpoint(vec!["localhost:1".to_string()]);
        let err = DockerError::Transport {
            id: ep.id().to_string(),
            message: "refused".to_string(),
        };
        ep.mark_offline(&err);

        // No network call happens; the gate rejects immediately.
        let res = ep.get_containers(&GetContainersArg::new(true)).await;
        assert!(matches!(res, Err(DockerError::Offline { .. })));

        let res = ep.start_container("abc").await;
        assert_eq!(res.code, ResultCode::Error);
        assert!(res.message.unwrap().contains("OFFLINE"));
    }

    #[test]
    fn test_digest_info_swarm_rows() {
        let info = Info {
            name: Some("swarm-manager".to_string()),
            containers: 7,
            images: 3,
            system_status: Some(vec![
                vec!["Role".to_string(), "primary".to_string()],
                vec!["node-1".to_string(), "10.0.0.1:2375".to_string()],
                vec![" └ Status".to_string(), "Healthy".to_string()],
                vec!["node-2".to_string(), "10.0.0.2:2375".to_string()],
                vec![" └ Status".to_string(), "Unhealthy".to_string()],
            ]),
            ..Default::default()
        };
        let digested = digest_info(&info);
        assert_eq!(digested.nodes.len(), 2);
        assert_eq!(digested.nodes[0].name, "node-1");
        assert_eq!(digested.nodes[0].healthy, Some(true));
        assert_eq!(digested.nodes[1].healthy, Some(false));
        assert_eq!(digested.containers, 7);
    }

    #[test]
    fn test_base_url_forms() {
        let cfg = |h: &str| ClusterConfig {
            hosts: vec![h.to_string()],
            ..Default::default()
        };
        assert_eq!(base_url(&cfg("localhost:2375")).unwrap(), "http://localhost:2375");
        assert_eq!(
            base_url(&cfg("https://docker.local/")).unwrap(),
            "https://docker.local"
        );
        assert!(base_url(&ClusterConfig::default()).is_err());
    }
}
