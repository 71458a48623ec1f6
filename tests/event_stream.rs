//! Streaming and offline behavior against thin HTTP servers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;

use dockfleet::bus::EventBus;
use dockfleet::docker::{
    CancelToken, ClusterConfig, DockerEndpoint, DockerError, DockerService, GetContainersArg,
    GetEventsArg, NodeInfoProvider, ResultCode, ServiceNodeInfo,
};

struct NoNodes;

impl NodeInfoProvider for NoNodes {
    fn node_info(&self, _name: &str) -> Option<ServiceNodeInfo> {
        None
    }
}

fn endpoint(host: String) -> Arc<DockerEndpoint> {
    DockerEndpoint::builder()
        .node("n1")
        .config(ClusterConfig {
            hosts: vec![host],
            ..Default::default()
        })
        .events(Arc::new(EventBus::new()))
        .node_info(Arc::new(NoNodes))
        .build()
        .expect("endpoint")
}

/// Daemon `/events` stand-in: one JSON event line every few milliseconds,
/// forever.
async fn events_handler() -> impl IntoResponse {
    let stream = futures::stream::unfold(0u64, |n| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let line = format!("{{\"Type\":\"container\",\"Action\":\"start\",\"id\":\"c{n}\"}}\n");
        Some((Ok::<_, Infallible>(Bytes::from(line)), n + 1))
    });
    Body::from_stream(stream)
}

async fn start_daemon_stub() -> String {
    let app = Router::new().route("/events", get(events_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind stub daemon");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

#[tokio::test]
async fn test_event_stream_cancel() {
    let host = start_daemon_stub().await;
    let ep = endpoint(host);

    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancelToken::new();
    let stream_task = {
        let ep = ep.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            ep.subscribe_events(GetEventsArg {
                since: None,
                until: None,
                sink: tx,
                cancel,
            })
            .await
        })
    };

    // Two frames prove the stream decodes and flows.
    let first = rx.recv().await.expect("first event");
    assert_eq!(first.subject_id(), Some("c0"));
    assert_eq!(first.service_id.as_deref(), Some("node:n1"));
    let second = rx.recv().await.expect("second event");
    assert_eq!(second.subject_id(), Some("c1"));

    cancel.cancel();
    let result = stream_task.await.expect("stream task");
    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(result.message.as_deref(), Some("interrupted"));

    // The sink was dropped with the stream; after draining what was
    // already buffered the channel closes; no frames past the cancel.
    while rx.recv().await.is_some() {}
}

#[tokio::test]
async fn test_stream_on_dead_endpoint_reports_transport() {
    let ep = endpoint("127.0.0.1:1".to_string());
    let (tx, _rx) = mpsc::channel(4);
    let result = ep
        .subscribe_events(GetEventsArg {
            since: None,
            until: None,
            sink: tx,
            cancel: CancelToken::new(),
        })
        .await;
    assert_eq!(result.code, ResultCode::Error);
}

#[tokio::test]
async fn test_offline_fail_fast_after_socket_failure() {
    let ep = endpoint("127.0.0.1:1".to_string());

    // First call hits the wire and fails as a transport error.
    let first = ep.get_containers(&GetContainersArg::new(true)).await;
    assert!(matches!(
        first,
        Err(DockerError::Transport { .. }) | Err(DockerError::Timeout { .. })
    ));

    // Calls inside the cooldown never reach the network: ten of them come
    // back OFFLINE in well under the connect budget.
    let started = Instant::now();
    for _ in 0..10 {
        let next = ep.get_containers(&GetContainersArg::new(true)).await;
        assert!(matches!(next, Err(DockerError::Offline { .. })));
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!ep.is_online());
}
