//! Background consistency of the container registry.
//!
//! Two loops keep the index honest: the event pump holds one daemon event
//! stream open per cluster and applies container events as they happen,
//! and the reconciler periodically re-lists every cluster to repair
//! whatever the streams missed (dropped connections, failed KV writes,
//! state from before startup).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info};

use super::ContainerRegistry;
use crate::discovery::DiscoveryStorage;
use crate::docker::{CancelToken, GetEventsArg};

/// How often the pump checks for clusters without a live stream.
const PUMP_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Spawn the per-cluster event stream pump. The returned sender stops it.
pub fn spawn_event_pump(
    discovery: Arc<DiscoveryStorage>,
    containers: Arc<ContainerRegistry>,
) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let cancel = CancelToken::new();

    tokio::spawn(async move {
        let active: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());
        let mut ticker = interval(PUMP_CHECK_INTERVAL);
        info!("Container event pump started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for group in discovery.list() {
                        let name = group.name();
                        if active.contains_key(&name) {
                            continue;
                        }
                        active.insert(name.clone(), ());
                        let service = group.docker();
                        let containers = containers.clone();
                        let active = active.clone();
                        let cancel = cancel.clone();

                        tokio::spawn(async move {
                            let (tx, mut rx) = mpsc::channel(64);
                            let applier = {
                                let containers = containers.clone();
                                tokio::spawn(async move {
                                    while let Some(event) = rx.recv().await {
                                        containers.apply_event(&event).await;
                                    }
                                })
                            };
                            let res = service
                                .subscribe_events(GetEventsArg {
                                    since: None,
                                    until: None,
                                    sink: tx,
                                    cancel,
                                })
                                .await;
                            debug!(
                                "Event stream of '{}' ended: {:?} {:?}",
                                name, res.code, res.message
                            );
                            // The sink is gone; let the applier drain.
                            let _ = applier.await;
                            active.remove(&name);
                        });
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        cancel.cancel();
                        info!("Container event pump shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}

/// Spawn the periodic full reconciliation loop.
pub fn spawn_reconciler(
    discovery: Arc<DiscoveryStorage>,
    containers: Arc<ContainerRegistry>,
    every: Duration,
) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut ticker = interval(every);
        info!("Container reconciler started, every {:?}", every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for group in discovery.list() {
                        let scope = discovery.member_nodes(&group);
                        containers.reconcile(group.docker().as_ref(), &scope).await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Container reconciler shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}
