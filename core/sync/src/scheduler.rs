//! Sync scheduling driven by network reachability.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use offsync_common::{Error, Result};

use crate::client::SyncClient;
use crate::queue::SyncReport;

/// Network reachability as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReachabilityStatus {
    /// Not determined yet; treated as reachable.
    #[default]
    Unknown,
    NotReachable,
    Reachable,
}

impl ReachabilityStatus {
    /// Whether requests should be attempted against the server.
    pub fn is_online(self) -> bool {
        self != ReachabilityStatus::NotReachable
    }
}

/// Requests accepted by the scheduler task.
#[derive(Debug)]
pub enum SchedulerRequest {
    /// Drain the queue now and report back.
    SyncNow(oneshot::Sender<Result<SyncReport>>),
    /// Stop the scheduler task.
    Shutdown,
}

/// Front end used to talk to a running scheduler.
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl SyncScheduler {
    /// Create a scheduler listening to `reachability`.
    ///
    /// With a `retry_interval`, a sync is also attempted on every tick
    /// while the network is reachable and writes are pending.
    pub fn new(
        reachability: watch::Receiver<ReachabilityStatus>,
        retry_interval: Option<Duration>,
    ) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        (
            Self { request_tx },
            SyncSchedulerHandle {
                request_rx,
                reachability,
                retry_interval,
            },
        )
    }

    /// Ask the scheduler to sync immediately.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(SchedulerRequest::SyncNow(response_tx))
            .await
            .map_err(|_| Error::Internal("Scheduler not running".to_string()))?;
        response_rx
            .await
            .map_err(|_| Error::Internal("Scheduler dropped the sync request".to_string()))?
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }
}

/// Background half of the scheduler.
pub struct SyncSchedulerHandle {
    request_rx: mpsc::Receiver<SchedulerRequest>,
    reachability: watch::Receiver<ReachabilityStatus>,
    retry_interval: Option<Duration>,
}

impl SyncSchedulerHandle {
    /// Run until shut down or until the reachability channel closes.
    ///
    /// Should be spawned on the runtime.
    pub async fn run(mut self, client: Arc<SyncClient>) {
        let mut retry = self.retry_interval.map(|period| {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticks
        });

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                changed = self.reachability.changed() => {
                    if changed.is_err() {
                        info!("Reachability channel closed");
                        break;
                    }
                    let status = *self.reachability.borrow_and_update();
                    if let Some(task) = client.reachability_changed(status) {
                        match task.await {
                            Ok(Ok(report)) => debug!("Reconnect sync: {:?}", report),
                            Ok(Err(e)) => error!("Reconnect sync failed: {}", e),
                            Err(e) => error!("Reconnect sync task failed: {}", e),
                        }
                    }
                }

                request = self.request_rx.recv() => {
                    match request {
                        Some(SchedulerRequest::SyncNow(response_tx)) => {
                            let _ = response_tx.send(client.sync().await);
                        }
                        Some(SchedulerRequest::Shutdown) | None => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_retry(&mut retry) => {
                    if client.is_online() && !client.queue().is_empty().await {
                        debug!("Retrying pending writes");
                        if let Err(e) = client.sync().await {
                            error!("Periodic sync failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn wait_for_retry(retry: &mut Option<Interval>) {
        match retry {
            Some(ticks) => {
                ticks.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
