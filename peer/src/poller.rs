//! One document read per tick, fanned out to every local replicator
//!
//! When several chat views in one process watch the same lobby, letting each
//! of them poll would multiply reads against the rate limit. A
//! [`SharedPoller`] reads once per interval and broadcasts the snapshot.

use log::{debug, info};
use shared::Document;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::accessor::RateLimitedAccessor;

/// Snapshots buffered per subscriber before the slowest one starts lagging
const SNAPSHOT_BUFFER: usize = 8;

pub struct SharedPoller {
    snapshots: broadcast::Sender<Document>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SharedPoller {
    pub fn spawn(accessor: RateLimitedAccessor, lobby_id: impl Into<String>, every: Duration) -> Self {
        let lobby_id = lobby_id.into();
        let (snapshots, _) = broadcast::channel(SNAPSHOT_BUFFER);
        let (shutdown, mut stop) = watch::channel(false);
        let tx = snapshots.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Shared poller started for lobby {}", lobby_id);

            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        match accessor.read(&lobby_id).await {
                            Ok(doc) => {
                                // No subscribers right now is fine
                                let _ = tx.send(doc);
                            }
                            Err(e) => debug!("Shared poll of lobby {} failed: {}", lobby_id, e),
                        }
                    }
                }
            }

            info!("Shared poller for lobby {} stopped", lobby_id);
        });

        Self {
            snapshots,
            shutdown,
            task,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.snapshots.subscribe()
    }

    /// Stops polling and waits for the task to exit. Subscribers see the
    /// channel close.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
