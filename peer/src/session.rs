//! Lifecycle of one replicator inside a lobby
//!
//! Attaching a [`LobbySession`] starts the background loop that feeds the
//! replicator documents, either from its own poll timer or from a
//! [`SharedPoller`](crate::poller::SharedPoller) broadcast. Detaching stops
//! the loop and marks the replicator detached, so an operation still in
//! flight finishes without touching the mirror or subscribers.

use log::{debug, info, warn};
use shared::Document;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::replicator::{PollOutcome, Replicator, SendOutcome};

/// Where the session gets its document snapshots from
pub enum PollSource {
    /// Poll on the replicator's own interval
    Timer,
    /// Consume snapshots from a shared poller
    Shared(broadcast::Receiver<Document>),
}

pub struct LobbySession {
    replicator: Arc<Replicator>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LobbySession {
    pub fn attach(replicator: Arc<Replicator>, source: PollSource) -> Self {
        let (shutdown, stop) = watch::channel(false);
        let task = tokio::spawn(run_loop(Arc::clone(&replicator), source, stop));

        info!(
            "{} attached to lobby {}",
            replicator.peer_id(),
            replicator.lobby_id()
        );

        Self {
            replicator,
            shutdown,
            task,
        }
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub async fn send_chat(&self, text: &str) -> SendOutcome {
        self.replicator.send_chat(text).await
    }

    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<String>> {
        self.replicator.subscribe().await
    }

    /// Detaches the replicator and stops the feed loop. The returned handle
    /// resolves once any in-flight operation has finished.
    pub fn detach(self) -> JoinHandle<()> {
        self.replicator.detach();
        let _ = self.shutdown.send(true);
        self.task
    }
}

async fn run_loop(replicator: Arc<Replicator>, source: PollSource, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(replicator.config().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut snapshots = match source {
        PollSource::Timer => None,
        PollSource::Shared(rx) => Some(rx),
    };

    loop {
        let outcome = match snapshots.as_mut() {
            Some(rx) => {
                let received = tokio::select! {
                    _ = stop.changed() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(doc) => replicator.observe(doc).await,
                    Err(RecvError::Lagged(missed)) => {
                        debug!("Skipped {} stale snapshots", missed);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Shared poller went away, polling on own timer");
                        snapshots = None;
                        continue;
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => replicator.poll().await,
                }
            }
        };

        if outcome == PollOutcome::Detached {
            break;
        }
    }

    debug!("Feed loop for {} stopped", replicator.peer_id());
}
