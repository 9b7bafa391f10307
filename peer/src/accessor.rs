//! Rate-limited access to the shared lobby document
//!
//! Every read and write a peer makes goes through [`RateLimitedAccessor`], so
//! the retry policy lives in exactly one place. Rate-limited calls are retried
//! with a delay of `base_delay * attempt`, up to `max_attempts` calls in total.
//! Reads retry nothing else: a poll that fails is simply repeated next tick.
//! Writes additionally retry transient failures, never permission failures.

use log::{error, warn};
use shared::{Document, DocumentService, ErrorClass, Patch, ServiceError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_attempts: 3,
        }
    }
}

fn read_retryable(e: &ServiceError) -> bool {
    e.class() == ErrorClass::RateLimited
}

fn write_retryable(e: &ServiceError) -> bool {
    matches!(e.class(), ErrorClass::RateLimited | ErrorClass::Transient)
}

#[derive(Clone)]
pub struct RateLimitedAccessor {
    service: Arc<dyn DocumentService>,
    policy: BackoffPolicy,
}

impl RateLimitedAccessor {
    pub fn new(service: Arc<dyn DocumentService>, policy: BackoffPolicy) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub async fn read(&self, lobby_id: &str) -> Result<Document, ServiceError> {
        let service = self.service.as_ref();
        self.with_backoff("read", lobby_id, read_retryable, move || {
            service.get(lobby_id)
        })
        .await
    }

    /// Patches the lobby data bag (host only)
    pub async fn write(&self, lobby_id: &str, patch: &Patch) -> Result<Document, ServiceError> {
        let service = self.service.as_ref();
        let result = self
            .with_backoff("write", lobby_id, write_retryable, move || {
                service.update(lobby_id, patch.clone())
            })
            .await;
        if let Err(e) = &result {
            error!("Write to lobby {} failed: {}", lobby_id, e);
        }
        result
    }

    /// Patches one player's record
    pub async fn write_peer(
        &self,
        lobby_id: &str,
        peer_id: &str,
        patch: &Patch,
    ) -> Result<(), ServiceError> {
        let service = self.service.as_ref();
        let result = self
            .with_backoff("peer write", lobby_id, write_retryable, move || {
                service.update_peer_data(lobby_id, peer_id, patch.clone())
            })
            .await;
        if let Err(e) = &result {
            error!("Write to {}'s record in lobby {} failed: {}", peer_id, lobby_id, e);
        }
        result
    }

    async fn with_backoff<T, F, Fut>(
        &self,
        what: &str,
        lobby_id: &str,
        retryable: fn(&ServiceError) -> bool,
        mut call: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        "{} on lobby {} failed ({}), retrying in {:?} ({}/{})",
                        what, lobby_id, e, delay, attempt, self.policy.max_attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
