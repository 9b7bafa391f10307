//! Per-peer fixed-window request limiting
//!
//! Mirrors the external lobby service's behaviour closely enough for the
//! peers' backoff paths to be exercised: every peer gets `max_requests` calls
//! per window, after which calls fail with `RateLimited` until the window
//! rolls over.

use log::warn;
use shared::ServiceError;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit: Option<RateLimit>,
    windows: HashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit: Some(limit),
            windows: HashMap::new(),
        }
    }

    /// A limiter that admits every request
    pub fn unlimited() -> Self {
        Self {
            limit: None,
            windows: HashMap::new(),
        }
    }

    pub fn check(&mut self, peer_id: &str) -> Result<(), ServiceError> {
        self.check_at(peer_id, Instant::now())
    }

    /// Counts one request from `peer_id` at `now`
    pub fn check_at(&mut self, peer_id: &str, now: Instant) -> Result<(), ServiceError> {
        let Some(limit) = self.limit else {
            return Ok(());
        };

        let window = self
            .windows
            .entry(peer_id.to_string())
            .or_insert(Window {
                started: now,
                count: 0,
            });

        if now.duration_since(window.started) >= limit.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= limit.max_requests {
            warn!("Rate limiting {} ({} requests in window)", peer_id, window.count);
            return Err(ServiceError::RateLimited);
        }

        window.count += 1;
        Ok(())
    }

    /// Drops the bookkeeping of a departed peer
    pub fn forget(&mut self, peer_id: &str) {
        self.windows.remove(peer_id);
    }
}
