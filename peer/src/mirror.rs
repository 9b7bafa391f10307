//! Local read projection of the chat slots plus the fingerprint used to
//! detect when it changes

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Suffix shown on optimistic entries the host has not yet applied
pub const SENDING_SUFFIX: &str = " (sending...)";

/// Cheap content hash of an ordered message list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn of(messages: &[String]) -> Self {
        let mut hasher = DefaultHasher::new();
        messages.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }
}

/// Locally submitted message shown before the host applies it
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    display: String,
    created_at: u64,
}

#[derive(Debug)]
pub struct LocalMirror {
    messages: Vec<String>,
    fingerprint: Option<Fingerprint>,
    placeholders: Vec<Placeholder>,
    capacity: usize,
}

impl LocalMirror {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            fingerprint: None,
            placeholders: Vec::new(),
            capacity,
        }
    }

    /// Authoritative messages as last observed
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.fingerprint
    }

    pub fn pending_placeholders(&self) -> usize {
        self.placeholders.len()
    }

    /// Replaces the mirror with `candidate` if its fingerprint differs.
    ///
    /// On change, placeholders that the new content now contains or that are
    /// older than `grace_millis` are dropped. Returns whether anything changed.
    pub fn apply(&mut self, mut candidate: Vec<String>, now_millis: u64, grace_millis: u64) -> bool {
        if candidate.len() > self.capacity {
            candidate.drain(..candidate.len() - self.capacity);
        }

        let fingerprint = Fingerprint::of(&candidate);
        if self.fingerprint == Some(fingerprint) {
            return false;
        }

        self.placeholders.retain(|p| {
            now_millis.saturating_sub(p.created_at) < grace_millis
                && !candidate.contains(&p.display)
        });
        self.messages = candidate;
        self.fingerprint = Some(fingerprint);
        true
    }

    pub fn push_placeholder(&mut self, display: String, now_millis: u64) {
        self.placeholders.push(Placeholder {
            display,
            created_at: now_millis,
        });
    }

    /// Presentation view: authoritative messages followed by tagged
    /// placeholders, newest `capacity` entries
    pub fn view(&self) -> Vec<String> {
        let mut view: Vec<String> = self
            .messages
            .iter()
            .cloned()
            .chain(
                self.placeholders
                    .iter()
                    .map(|p| format!("{}{}", p.display, SENDING_SUFFIX)),
            )
            .collect();

        if view.len() > self.capacity {
            view.drain(..view.len() - self.capacity);
        }
        view
    }
}
