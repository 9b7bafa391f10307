//! Chat slot and pending slot encoding
//!
//! Chat slots hold display-ready strings written by the host. Pending slots
//! hold `<timestampMillis>:<rawText>` so the host can derive a stable
//! [`MessageId`] for deduplication. Decoding never fails a whole batch: empty
//! values mean "no message" and malformed values surface as [`CodecError`]
//! for the caller to skip.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::{CHAT_KEY_PREFIX, MAX_MESSAGE_CHARS};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("pending value has no timestamp separator")]
    MissingSeparator,
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("pending value carries no text")]
    EmptyText,
    #[error("slot value contains control characters")]
    ControlCharacters,
}

/// Deduplication key: sender identity plus submission timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(peer_id: &str, timestamp: u64) -> Self {
        Self(format!("{}:{}", peer_id, timestamp))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded content of a peer's pending slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub timestamp: u64,
    pub text: String,
}

impl PendingMessage {
    pub fn id(&self, peer_id: &str) -> MessageId {
        MessageId::new(peer_id, self.timestamp)
    }
}

/// Key of the chat slot at `index`
pub fn chat_key(index: usize) -> String {
    format!("{}{}", CHAT_KEY_PREFIX, index)
}

/// Strips control characters and bounds the length of user text
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control())
        .take(MAX_MESSAGE_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Encodes a chat submission for the sender's pending slot
pub fn encode_pending(timestamp: u64, text: &str) -> String {
    format!("{}:{}", timestamp, sanitize(text))
}

/// Decodes a pending slot value. `Ok(None)` means the slot is empty.
pub fn decode_pending(value: &str) -> Result<Option<PendingMessage>, CodecError> {
    if value.trim().is_empty() {
        return Ok(None);
    }

    let (timestamp, text) = value
        .split_once(':')
        .ok_or(CodecError::MissingSeparator)?;
    let timestamp = timestamp
        .trim()
        .parse::<u64>()
        .map_err(|_| CodecError::InvalidTimestamp(timestamp.to_string()))?;

    if text.trim().is_empty() {
        return Err(CodecError::EmptyText);
    }
    if text.chars().any(char::is_control) {
        return Err(CodecError::ControlCharacters);
    }

    Ok(Some(PendingMessage {
        timestamp,
        text: text.to_string(),
    }))
}

/// Builds the display-ready chat line stored in a chat slot
pub fn format_display(sender: &str, text: &str, timestamp: u64) -> String {
    let clock = i64::try_from(timestamp)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string());
    format!("[{}] {}: {}", clock, sender, sanitize(text))
}

/// Decodes a chat slot value. `Ok(None)` means the slot is empty.
pub fn decode_chat(value: &str) -> Result<Option<String>, CodecError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    if value.chars().any(char::is_control) {
        return Err(CodecError::ControlCharacters);
    }
    Ok(Some(value.to_string()))
}

/// Chat slot decoding result for a whole document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedSlots {
    /// Messages in slot order
    pub messages: Vec<String>,
    /// Keys whose values failed to decode
    pub malformed: Vec<String>,
}

/// Decodes chat slots `0..capacity` in order, skipping empty and malformed ones
pub fn decode_chat_slots(data: &BTreeMap<String, String>, capacity: usize) -> DecodedSlots {
    let mut decoded = DecodedSlots::default();

    for index in 0..capacity {
        let key = chat_key(index);
        let Some(value) = data.get(&key) else {
            continue;
        };
        match decode_chat(value) {
            Ok(Some(message)) => decoded.messages.push(message),
            Ok(None) => {}
            Err(_) => decoded.malformed.push(key),
        }
    }

    decoded
}

/// Patch that writes `messages` into chat slots and clears the unused ones
/// that currently hold a value
pub fn chat_patch(
    current: &BTreeMap<String, String>,
    messages: &[String],
    capacity: usize,
) -> BTreeMap<String, String> {
    let mut patch = BTreeMap::new();

    for index in 0..capacity {
        let key = chat_key(index);
        match messages.get(index) {
            Some(message) => {
                patch.insert(key, message.clone());
            }
            None if current.contains_key(&key) => {
                patch.insert(key, String::new());
            }
            None => {}
        }
    }

    patch
}
