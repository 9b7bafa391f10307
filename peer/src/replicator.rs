//! Per-peer chat replication over the shared lobby document
//!
//! A [`Replicator`] runs one peer's side of the protocol:
//!
//! - **Client path**: a local message is written into this peer's own
//!   pending slot as `timestamp:text`, and an optimistic "sending" entry is
//!   shown until the host's copy arrives.
//! - **Host path**: a local message is appended straight to the chat slots,
//!   together with any pending messages drained from other peers.
//! - **Arbitration** (host only): whenever a read shows pending slots with
//!   unseen message ids, they are appended to the chat slots, the ids are
//!   recorded in the dedup ledger and the drained pending slots are cleared.
//!   Chat slots are always written before pending slots are cleared.
//! - **Change detection**: every successful read is decoded and fingerprinted;
//!   subscribers are notified only when the fingerprint moves.
//!
//! A client has a single pending slot, so it holds back a new message until
//! a read shows its previous one drained.
//!
//! All document traffic for one peer is serialised by an operation guard. A
//! poll that finds the guard taken is skipped; a local send waits for it.

use log::{debug, info, warn};
use shared::codec::{self, MessageId};
use shared::{
    patch_of, Clock, Document, IdentityService, ServiceError, CHAT_LOG_CAPACITY,
    LOBBY_CHAT_CAPACITY, PENDING_KEY,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::accessor::RateLimitedAccessor;
use crate::ledger::{DedupLedger, DEFAULT_LEDGER_CAP};
use crate::mirror::{Fingerprint, LocalMirror};

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Number of chat slots kept in the document and in the local mirror
    pub capacity: usize,
    /// Interval between own polls when no shared poller feeds this peer
    pub poll_interval: Duration,
    /// Minimum spacing between local sends
    pub send_cooldown: Duration,
    /// How long an unconfirmed "sending" entry survives document changes
    pub placeholder_grace: Duration,
    /// Dedup ledger size before compaction
    pub ledger_cap: usize,
}

impl ReplicatorConfig {
    /// Settings for the lobby chat window
    pub fn lobby_chat() -> Self {
        Self {
            capacity: LOBBY_CHAT_CAPACITY,
            poll_interval: Duration::from_millis(1500),
            send_cooldown: Duration::from_secs(1),
            placeholder_grace: Duration::from_secs(10),
            ledger_cap: DEFAULT_LEDGER_CAP,
        }
    }

    /// Settings for the longer secondary chat log
    pub fn chat_log() -> Self {
        Self {
            capacity: CHAT_LOG_CAPACITY,
            ..Self::lobby_chat()
        }
    }
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self::lobby_chat()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Polling,
    Submitting,
    Merging,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Host path: the message is in the chat slots
    Committed,
    /// Client path: the message is in this peer's pending slot
    Queued,
    RejectedCooldown,
    /// Client path: the previous message still sits in the pending slot
    RejectedPending,
    RejectedEmpty,
    Failed(ServiceError),
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another operation was in progress
    Skipped,
    Unchanged,
    Changed,
    /// Host drained pending slots into the chat slots
    Merged { applied: usize },
    Failed(ServiceError),
    Detached,
}

/// Pending slots folded into a copy of the chat slots
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Chat slot content to write, oldest first, at most `capacity` entries
    pub messages: Vec<String>,
    /// Ids of pending messages newly appended
    pub applied: Vec<MessageId>,
    /// Peers whose pending slot should be cleared once the chat slots land
    pub to_clear: Vec<String>,
    /// Whether the chat slots differ from the document's
    pub needs_write: bool,
}

/// Builds the chat slot content the host should write for `doc`.
///
/// `local` is the host's own new message, appended before pending messages.
/// Pending slots are visited in player order; empty slots are ignored,
/// already-applied and malformed slots are only scheduled for clearing.
pub fn plan_merge(
    doc: &Document,
    ledger: &DedupLedger,
    capacity: usize,
    local: Option<String>,
) -> MergePlan {
    let decoded = codec::decode_chat_slots(&doc.data, capacity);
    let mut plan = MergePlan {
        messages: decoded.messages,
        needs_write: !decoded.malformed.is_empty(),
        ..MergePlan::default()
    };

    if let Some(message) = local {
        plan.messages.push(message);
        plan.needs_write = true;
    }

    for player in &doc.players {
        let Some(raw) = player.data.get(PENDING_KEY) else {
            continue;
        };

        match codec::decode_pending(raw) {
            Ok(None) => {}
            Ok(Some(pending)) => {
                let id = pending.id(&player.id);
                if !ledger.seen(&id) && !plan.applied.contains(&id) {
                    plan.messages.push(codec::format_display(
                        player.display_name(),
                        &pending.text,
                        pending.timestamp,
                    ));
                    plan.applied.push(id);
                    plan.needs_write = true;
                }
                plan.to_clear.push(player.id.clone());
            }
            Err(e) => {
                warn!("Skipping malformed pending slot of {}: {}", player.id, e);
                plan.to_clear.push(player.id.clone());
            }
        }
    }

    if plan.messages.len() > capacity {
        plan.messages.drain(..plan.messages.len() - capacity);
    }

    plan
}

/// A chat write whose reply was lost may still have landed. Any in-doubt
/// message whose line is now in the chat slots counts as applied.
fn settle_in_doubt(state: &mut ReplicaState, doc: &Document, capacity: usize) {
    if state.in_doubt.is_empty() {
        return;
    }

    let chat = codec::decode_chat_slots(&doc.data, capacity).messages;
    let in_doubt = std::mem::take(&mut state.in_doubt);
    for player in &doc.players {
        let Some(raw) = player.data.get(PENDING_KEY) else {
            continue;
        };
        let Ok(Some(pending)) = codec::decode_pending(raw) else {
            continue;
        };
        let id = pending.id(&player.id);
        if !in_doubt.contains(&id) {
            continue;
        }

        let line = codec::format_display(player.display_name(), &pending.text, pending.timestamp);
        if chat.contains(&line) {
            debug!("Earlier write of {} landed, not applying again", id);
            state.ledger.mark(id);
        }
    }
}

struct MergeReport {
    applied: usize,
    changed: bool,
}

struct ReplicaState {
    phase: Phase,
    ledger: DedupLedger,
    mirror: LocalMirror,
    last_send: Option<u64>,
    host_id: Option<String>,
    /// Id of this peer's own pending message not yet seen drained
    undrained: Option<MessageId>,
    /// Ids whose chat write failed but may still have landed
    in_doubt: Vec<MessageId>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<String>>>,
}

impl ReplicaState {
    fn notify(&mut self) {
        let view = self.mirror.view();
        self.subscribers.retain(|tx| tx.send(view.clone()).is_ok());
    }
}

pub struct Replicator {
    lobby_id: String,
    peer_id: String,
    display_name: String,
    accessor: RateLimitedAccessor,
    clock: Arc<dyn Clock>,
    config: ReplicatorConfig,
    op_guard: Mutex<()>,
    state: Mutex<ReplicaState>,
    attached: AtomicBool,
}

impl Replicator {
    /// Creates a replicator with an empty ledger and mirror
    pub fn new(
        lobby_id: impl Into<String>,
        identity: &dyn IdentityService,
        display_name: impl Into<String>,
        accessor: RateLimitedAccessor,
        clock: Arc<dyn Clock>,
        config: ReplicatorConfig,
    ) -> Self {
        let state = ReplicaState {
            phase: Phase::Idle,
            ledger: DedupLedger::new(config.ledger_cap),
            mirror: LocalMirror::new(config.capacity),
            last_send: None,
            host_id: None,
            undrained: None,
            in_doubt: Vec::new(),
            subscribers: Vec::new(),
        };

        Self {
            lobby_id: lobby_id.into(),
            peer_id: identity.current_peer_id(),
            display_name: display_name.into(),
            accessor,
            clock,
            config,
            op_guard: Mutex::new(()),
            state: Mutex::new(state),
            attached: AtomicBool::new(true),
        }
    }

    pub fn lobby_id(&self) -> &str {
        &self.lobby_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Stops applying results. An operation already in flight completes but
    /// its outcome no longer reaches the mirror or subscribers.
    pub fn detach(&self) {
        if self.attached.swap(false, Ordering::SeqCst) {
            info!("{} detached from lobby {}", self.peer_id, self.lobby_id);
        }
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Whether the last observed document named this peer as host
    pub async fn is_host(&self) -> bool {
        self.state.lock().await.host_id.as_deref() == Some(self.peer_id.as_str())
    }

    /// Current presentation view of the chat
    pub async fn messages(&self) -> Vec<String> {
        self.state.lock().await.mirror.view()
    }

    pub async fn fingerprint(&self) -> Option<Fingerprint> {
        self.state.lock().await.mirror.fingerprint()
    }

    /// Registers a chat update subscriber. Each message is the full ordered
    /// chat view, to be treated as a replacement.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.subscribers.push(tx);
        rx
    }

    /// Reads the document once and processes it
    pub async fn poll(&self) -> PollOutcome {
        let Ok(_guard) = self.op_guard.try_lock() else {
            debug!("{} skipped a poll, operation in progress", self.peer_id);
            return PollOutcome::Skipped;
        };
        if !self.is_attached() {
            return PollOutcome::Detached;
        }

        self.set_phase(Phase::Polling).await;
        let outcome = match self.accessor.read(&self.lobby_id).await {
            Ok(doc) => self.process_document(doc).await,
            Err(e) => {
                debug!("Poll of lobby {} failed: {}", self.lobby_id, e);
                PollOutcome::Failed(e)
            }
        };
        self.set_phase(Phase::Idle).await;

        outcome
    }

    /// Processes a document snapshot read by someone else
    pub async fn observe(&self, doc: Document) -> PollOutcome {
        let Ok(_guard) = self.op_guard.try_lock() else {
            debug!("{} skipped a snapshot, operation in progress", self.peer_id);
            return PollOutcome::Skipped;
        };

        let outcome = self.process_document(doc).await;
        self.set_phase(Phase::Idle).await;
        outcome
    }

    /// Submits a chat message. Delivery is observed through subscribers; the
    /// returned outcome only says what this peer did.
    pub async fn send_chat(&self, text: &str) -> SendOutcome {
        let text = codec::sanitize(text);
        if text.is_empty() {
            return SendOutcome::RejectedEmpty;
        }
        if !self.is_attached() {
            return SendOutcome::Detached;
        }

        let now = self.clock.now_millis();
        {
            let mut state = self.state.lock().await;
            let cooldown = self.config.send_cooldown.as_millis() as u64;
            if let Some(last) = state.last_send {
                if now.saturating_sub(last) < cooldown {
                    warn!("{} is sending too fast, message dropped", self.peer_id);
                    return SendOutcome::RejectedCooldown;
                }
            }
            state.last_send = Some(now);
        }

        let _guard = self.op_guard.lock().await;
        if !self.is_attached() {
            return SendOutcome::Detached;
        }

        self.set_phase(Phase::Submitting).await;
        let outcome = self.submit(&text, now).await;
        self.set_phase(Phase::Idle).await;

        outcome
    }

    async fn submit(&self, text: &str, now: u64) -> SendOutcome {
        let known_host = self.state.lock().await.host_id.clone();

        // The host path needs a fresh copy of the chat slots; a peer that
        // knows it is not host can write its pending slot blind.
        if known_host.is_some_and(|host| host != self.peer_id) {
            return self.submit_as_client(text, now).await;
        }

        let doc = match self.accessor.read(&self.lobby_id).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("{} could not read lobby before sending: {}", self.peer_id, e);
                return SendOutcome::Failed(e);
            }
        };
        self.record_host(&doc).await;

        if doc.is_host(&self.peer_id) {
            let display = codec::format_display(&self.display_name, text, now);
            match self.arbitrate(&doc, Some(display)).await {
                Ok(_) => SendOutcome::Committed,
                Err(e) => SendOutcome::Failed(e),
            }
        } else {
            self.submit_as_client(text, now).await
        }
    }

    async fn submit_as_client(&self, text: &str, now: u64) -> SendOutcome {
        if let Some(id) = &self.state.lock().await.undrained {
            warn!("{} still has {} waiting for the host, message dropped", self.peer_id, id);
            return SendOutcome::RejectedPending;
        }

        let patch = patch_of(PENDING_KEY, codec::encode_pending(now, text));
        if let Err(e) = self
            .accessor
            .write_peer(&self.lobby_id, &self.peer_id, &patch)
            .await
        {
            return SendOutcome::Failed(e);
        }

        let mut state = self.state.lock().await;
        state.undrained = Some(MessageId::new(&self.peer_id, now));
        if self.is_attached() {
            let display = codec::format_display(&self.display_name, text, now);
            state.mirror.push_placeholder(display, now);
            state.notify();
        }
        SendOutcome::Queued
    }

    async fn process_document(&self, doc: Document) -> PollOutcome {
        if !self.is_attached() {
            return PollOutcome::Detached;
        }
        self.record_host(&doc).await;
        self.track_own_pending(&doc).await;

        let mut failure = None;
        if doc.is_host(&self.peer_id) {
            match self.arbitrate(&doc, None).await {
                Ok(Some(report)) if report.applied > 0 => {
                    return PollOutcome::Merged {
                        applied: report.applied,
                    }
                }
                Ok(Some(report)) if report.changed => return PollOutcome::Changed,
                Ok(Some(_)) => return PollOutcome::Unchanged,
                Ok(None) => {}
                Err(e) => {
                    warn!("Merge in lobby {} failed, retrying next tick: {}", self.lobby_id, e);
                    failure = Some(e);
                }
            }
        }

        let changed = self.detect_change(&doc).await;
        match failure {
            Some(e) => PollOutcome::Failed(e),
            None if changed => PollOutcome::Changed,
            None => PollOutcome::Unchanged,
        }
    }

    /// Host side: writes the merged chat slots, then records the applied ids
    /// and clears drained pending slots. `None` means there was nothing to do.
    async fn arbitrate(
        &self,
        doc: &Document,
        local: Option<String>,
    ) -> Result<Option<MergeReport>, ServiceError> {
        let submitting = local.is_some();
        let plan = {
            let mut state = self.state.lock().await;
            settle_in_doubt(&mut state, doc, self.config.capacity);
            plan_merge(doc, &state.ledger, self.config.capacity, local)
        };

        if !plan.needs_write && plan.to_clear.is_empty() {
            return Ok(None);
        }
        if !submitting {
            self.set_phase(Phase::Merging).await;
        }

        if plan.needs_write {
            let patch = codec::chat_patch(&doc.data, &plan.messages, self.config.capacity);
            if let Err(e) = self.accessor.write(&self.lobby_id, &patch).await {
                self.state.lock().await.in_doubt = plan.applied;
                return Err(e);
            }
        }

        let applied = plan.applied.len();
        if applied > 0 {
            debug!(
                "Host {} applied {} pending messages in lobby {}",
                self.peer_id, applied, self.lobby_id
            );
        }

        let changed = {
            let mut state = self.state.lock().await;
            for id in plan.applied {
                state.ledger.mark(id);
            }
            let changed = self.is_attached()
                && state
                    .mirror
                    .apply(plan.messages, self.clock.now_millis(), self.grace_millis());
            if changed {
                state.notify();
            }
            changed
        };

        let clear = patch_of(PENDING_KEY, "");
        for peer_id in &plan.to_clear {
            // The ledger already covers this message if the clear is lost
            if let Err(e) = self.accessor.write_peer(&self.lobby_id, peer_id, &clear).await {
                warn!("Could not clear pending slot of {}: {}", peer_id, e);
            }
        }

        Ok(Some(MergeReport { applied, changed }))
    }

    async fn detect_change(&self, doc: &Document) -> bool {
        let decoded = codec::decode_chat_slots(&doc.data, self.config.capacity);
        for key in &decoded.malformed {
            debug!("Ignoring malformed chat slot {} in lobby {}", key, self.lobby_id);
        }

        let mut state = self.state.lock().await;
        if !self.is_attached() {
            return false;
        }

        let changed = state
            .mirror
            .apply(decoded.messages, self.clock.now_millis(), self.grace_millis());
        if changed {
            state.notify();
        }
        changed
    }

    /// Releases the client send gate once the own pending slot no longer
    /// holds the last submitted message
    async fn track_own_pending(&self, doc: &Document) {
        let mut state = self.state.lock().await;
        let Some(waiting) = &state.undrained else {
            return;
        };

        let still_pending = doc
            .player(&self.peer_id)
            .and_then(|record| record.data.get(PENDING_KEY))
            .and_then(|raw| codec::decode_pending(raw).ok().flatten())
            .is_some_and(|pending| pending.id(&self.peer_id) == *waiting);

        if !still_pending {
            debug!("{} pending message {} drained", self.peer_id, waiting);
            state.undrained = None;
        }
    }

    async fn record_host(&self, doc: &Document) {
        let mut state = self.state.lock().await;
        if state.host_id.as_deref() != Some(doc.host_id.as_str()) {
            if doc.is_host(&self.peer_id) {
                info!("{} is host of lobby {}", self.peer_id, self.lobby_id);
            }
            state.host_id = Some(doc.host_id.clone());
        }
    }

    async fn set_phase(&self, phase: Phase) {
        self.state.lock().await.phase = phase;
    }

    fn grace_millis(&self) -> u64 {
        self.config.placeholder_grace.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::BackoffPolicy;
    use crate::mirror::SENDING_SUFFIX;
    use server::{LobbyBackend, MemoryDocumentService};
    use shared::codec::{chat_key, decode_chat_slots, format_display};
    use shared::{DocumentService, LobbyMembership, ManualClock, Patch, PeerRecord, StaticIdentity, NAME_KEY};
    use std::sync::atomic::AtomicUsize;

    const LOBBY: &str = "lobby";

    fn test_config(capacity: usize) -> ReplicatorConfig {
        ReplicatorConfig {
            capacity,
            send_cooldown: Duration::ZERO,
            ..ReplicatorConfig::lobby_chat()
        }
    }

    fn replicator(
        backend: &LobbyBackend,
        peer_id: &str,
        clock: &Arc<ManualClock>,
        config: ReplicatorConfig,
    ) -> Replicator {
        let service = Arc::new(backend.service_for(peer_id));
        let accessor = RateLimitedAccessor::new(
            service,
            BackoffPolicy {
                base_delay: Duration::from_millis(1),
                max_attempts: 3,
            },
        );
        Replicator::new(
            LOBBY,
            &StaticIdentity::new(peer_id),
            peer_id,
            accessor,
            clock.clone(),
            config,
        )
    }

    async fn lobby_with(peers: &[&str]) -> LobbyBackend {
        let backend = LobbyBackend::unlimited();
        let (host, guests) = peers.split_first().unwrap();
        backend
            .service_for(host)
            .create_lobby(LOBBY, patch_of(NAME_KEY, *host))
            .await
            .unwrap();
        for guest in guests {
            backend
                .service_for(guest)
                .join_lobby(LOBBY, patch_of(NAME_KEY, *guest))
                .await
                .unwrap();
        }
        backend
    }

    async fn chat_slots(backend: &LobbyBackend) -> Vec<String> {
        let doc = backend.inspect(LOBBY).await.unwrap();
        decode_chat_slots(&doc.data, 50).messages
    }

    async fn pending_of(backend: &LobbyBackend, peer_id: &str) -> Option<String> {
        let doc = backend.inspect(LOBBY).await.unwrap();
        doc.player(peer_id).unwrap().data.get(PENDING_KEY).cloned()
    }

    fn guest_service(backend: &LobbyBackend, peer_id: &str) -> MemoryDocumentService {
        backend.service_for(peer_id)
    }

    /// Fails the next `failures` lobby writes, optionally after applying them
    /// as a server whose replies get lost would
    struct UnreliableWrites {
        inner: MemoryDocumentService,
        failures: AtomicUsize,
        applies_anyway: bool,
    }

    #[async_trait::async_trait]
    impl DocumentService for UnreliableWrites {
        async fn get(&self, lobby_id: &str) -> Result<Document, ServiceError> {
            self.inner.get(lobby_id).await
        }

        async fn update(&self, lobby_id: &str, patch: Patch) -> Result<Document, ServiceError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !failing {
                return self.inner.update(lobby_id, patch).await;
            }
            if self.applies_anyway {
                self.inner.update(lobby_id, patch).await?;
            }
            Err(ServiceError::Transient("reply lost".to_string()))
        }

        async fn update_peer_data(
            &self,
            lobby_id: &str,
            peer_id: &str,
            patch: Patch,
        ) -> Result<(), ServiceError> {
            self.inner.update_peer_data(lobby_id, peer_id, patch).await
        }
    }

    fn unreliable_host(
        backend: &LobbyBackend,
        clock: &Arc<ManualClock>,
        failures: usize,
        applies_anyway: bool,
    ) -> Replicator {
        let service = Arc::new(UnreliableWrites {
            inner: backend.service_for("host"),
            failures: AtomicUsize::new(failures),
            applies_anyway,
        });
        let accessor = RateLimitedAccessor::new(
            service,
            BackoffPolicy {
                base_delay: Duration::from_millis(1),
                max_attempts: 3,
            },
        );
        Replicator::new(
            LOBBY,
            &StaticIdentity::new("host"),
            "host",
            accessor,
            clock.clone(),
            test_config(10),
        )
    }

    fn doc_with_pending(pending: &[(&str, &str)]) -> Document {
        let mut doc = Document::new(LOBBY, "host");
        doc.players.push(PeerRecord::new("host"));
        for (peer, value) in pending {
            let mut record = PeerRecord::new(*peer);
            record.data.insert(PENDING_KEY.to_string(), value.to_string());
            doc.players.push(record);
        }
        doc
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(ReplicatorConfig::lobby_chat().capacity, 10);
        assert_eq!(ReplicatorConfig::chat_log().capacity, 50);
        assert_eq!(ReplicatorConfig::default().capacity, 10);
    }

    #[test]
    fn test_plan_merge_skips_malformed_slot() {
        let doc = doc_with_pending(&[
            ("a", "1000:one"),
            ("b", "garbage"),
            ("c", "1001:two"),
            ("d", "1002:three"),
        ]);

        let plan = plan_merge(&doc, &DedupLedger::default(), 10, None);

        assert_eq!(plan.messages.len(), 3);
        assert!(plan.messages[0].ends_with("a: one"));
        assert!(plan.messages[1].ends_with("c: two"));
        assert!(plan.messages[2].ends_with("d: three"));
        assert_eq!(plan.to_clear, vec!["a", "b", "c", "d"]);
        assert!(plan.needs_write);
    }

    #[test]
    fn test_plan_merge_ignores_applied_ids() {
        let doc = doc_with_pending(&[("a", "1000:hello")]);
        let mut ledger = DedupLedger::default();
        ledger.mark(MessageId::new("a", 1000));

        let plan = plan_merge(&doc, &ledger, 10, None);

        assert!(plan.messages.is_empty());
        assert!(plan.applied.is_empty());
        assert!(!plan.needs_write);
        assert_eq!(plan.to_clear, vec!["a"]);
    }

    #[test]
    fn test_plan_merge_same_millisecond_different_peers() {
        let doc = doc_with_pending(&[("a", "1000:left"), ("b", "1000:right")]);

        let plan = plan_merge(&doc, &DedupLedger::default(), 10, None);

        assert_eq!(plan.applied, vec![MessageId::new("a", 1000), MessageId::new("b", 1000)]);
        assert_eq!(plan.messages.len(), 2);
    }

    #[test]
    fn test_plan_merge_local_before_pending_and_trimmed() {
        let mut doc = doc_with_pending(&[("a", "1000:pending")]);
        doc.data.insert(chat_key(0), "old-0".to_string());
        doc.data.insert(chat_key(1), "old-1".to_string());

        let plan = plan_merge(&doc, &DedupLedger::default(), 3, Some("local".to_string()));

        assert_eq!(plan.messages.len(), 3);
        assert_eq!(plan.messages[0], "old-1");
        assert_eq!(plan.messages[1], "local");
        assert!(plan.messages[2].ends_with("a: pending"));
    }

    #[test]
    fn test_plan_merge_nothing_to_do() {
        let mut doc = doc_with_pending(&[]);
        doc.data.insert(chat_key(0), "kept".to_string());

        let plan = plan_merge(&doc, &DedupLedger::default(), 10, None);
        assert_eq!(plan.messages, vec!["kept"]);
        assert!(!plan.needs_write);
        assert!(plan.to_clear.is_empty());
    }

    #[tokio::test]
    async fn test_host_send_keeps_most_recent_within_capacity() {
        let backend = lobby_with(&["host"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let host = replicator(&backend, "host", &clock, test_config(3));

        for text in ["hi", "a", "b", "c"] {
            assert_eq!(host.send_chat(text).await, SendOutcome::Committed);
            clock.advance(Duration::from_secs(1));
        }

        let slots = chat_slots(&backend).await;
        assert_eq!(slots.len(), 3);
        assert!(slots[0].ends_with("host: a"));
        assert!(slots[1].ends_with("host: b"));
        assert!(slots[2].ends_with("host: c"));
        assert_eq!(host.messages().await, slots);
    }

    #[tokio::test]
    async fn test_host_send_updates_mirror_without_extra_read() {
        let backend = lobby_with(&["host"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let host = replicator(&backend, "host", &clock, test_config(10));
        let mut updates = host.subscribe().await;

        host.send_chat("hi").await;

        let update = updates.try_recv().unwrap();
        assert_eq!(update, vec![format_display("host", "hi", 1_000)]);
        assert!(host.fingerprint().await.is_some());
        assert_eq!(host.poll().await, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_client_then_host_drain() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(5_000));
        let host = replicator(&backend, "host", &clock, test_config(10));

        guest_service(&backend, "guest")
            .update_peer_data(LOBBY, "guest", patch_of(PENDING_KEY, "1000:hello"))
            .await
            .unwrap();

        assert_eq!(host.poll().await, PollOutcome::Merged { applied: 1 });
        assert_eq!(chat_slots(&backend).await, vec![format_display("guest", "hello", 1000)]);
        assert_eq!(pending_of(&backend, "guest").await, None);

        assert_eq!(host.poll().await, PollOutcome::Unchanged);
        assert_eq!(chat_slots(&backend).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_merge_keeps_pending_and_retries() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(5_000));
        let host = unreliable_host(&backend, &clock, 3, false);

        guest_service(&backend, "guest")
            .update_peer_data(LOBBY, "guest", patch_of(PENDING_KEY, "1000:hello"))
            .await
            .unwrap();

        assert!(matches!(host.poll().await, PollOutcome::Failed(ServiceError::Transient(_))));
        assert_eq!(pending_of(&backend, "guest").await, Some("1000:hello".to_string()));
        assert!(chat_slots(&backend).await.is_empty());
        assert!(host.state.lock().await.ledger.is_empty());

        assert_eq!(host.poll().await, PollOutcome::Merged { applied: 1 });
        assert_eq!(chat_slots(&backend).await, vec![format_display("guest", "hello", 1000)]);
        assert_eq!(pending_of(&backend, "guest").await, None);
    }

    #[tokio::test]
    async fn test_landed_write_with_lost_reply_not_applied_twice() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(5_000));
        let host = unreliable_host(&backend, &clock, 3, true);

        guest_service(&backend, "guest")
            .update_peer_data(LOBBY, "guest", patch_of(PENDING_KEY, "1000:hello"))
            .await
            .unwrap();

        assert!(matches!(host.poll().await, PollOutcome::Failed(_)));
        assert_eq!(chat_slots(&backend).await.len(), 1);
        assert_eq!(pending_of(&backend, "guest").await, Some("1000:hello".to_string()));

        assert_eq!(host.poll().await, PollOutcome::Changed);
        assert_eq!(chat_slots(&backend).await, vec![format_display("guest", "hello", 1000)]);
        assert_eq!(pending_of(&backend, "guest").await, None);
        assert_eq!(host.poll().await, PollOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_client_holds_second_message_until_drained() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(0));
        let host = replicator(&backend, "host", &clock, ReplicatorConfig::lobby_chat());
        let guest = replicator(&backend, "guest", &clock, ReplicatorConfig::lobby_chat());

        assert_eq!(guest.send_chat("one").await, SendOutcome::Queued);
        clock.advance(Duration::from_millis(1100));
        assert_eq!(guest.send_chat("two").await, SendOutcome::RejectedPending);
        assert_eq!(pending_of(&backend, "guest").await, Some("0:one".to_string()));

        assert_eq!(host.poll().await, PollOutcome::Merged { applied: 1 });
        guest.poll().await;
        clock.advance(Duration::from_secs(1));
        assert_eq!(guest.send_chat("two").await, SendOutcome::Queued);
        assert_eq!(host.poll().await, PollOutcome::Merged { applied: 1 });

        let slots = chat_slots(&backend).await;
        assert_eq!(slots.len(), 2);
        assert!(slots[0].ends_with("guest: one"));
        assert!(slots[1].ends_with("guest: two"));
    }

    #[tokio::test]
    async fn test_re_presented_pending_not_applied_twice() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(5_000));
        let host = replicator(&backend, "host", &clock, test_config(10));
        let guest = guest_service(&backend, "guest");

        guest
            .update_peer_data(LOBBY, "guest", patch_of(PENDING_KEY, "1000:hello"))
            .await
            .unwrap();
        host.poll().await;

        // Same submission shows up again, e.g. a stale write landing late
        guest
            .update_peer_data(LOBBY, "guest", patch_of(PENDING_KEY, "1000:hello"))
            .await
            .unwrap();
        host.poll().await;

        assert_eq!(chat_slots(&backend).await.len(), 1);
        assert_eq!(pending_of(&backend, "guest").await, None);
    }

    #[tokio::test]
    async fn test_client_send_writes_pending_only() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(2_000));
        let guest = replicator(&backend, "guest", &clock, test_config(10));
        let mut updates = guest.subscribe().await;

        assert_eq!(guest.send_chat("hello").await, SendOutcome::Queued);

        assert_eq!(pending_of(&backend, "guest").await, Some("2000:hello".to_string()));
        assert!(chat_slots(&backend).await.is_empty());

        let optimistic = updates.try_recv().unwrap();
        assert_eq!(
            optimistic,
            vec![format!("{}{}", format_display("guest", "hello", 2_000), SENDING_SUFFIX)]
        );
    }

    #[tokio::test]
    async fn test_placeholder_superseded_after_host_drain() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(2_000));
        let host = replicator(&backend, "host", &clock, test_config(10));
        let guest = replicator(&backend, "guest", &clock, test_config(10));

        guest.poll().await;
        guest.send_chat("hello").await;
        host.poll().await;
        assert_eq!(guest.poll().await, PollOutcome::Changed);

        assert_eq!(guest.messages().await, vec![format_display("guest", "hello", 2_000)]);
    }

    #[tokio::test]
    async fn test_cooldown_rejects_fast_sends() {
        let backend = lobby_with(&["host"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let config = ReplicatorConfig {
            send_cooldown: Duration::from_secs(1),
            ..test_config(10)
        };
        let host = replicator(&backend, "host", &clock, config);

        assert_eq!(host.send_chat("one").await, SendOutcome::Committed);
        clock.advance(Duration::from_millis(500));
        assert_eq!(host.send_chat("two").await, SendOutcome::RejectedCooldown);
        assert_eq!(host.phase().await, Phase::Idle);
        clock.advance(Duration::from_millis(500));
        assert_eq!(host.send_chat("three").await, SendOutcome::Committed);

        assert_eq!(chat_slots(&backend).await.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let backend = lobby_with(&["host"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let host = replicator(&backend, "host", &clock, test_config(10));

        assert_eq!(host.send_chat("   ").await, SendOutcome::RejectedEmpty);
    }

    #[tokio::test]
    async fn test_poll_skipped_while_operation_in_progress() {
        let backend = lobby_with(&["host"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let host = replicator(&backend, "host", &clock, test_config(10));

        let guard = host.op_guard.lock().await;
        assert_eq!(host.poll().await, PollOutcome::Skipped);
        assert_eq!(host.observe(Document::new(LOBBY, "host")).await, PollOutcome::Skipped);
        drop(guard);

        assert_eq!(host.poll().await, PollOutcome::Changed);
    }

    #[tokio::test]
    async fn test_notifications_fire_once_per_change() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let host = replicator(&backend, "host", &clock, test_config(10));
        let guest = replicator(&backend, "guest", &clock, test_config(10));
        let mut updates = guest.subscribe().await;

        guest.poll().await;
        guest.poll().await;
        host.send_chat("hi").await;
        guest.poll().await;
        guest.poll().await;

        let mut received = Vec::new();
        while let Ok(update) = updates.try_recv() {
            received.push(update);
        }
        assert_eq!(received.len(), 2);
        assert!(received[0].is_empty());
        assert_eq!(received[1], vec![format_display("host", "hi", 1_000)]);
    }

    #[tokio::test]
    async fn test_detached_replicator_discards_results() {
        let backend = lobby_with(&["host"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let host = replicator(&backend, "host", &clock, test_config(10));
        let mut updates = host.subscribe().await;

        host.detach();
        assert!(!host.is_attached());
        assert_eq!(host.poll().await, PollOutcome::Detached);
        assert_eq!(host.send_chat("hi").await, SendOutcome::Detached);
        assert!(updates.try_recv().is_err());
        assert!(chat_slots(&backend).await.is_empty());
    }

    #[tokio::test]
    async fn test_client_write_outside_lobby_fails() {
        let backend = lobby_with(&["host"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let outsider = replicator(&backend, "outsider", &clock, test_config(10));

        match outsider.send_chat("hello").await {
            SendOutcome::Failed(ServiceError::Forbidden(_)) => {}
            other => panic!("Unexpected outcome {:?}", other),
        }
        assert_eq!(outsider.phase().await, Phase::Idle);
    }

    #[tokio::test]
    async fn test_promoted_host_drains_outstanding_pending() {
        let backend = lobby_with(&["host", "guest", "third"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let guest = replicator(&backend, "guest", &clock, test_config(10));

        guest_service(&backend, "third")
            .update_peer_data(LOBBY, "third", patch_of(PENDING_KEY, "900:still here"))
            .await
            .unwrap();
        guest_service(&backend, "host").leave_lobby(LOBBY).await.unwrap();

        assert_eq!(guest.poll().await, PollOutcome::Merged { applied: 1 });
        assert!(guest.is_host().await);
        assert_eq!(chat_slots(&backend).await, vec![format_display("third", "still here", 900)]);
    }

    #[tokio::test]
    async fn test_observe_snapshot_drives_change_detection() {
        let backend = lobby_with(&["host", "guest"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let guest = replicator(&backend, "guest", &clock, test_config(10));

        let mut snapshot = Document::new(LOBBY, "host");
        snapshot.data.insert(chat_key(0), "from snapshot".to_string());

        assert_eq!(guest.observe(snapshot.clone()).await, PollOutcome::Changed);
        assert_eq!(guest.observe(snapshot).await, PollOutcome::Unchanged);
        assert_eq!(guest.messages().await, vec!["from snapshot"]);
    }

    #[tokio::test]
    async fn test_host_rewrites_over_malformed_chat_slot() {
        let backend = lobby_with(&["host"]).await;
        let clock = Arc::new(ManualClock::new(1_000));
        let host = replicator(&backend, "host", &clock, test_config(10));

        let mut patch = Patch::new();
        patch.insert(chat_key(0), "fine".to_string());
        patch.insert(chat_key(1), "bro\u{1}ken".to_string());
        backend.service_for("host").update(LOBBY, patch).await.unwrap();

        assert_eq!(host.poll().await, PollOutcome::Changed);
        assert_eq!(chat_slots(&backend).await, vec!["fine"]);
        assert_eq!(host.messages().await, vec!["fine"]);
    }
}
