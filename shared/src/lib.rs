//! Types and encodings shared by the lobby document server and lobby peers

pub mod clock;
pub mod codec;
pub mod document;
pub mod protocol;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CodecError, MessageId, PendingMessage};
pub use document::{
    Document, DocumentService, ErrorClass, IdentityService, LobbyMembership, Patch, PeerRecord,
    ServiceError, StaticIdentity,
};
pub use protocol::{Operation, Packet, Reply};

/// Prefix of the host-owned chat slot keys in the lobby data bag
pub const CHAT_KEY_PREFIX: &str = "Chat_";
/// Key of the per-peer pending chat slot in each player record
pub const PENDING_KEY: &str = "ChatPending";
/// Key of the display name in each player record
pub const NAME_KEY: &str = "Name";

/// Chat slots used by the lobby chat window
pub const LOBBY_CHAT_CAPACITY: usize = 10;
/// Chat slots used by the longer secondary chat log
pub const CHAT_LOG_CAPACITY: usize = 50;
/// Longest chat text accepted, in characters
pub const MAX_MESSAGE_CHARS: usize = 200;

/// Builds a single-entry patch
pub fn patch_of(key: &str, value: impl Into<String>) -> Patch {
    let mut patch = Patch::new();
    patch.insert(key.to_string(), value.into());
    patch
}
