//! Chat-platform gateway port. One instance == one authenticated session.
//!
//! The application calls these from the pool, fetcher, downloader and
//! publisher; the grammers adapter implements them. All types crossing this
//! boundary are domain types.

use std::sync::Arc;

use crate::domain::{
    AccountInfo, ChatInfo, DomainError, FileLocation, FileRef, MediaKind, MediaMeta, Message,
};

/// Scratch chat alias: the account's own chat with itself.
pub const SELF_CHAT: &str = "me";

/// Payload handed to the scratch-upload call. The adapter picks the
/// kind-specific send method.
#[derive(Debug)]
pub struct OutgoingMedia {
    pub kind: MediaKind,
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub caption: Option<String>,
    pub meta: MediaMeta,
}

/// Result of a scratch upload: the message it landed as, and the platform
/// handle that re-sends the blob without re-uploading bytes.
#[derive(Debug, Clone)]
pub struct StagedMessage {
    pub message_id: i32,
    pub file_ref: FileRef,
}

/// One element of a media-group send call, referencing an already-uploaded
/// blob.
#[derive(Debug, Clone)]
pub struct PublishItem {
    pub kind: MediaKind,
    pub file_ref: FileRef,
    pub caption: Option<String>,
    pub meta: MediaMeta,
}

/// Pull-based chunk stream over one file's bytes.
#[async_trait::async_trait]
pub trait MediaStream: Send {
    /// Next chunk, or `None` when the file is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DomainError>;
}

/// Gateway to the chat platform for a single session.
///
/// Rate limits surface as [`DomainError::FloodWait`] carrying the wait in
/// seconds; callers decide whether to sleep-and-retry.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    /// Stable session name (the credential file stem).
    fn name(&self) -> &str;

    /// Connect and verify authorization; returns the account snapshot.
    /// Authentication happens exactly once per process lifetime.
    async fn connect(&self) -> Result<AccountInfo, DomainError>;

    /// Orderly teardown. "Already closed" conditions are not errors.
    async fn disconnect(&self) -> Result<(), DomainError>;

    /// Channel metadata; used only for download-folder derivation.
    async fn get_chat(&self, channel: &str) -> Result<ChatInfo, DomainError>;

    /// Batch read by explicit ids. Platform-empty placeholders and service
    /// messages are dropped, so the result may be shorter than `ids`.
    async fn get_messages(&self, channel: &str, ids: &[i32])
        -> Result<Vec<Message>, DomainError>;

    /// Open the platform's streaming download for a message's media.
    async fn open_stream(
        &self,
        channel: &str,
        message_id: i32,
    ) -> Result<Box<dyn MediaStream>, DomainError>;

    /// Raw chunked read at an explicit offset. Only valid when the file's
    /// datacenter matches [`ChatGateway::home_dc`].
    async fn fetch_file_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<u8>, DomainError>;

    /// Datacenter this session is connected to, when known.
    fn home_dc(&self) -> Option<i32>;

    /// Upload bytes to a chat with the kind-specific send method and capture
    /// the issued file handle.
    async fn send_media(
        &self,
        chat: &str,
        media: OutgoingMedia,
    ) -> Result<StagedMessage, DomainError>;

    /// Atomic multi-item publish. Returns the new message ids (best effort).
    async fn send_media_group(
        &self,
        chat: &str,
        items: &[PublishItem],
    ) -> Result<Vec<i32>, DomainError>;

    /// Delete messages from a chat (scratch cleanup).
    async fn delete_messages(&self, chat: &str, ids: &[i32]) -> Result<(), DomainError>;
}

/// Creates gateways from persisted session credentials.
#[async_trait::async_trait]
pub trait GatewayFactory: Send + Sync {
    /// Open the named session's credentials. Fails with a configuration
    /// error when no credential file exists for the name.
    async fn open(&self, session_name: &str) -> Result<Arc<dyn ChatGateway>, DomainError>;
}
