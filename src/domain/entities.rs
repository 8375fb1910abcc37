//! Domain entities. Pure data structures for the core business.
//!
//! No Telegram/IO types here — these are mapped from adapters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::media::MediaKind;

/// Basic channel metadata, used for download-folder derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: i64,
    pub title: String,
    pub username: Option<String>,
}

/// Account details captured once per session after connect.
///
/// The premium flag decides the caption length cap for everything published
/// through that session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub user_id: i64,
    pub display_name: String,
    pub is_premium: bool,
    pub dc_id: Option<i32>,
}

impl AccountInfo {
    /// Caption length cap for this account tier.
    pub fn caption_limit(&self) -> usize {
        if self.is_premium { 4096 } else { 1024 }
    }
}

/// Width/height/duration hints attached to a media descriptor. All optional;
/// the platform omits them for most kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMeta {
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration_secs: Option<f64>,
}

/// Decoded location of a file's bytes, used by the chunked-raw download path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub media_id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    pub dc_id: i32,
    pub thumb_size: Option<String>,
    pub is_photo: bool,
}

/// Opaque handle to an already-uploaded blob. Re-sending through this handle
/// does not re-upload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub media_id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    pub is_photo: bool,
}

/// Media payload description on a message snapshot.
#[derive(Debug, Clone)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    /// Size declared by the platform; absent for photos in some layers.
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub meta: MediaMeta,
    /// Raw-path location; absent when the adapter could not decode one.
    pub location: Option<FileLocation>,
}

/// Immutable message snapshot captured from the platform. Only valid (not
/// platform-empty) messages are materialized; adapters drop the rest.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i32,
    pub chat_id: i64,
    /// Album identifier; messages sharing one form an indivisible group.
    pub group_id: Option<String>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub media: Option<MediaDescriptor>,
}

/// Estimate used for pure-text messages in load balancing.
pub const TEXT_SIZE_ESTIMATE: u64 = 1024;

impl Message {
    /// Estimated byte size: the platform's declared size when available,
    /// otherwise the per-kind default. Tunes the load balancer only.
    pub fn estimated_size(&self) -> u64 {
        match &self.media {
            Some(m) => m.file_size.unwrap_or_else(|| m.kind.spec().default_estimate),
            None => TEXT_SIZE_ESTIMATE,
        }
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

/// Where a downloaded artifact lives.
#[derive(Debug, Clone)]
pub enum ItemPayload {
    /// Written to the downloads tree; size verified against the declared one.
    OnDisk { path: PathBuf, size: u64 },
    /// Kept in memory for the staging pipeline.
    InMemory { bytes: Vec<u8>, md5_hex: String },
}

impl ItemPayload {
    pub fn size(&self) -> u64 {
        match self {
            ItemPayload::OnDisk { size, .. } => *size,
            ItemPayload::InMemory { bytes, .. } => bytes.len() as u64,
        }
    }
}

/// Product of a downloader: one message's media, on disk or in memory,
/// together with everything the publisher needs to re-send it.
#[derive(Debug, Clone)]
pub struct DownloadedItem {
    pub message_id: i32,
    pub session: String,
    pub kind: MediaKind,
    pub file_name: String,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub group_id: Option<String>,
    pub meta: MediaMeta,
    pub payload: ItemPayload,
}

impl DownloadedItem {
    pub fn size(&self) -> u64 {
        self.payload.size()
    }
}

/// A downloaded item after the scratch-upload captured its platform handle.
/// Deleted from the scratch chat once publishing settles.
#[derive(Debug, Clone)]
pub struct StagedItem {
    pub origin_message_id: i32,
    pub scratch_message_id: i32,
    pub file_ref: FileRef,
    pub kind: MediaKind,
    pub caption: Option<String>,
    pub meta: MediaMeta,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::media::MediaKind;

    fn message_with(kind: MediaKind, file_size: Option<u64>) -> Message {
        Message {
            id: 1,
            chat_id: 10,
            group_id: None,
            text: None,
            caption: None,
            media: Some(MediaDescriptor {
                kind,
                file_size,
                mime_type: None,
                file_name: None,
                meta: MediaMeta::default(),
                location: None,
            }),
        }
    }

    #[test]
    fn test_caption_limit_by_tier() {
        let premium = AccountInfo {
            user_id: 1,
            display_name: "a".into(),
            is_premium: true,
            dc_id: None,
        };
        let regular = AccountInfo { is_premium: false, ..premium.clone() };
        assert_eq!(premium.caption_limit(), 4096);
        assert_eq!(regular.caption_limit(), 1024);
    }

    #[test]
    fn test_estimated_size_prefers_declared() {
        let msg = message_with(MediaKind::Video, Some(123));
        assert_eq!(msg.estimated_size(), 123);
    }

    #[test]
    fn test_estimated_size_falls_back_to_kind_default() {
        let msg = message_with(MediaKind::Video, None);
        assert_eq!(msg.estimated_size(), 37 * 1024 * 1024);
    }

    #[test]
    fn test_estimated_size_text_only() {
        let msg = Message {
            id: 2,
            chat_id: 10,
            group_id: None,
            text: Some("hi".into()),
            caption: None,
            media: None,
        };
        assert_eq!(msg.estimated_size(), TEXT_SIZE_ESTIMATE);
    }
}
