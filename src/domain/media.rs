//! Media kinds and the per-kind dispatch table.
//!
//! One table drives filename generation, load estimates, batching families
//! and the publish descriptor class, instead of branching on kind at every
//! call site.

use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;

/// Media kind carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    VideoNote,
    Animation,
    Sticker,
}

/// Family a kind batches with when packing unrelated items into one album.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindFamily {
    /// Photos, videos and animations share an album.
    Visual,
    /// Audio and voice notes.
    Audio,
    /// Documents, plus everything that cannot join another family.
    Document,
}

/// Descriptor class used inside a media-group send call. Narrower than
/// [`KindFamily`]: in group context voice/video-note/animation/sticker are
/// sent as documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishClass {
    Photo,
    Video,
    Audio,
    Document,
}

/// Static behavior of one media kind.
#[derive(Debug)]
pub struct KindSpec {
    /// Label used when the original has no filename, e.g. `photo` in
    /// `1234_photo.jpg`.
    pub label: &'static str,
    pub default_extension: &'static str,
    /// Load-balancer estimate when the platform declares no size.
    pub default_estimate: u64,
    pub family: KindFamily,
    pub publish_class: PublishClass,
    /// Whether the kind's send method accepts a caption at all.
    pub supports_caption: bool,
}

impl MediaKind {
    pub const ALL: [MediaKind; 8] = [
        MediaKind::Photo,
        MediaKind::Video,
        MediaKind::Document,
        MediaKind::Audio,
        MediaKind::Voice,
        MediaKind::VideoNote,
        MediaKind::Animation,
        MediaKind::Sticker,
    ];

    pub fn spec(self) -> &'static KindSpec {
        match self {
            MediaKind::Photo => &KindSpec {
                label: "photo",
                default_extension: "jpg",
                default_estimate: 3 * MB,
                family: KindFamily::Visual,
                publish_class: PublishClass::Photo,
                supports_caption: true,
            },
            MediaKind::Video => &KindSpec {
                label: "video",
                default_extension: "mp4",
                default_estimate: 37 * MB,
                family: KindFamily::Visual,
                publish_class: PublishClass::Video,
                supports_caption: true,
            },
            MediaKind::Document => &KindSpec {
                label: "document",
                default_extension: "bin",
                default_estimate: 10 * MB,
                family: KindFamily::Document,
                publish_class: PublishClass::Document,
                supports_caption: true,
            },
            MediaKind::Audio => &KindSpec {
                label: "audio",
                default_extension: "mp3",
                default_estimate: 5 * MB,
                family: KindFamily::Audio,
                publish_class: PublishClass::Audio,
                supports_caption: true,
            },
            MediaKind::Voice => &KindSpec {
                label: "voice",
                default_extension: "ogg",
                default_estimate: MB,
                family: KindFamily::Audio,
                publish_class: PublishClass::Document,
                supports_caption: false,
            },
            MediaKind::VideoNote => &KindSpec {
                label: "video_note",
                default_extension: "mp4",
                default_estimate: 2 * MB,
                family: KindFamily::Document,
                publish_class: PublishClass::Document,
                supports_caption: false,
            },
            MediaKind::Animation => &KindSpec {
                label: "animation",
                default_extension: "gif",
                default_estimate: 3 * MB,
                family: KindFamily::Visual,
                publish_class: PublishClass::Document,
                supports_caption: true,
            },
            MediaKind::Sticker => &KindSpec {
                label: "sticker",
                default_extension: "webp",
                default_estimate: 5 * MB,
                family: KindFamily::Document,
                publish_class: PublishClass::Document,
                supports_caption: false,
            },
        }
    }

    /// Kinds the platform serves more efficiently through the streaming
    /// iterator regardless of size.
    pub fn prefers_stream(self) -> bool {
        matches!(
            self,
            MediaKind::Video | MediaKind::VideoNote | MediaKind::Animation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_spec() {
        for kind in MediaKind::ALL {
            let spec = kind.spec();
            assert!(!spec.label.is_empty());
            assert!(!spec.default_extension.is_empty());
            assert!(spec.default_estimate > 0);
        }
    }

    #[test]
    fn test_families() {
        assert_eq!(MediaKind::Photo.spec().family, KindFamily::Visual);
        assert_eq!(MediaKind::Animation.spec().family, KindFamily::Visual);
        assert_eq!(MediaKind::Voice.spec().family, KindFamily::Audio);
        assert_eq!(MediaKind::Sticker.spec().family, KindFamily::Document);
        assert_eq!(MediaKind::VideoNote.spec().family, KindFamily::Document);
    }

    #[test]
    fn test_group_context_downgrades_to_document() {
        assert_eq!(MediaKind::Animation.spec().publish_class, PublishClass::Document);
        assert_eq!(MediaKind::Voice.spec().publish_class, PublishClass::Document);
        assert_eq!(MediaKind::Video.spec().publish_class, PublishClass::Video);
    }

    #[test]
    fn test_captionless_kinds() {
        assert!(!MediaKind::Voice.spec().supports_caption);
        assert!(!MediaKind::VideoNote.spec().supports_caption);
        assert!(!MediaKind::Sticker.spec().supports_caption);
        assert!(MediaKind::Photo.spec().supports_caption);
    }

    #[test]
    fn test_video_kinds_always_stream() {
        assert!(MediaKind::Video.prefers_stream());
        assert!(MediaKind::VideoNote.prefers_stream());
        assert!(MediaKind::Animation.prefers_stream());
        assert!(!MediaKind::Photo.prefers_stream());
    }
}
