//! Map grammers tl types to domain entities.
//!
//! Extracts message snapshots, media descriptors and raw file locations from
//! the wire types. Platform-empty and service messages map to `None`.

use grammers_client::tl;

use crate::domain::{FileLocation, MediaDescriptor, MediaKind, MediaMeta, Message};

/// Map a raw message to a domain snapshot. The message body lands in `text`
/// for plain messages and in `caption` when media is attached.
pub fn raw_message_to_domain(raw: &tl::types::Message, chat_id: i64) -> Message {
    let media = raw.media.as_ref().and_then(media_to_descriptor);
    let body = if raw.message.is_empty() { None } else { Some(raw.message.clone()) };
    let (text, caption) = if media.is_some() { (None, body) } else { (body, None) };
    Message {
        id: raw.id,
        chat_id,
        group_id: raw.grouped_id.map(|id| id.to_string()),
        text,
        caption,
        media,
    }
}

/// Map the enum wrapper, dropping empty placeholders and service messages.
pub fn message_to_domain(msg: &tl::enums::Message, chat_id: i64) -> Option<Message> {
    match msg {
        tl::enums::Message::Message(raw) => Some(raw_message_to_domain(raw, chat_id)),
        tl::enums::Message::Empty(_) | tl::enums::Message::Service(_) => None,
    }
}

fn media_to_descriptor(media: &tl::enums::MessageMedia) -> Option<MediaDescriptor> {
    match media {
        tl::enums::MessageMedia::Photo(media_photo) => {
            let tl::enums::Photo::Photo(photo) = media_photo.photo.as_ref()? else {
                return None;
            };
            let (size, thumb) = largest_photo_size(&photo.sizes);
            Some(MediaDescriptor {
                kind: MediaKind::Photo,
                file_size: size,
                mime_type: Some("image/jpeg".into()),
                file_name: None,
                meta: MediaMeta::default(),
                location: Some(FileLocation {
                    media_id: photo.id,
                    access_hash: photo.access_hash,
                    file_reference: photo.file_reference.clone(),
                    dc_id: photo.dc_id,
                    thumb_size: thumb,
                    is_photo: true,
                }),
            })
        }
        tl::enums::MessageMedia::Document(media_document) => {
            let tl::enums::Document::Document(document) = media_document.document.as_ref()?
            else {
                return None;
            };
            let (kind, file_name, meta) = classify_document(document);
            Some(MediaDescriptor {
                kind,
                file_size: u64::try_from(document.size).ok().filter(|size| *size > 0),
                mime_type: Some(document.mime_type.clone()),
                file_name,
                meta,
                location: Some(FileLocation {
                    media_id: document.id,
                    access_hash: document.access_hash,
                    file_reference: document.file_reference.clone(),
                    dc_id: document.dc_id,
                    thumb_size: None,
                    is_photo: false,
                }),
            })
        }
        _ => None,
    }
}

/// Kind from document attributes, falling back to the mime type the way the
/// platform's own clients do.
fn classify_document(
    document: &tl::types::Document,
) -> (MediaKind, Option<String>, MediaMeta) {
    let mut kind = None;
    let mut file_name = None;
    let mut meta = MediaMeta::default();
    let mut animated = false;

    for attribute in &document.attributes {
        match attribute {
            tl::enums::DocumentAttribute::Video(video) => {
                meta.width = Some(video.w);
                meta.height = Some(video.h);
                meta.duration_secs = Some(video.duration);
                kind = Some(if video.round_message {
                    MediaKind::VideoNote
                } else {
                    MediaKind::Video
                });
            }
            tl::enums::DocumentAttribute::Audio(audio) => {
                meta.duration_secs = Some(audio.duration as f64);
                kind = Some(if audio.voice { MediaKind::Voice } else { MediaKind::Audio });
            }
            tl::enums::DocumentAttribute::Sticker(_) => kind = Some(MediaKind::Sticker),
            tl::enums::DocumentAttribute::Animated => animated = true,
            tl::enums::DocumentAttribute::Filename(name) => {
                file_name = Some(name.file_name.clone());
            }
            tl::enums::DocumentAttribute::ImageSize(size) => {
                meta.width = Some(size.w);
                meta.height = Some(size.h);
            }
            _ => {}
        }
    }

    // An animated attribute wins over the plain video classification.
    if animated {
        kind = Some(MediaKind::Animation);
    }

    let kind = kind.unwrap_or_else(|| {
        let mime = document.mime_type.as_str();
        if mime.starts_with("video/") {
            MediaKind::Video
        } else if mime.starts_with("audio/") {
            MediaKind::Audio
        } else if mime == "application/x-tgsticker" {
            MediaKind::Sticker
        } else {
            MediaKind::Document
        }
    });

    (kind, file_name, meta)
}

/// Largest size variant in bytes, with its type string as the thumb hint.
fn largest_photo_size(sizes: &[tl::enums::PhotoSize]) -> (Option<u64>, Option<String>) {
    let mut best: Option<(u64, String)> = None;
    for size in sizes {
        let candidate = match size {
            tl::enums::PhotoSize::Size(s) => Some((s.size as u64, s.r#type.clone())),
            tl::enums::PhotoSize::Progressive(p) => p
                .sizes
                .iter()
                .max()
                .map(|bytes| (*bytes as u64, p.r#type.clone())),
            _ => None,
        };
        if let Some((bytes, kind)) = candidate {
            if best.as_ref().is_none_or(|(current, _)| bytes > *current) {
                best = Some((bytes, kind));
            }
        }
    }
    match best {
        Some((bytes, kind)) => (Some(bytes), Some(kind)),
        None => (None, None),
    }
}
