//! Filesystem naming: channel folders, per-message filenames, size display.

use std::path::{Path, PathBuf};

use crate::domain::{ChatInfo, Message};

const FOLDER_NAME_MAX: usize = 100;
const FILE_NAME_MAX: usize = 200;

/// Strip characters that are illegal or troublesome in folder names.
/// `@` is replaced too since handles lead most folder names.
pub fn sanitize_folder_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | '@' => '_',
            other => other,
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c == ' ');
    let mut out: String = trimmed.chars().take(FOLDER_NAME_MAX).collect();
    if out.is_empty() {
        out = "unknown_channel".to_string();
    }
    out
}

/// Folder name for a source channel: sanitized `@handle-title` (or
/// `id_<chat-id>-title` when it has no handle).
pub fn channel_folder_name(chat: &ChatInfo) -> String {
    let handle = match &chat.username {
        Some(username) => format!("@{username}"),
        None => format!("id_{}", chat.id),
    };
    sanitize_folder_name(&format!("{handle}-{}", chat.title))
}

/// Strip illegal filename characters and cap the length, preserving the
/// extension when truncating.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    if cleaned.len() <= FILE_NAME_MAX {
        return cleaned;
    }
    let path = Path::new(&cleaned);
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(&cleaned);
    if ext.is_empty() {
        stem.chars().take(FILE_NAME_MAX).collect()
    } else {
        let keep = FILE_NAME_MAX.saturating_sub(ext.len() + 1);
        let short: String = stem.chars().take(keep).collect();
        format!("{short}.{ext}")
    }
}

/// `<message-id>_<original-or-generated>.<ext>` for a message's media.
/// Messages without media get a text placeholder name.
pub fn filename_for(message: &Message) -> String {
    let Some(media) = &message.media else {
        return format!("{}_text.txt", message.id);
    };
    let spec = media.kind.spec();
    match media.file_name.as_deref().filter(|n| !n.is_empty()) {
        Some(original) => sanitize_filename(&format!("{}_{original}", message.id)),
        None => format!("{}_{}.{}", message.id, spec.label, spec.default_extension),
    }
}

/// Target path for a message inside a channel folder.
pub fn download_path(base: &Path, folder: &str, message: &Message) -> PathBuf {
    base.join(folder).join(filename_for(message))
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MediaDescriptor, MediaKind, MediaMeta};

    fn media_message(id: i32, kind: MediaKind, file_name: Option<&str>) -> Message {
        Message {
            id,
            chat_id: 1,
            group_id: None,
            text: None,
            caption: None,
            media: Some(MediaDescriptor {
                kind,
                file_size: None,
                mime_type: None,
                file_name: file_name.map(String::from),
                meta: MediaMeta::default(),
                location: None,
            }),
        }
    }

    #[test]
    fn test_sanitize_folder_replaces_illegal() {
        assert_eq!(sanitize_folder_name("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_folder_name("@handle"), "_handle");
    }

    #[test]
    fn test_sanitize_folder_empty_fallback() {
        assert_eq!(sanitize_folder_name(""), "unknown_channel");
        assert_eq!(sanitize_folder_name(" . "), "unknown_channel");
    }

    #[test]
    fn test_sanitize_folder_caps_length() {
        let long = "x".repeat(300);
        assert_eq!(sanitize_folder_name(&long).len(), 100);
    }

    #[test]
    fn test_channel_folder_with_handle() {
        let chat = ChatInfo {
            id: 99,
            title: "My: Channel".into(),
            username: Some("mych".into()),
        };
        assert_eq!(channel_folder_name(&chat), "_mych-My_ Channel");
    }

    #[test]
    fn test_channel_folder_without_handle() {
        let chat = ChatInfo { id: 42, title: "T".into(), username: None };
        assert_eq!(channel_folder_name(&chat), "id_42-T");
    }

    #[test]
    fn test_filename_uses_original_name() {
        let msg = media_message(7, MediaKind::Document, Some("report.pdf"));
        assert_eq!(filename_for(&msg), "7_report.pdf");
    }

    #[test]
    fn test_filename_generated_when_missing() {
        assert_eq!(filename_for(&media_message(7, MediaKind::Photo, None)), "7_photo.jpg");
        assert_eq!(filename_for(&media_message(8, MediaKind::Voice, None)), "8_voice.ogg");
        assert_eq!(
            filename_for(&media_message(9, MediaKind::VideoNote, None)),
            "9_video_note.mp4"
        );
    }

    #[test]
    fn test_sanitize_filename_keeps_extension_on_truncate() {
        let long = format!("{}.mp4", "v".repeat(400));
        let out = sanitize_filename(&long);
        assert!(out.len() <= 200);
        assert!(out.ends_with(".mp4"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
