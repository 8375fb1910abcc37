//! Dual-strategy media downloader.
//!
//! Small non-video files go through explicit 1 MiB raw chunk reads; videos
//! and everything over the threshold consume the platform's streaming
//! iterator. Artifacts land on disk (downloads tree) or in memory (staging
//! pipeline).

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{
    DomainError, DownloadedItem, FileLocation, ItemPayload, MediaDescriptor, Message,
};
use crate::shared::files;
use crate::usecases::session_pool::PooledSession;

/// Raw-path read size; the platform caps chunk reads at 1 MiB.
const CHUNK_SIZE: usize = 1024 * 1024;

/// Progress is logged every this many bytes.
const PROGRESS_EVERY: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum DownloadMode {
    /// Write into `<base>/<folder>/<message-id>_<name>.<ext>`.
    Disk { base: PathBuf, folder: String },
    /// Keep bytes in memory for staging.
    Memory,
}

#[derive(Debug)]
pub enum DownloadOutcome {
    Downloaded(DownloadedItem),
    /// The target file already exists; no platform read was made.
    Skipped(PathBuf),
}

pub struct MediaDownloader {
    threshold_bytes: u64,
    cancel: CancellationToken,
}

impl MediaDownloader {
    pub fn new(threshold_bytes: u64, cancel: CancellationToken) -> Self {
        Self { threshold_bytes, cancel }
    }

    /// Download one message's media with the session. Holds the session's
    /// operation slot for the duration.
    pub async fn download(
        &self,
        session: &PooledSession,
        channel: &str,
        message: &Message,
        mode: &DownloadMode,
    ) -> Result<DownloadOutcome, DomainError> {
        let media = message
            .media
            .as_ref()
            .ok_or_else(|| DomainError::Validation(format!("message {} has no media", message.id)))?;

        if let DownloadMode::Disk { base, folder } = mode {
            let target = files::download_path(base, folder, message);
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                info!(msg_id = message.id, path = %target.display(), "file already present, skipping");
                return Ok(DownloadOutcome::Skipped(target));
            }
        }

        let mut guard = session.reserve().await;
        let result = self.download_inner(session, channel, message, media, mode).await;
        if result.is_err() {
            guard.mark_failed();
        }
        result
    }

    async fn download_inner(
        &self,
        session: &PooledSession,
        channel: &str,
        message: &Message,
        media: &MediaDescriptor,
        mode: &DownloadMode,
    ) -> Result<DownloadOutcome, DomainError> {
        let expected = media.file_size.unwrap_or(0);
        let use_raw = message.estimated_size() < self.threshold_bytes
            && !media.kind.prefers_stream()
            && media.location.is_some();

        let bytes_or_path = match (use_raw, mode) {
            (true, DownloadMode::Memory) => {
                let location = media.location.as_ref().expect("checked above");
                self.check_datacenter(session, location)?;
                debug!(msg_id = message.id, expected, "raw chunked download to memory");
                let bytes = self.raw_to_buffer(session, message, location, expected).await?;
                Fetched::Memory(bytes)
            }
            (true, DownloadMode::Disk { base, folder }) => {
                let location = media.location.as_ref().expect("checked above");
                let raw_result = match self.check_datacenter(session, location) {
                    Ok(()) => {
                        debug!(msg_id = message.id, expected, "raw chunked download to file");
                        self.raw_to_file(session, message, location, base, folder, expected).await
                    }
                    Err(e) => Err(e),
                };
                match raw_result {
                    Ok(path) => Fetched::Disk(path),
                    // The streaming path routes datacenter migration itself.
                    Err(DomainError::CrossDatacenter { .. }) => {
                        debug!(msg_id = message.id, "file on another datacenter, using stream path");
                        let path = self
                            .stream_to_file(session, channel, message, base, folder, expected)
                            .await?;
                        Fetched::Disk(path)
                    }
                    Err(e) => return Err(e),
                }
            }
            (false, DownloadMode::Memory) => {
                debug!(msg_id = message.id, expected, "streaming download to memory");
                let bytes = self.stream_to_buffer(session, channel, message, expected).await?;
                Fetched::Memory(bytes)
            }
            (false, DownloadMode::Disk { base, folder }) => {
                debug!(msg_id = message.id, expected, "streaming download to file");
                let path =
                    self.stream_to_file(session, channel, message, base, folder, expected).await?;
                Fetched::Disk(path)
            }
        };

        let payload = match bytes_or_path {
            Fetched::Memory(bytes) => {
                verify_size(message.id, bytes.len() as u64, expected);
                let md5_hex = format!("{:x}", md5::compute(&bytes));
                ItemPayload::InMemory { bytes, md5_hex }
            }
            Fetched::Disk(path) => {
                let size = tokio::fs::metadata(&path).await?.len();
                verify_size(message.id, size, expected);
                ItemPayload::OnDisk { path, size }
            }
        };

        let item = DownloadedItem {
            message_id: message.id,
            session: session.name.clone(),
            kind: media.kind,
            file_name: files::filename_for(message),
            text: message.text.clone(),
            caption: message.caption.clone(),
            group_id: message.group_id.clone(),
            meta: media.meta,
            payload,
        };
        info!(
            msg_id = message.id,
            session = %session.name,
            size = %files::format_size(item.size()),
            "download complete"
        );
        Ok(DownloadOutcome::Downloaded(item))
    }

    /// Raw reads cannot cross datacenters; this is a guard, not a rescue.
    fn check_datacenter(
        &self,
        session: &PooledSession,
        location: &FileLocation,
    ) -> Result<(), DomainError> {
        match session.gateway.home_dc() {
            Some(session_dc) if session_dc != location.dc_id => Err(DomainError::CrossDatacenter {
                file_dc: location.dc_id,
                session_dc,
            }),
            _ => Ok(()),
        }
    }

    async fn raw_to_buffer(
        &self,
        session: &PooledSession,
        message: &Message,
        location: &FileLocation,
        expected: u64,
    ) -> Result<Vec<u8>, DomainError> {
        let mut buffer = Vec::with_capacity(expected as usize);
        let mut offset = 0u64;
        let mut next_progress = PROGRESS_EVERY;
        loop {
            if self.cancel.is_cancelled() {
                return Err(DomainError::Cancelled);
            }
            let chunk = session.gateway.fetch_file_chunk(location, offset, CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
            if offset >= next_progress {
                info!(msg_id = message.id, downloaded = %files::format_size(offset), "download progress");
                next_progress += PROGRESS_EVERY;
            }
            if expected > 0 && offset >= expected {
                break;
            }
        }
        Ok(buffer)
    }

    async fn raw_to_file(
        &self,
        session: &PooledSession,
        message: &Message,
        location: &FileLocation,
        base: &Path,
        folder: &str,
        expected: u64,
    ) -> Result<PathBuf, DomainError> {
        let target = files::download_path(base, folder, message);
        let partial = partial_path(&target);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let write = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut offset = 0u64;
            let mut next_progress = PROGRESS_EVERY;
            loop {
                if self.cancel.is_cancelled() {
                    return Err(DomainError::Cancelled);
                }
                let chunk =
                    session.gateway.fetch_file_chunk(location, offset, CHUNK_SIZE).await?;
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as u64;
                file.write_all(&chunk).await?;
                if offset >= next_progress {
                    info!(msg_id = message.id, downloaded = %files::format_size(offset), "download progress");
                    next_progress += PROGRESS_EVERY;
                }
                if expected > 0 && offset >= expected {
                    break;
                }
            }
            file.flush().await?;
            Ok(())
        };
        self.finish_file(write.await, &partial, &target).await
    }

    async fn stream_to_buffer(
        &self,
        session: &PooledSession,
        channel: &str,
        message: &Message,
        expected: u64,
    ) -> Result<Vec<u8>, DomainError> {
        let mut stream = session.gateway.open_stream(channel, message.id).await?;
        let mut buffer = Vec::with_capacity(expected as usize);
        let mut next_progress = PROGRESS_EVERY;
        while let Some(chunk) = stream.next_chunk().await? {
            if self.cancel.is_cancelled() {
                return Err(DomainError::Cancelled);
            }
            buffer.extend_from_slice(&chunk);
            if buffer.len() as u64 >= next_progress {
                info!(msg_id = message.id, downloaded = %files::format_size(buffer.len() as u64), "download progress");
                next_progress += PROGRESS_EVERY;
            }
        }
        Ok(buffer)
    }

    async fn stream_to_file(
        &self,
        session: &PooledSession,
        channel: &str,
        message: &Message,
        base: &Path,
        folder: &str,
        _expected: u64,
    ) -> Result<PathBuf, DomainError> {
        let target = files::download_path(base, folder, message);
        let partial = partial_path(&target);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let write = async {
            let mut stream = session.gateway.open_stream(channel, message.id).await?;
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut written = 0u64;
            let mut next_progress = PROGRESS_EVERY;
            while let Some(chunk) = stream.next_chunk().await? {
                if self.cancel.is_cancelled() {
                    return Err(DomainError::Cancelled);
                }
                written += chunk.len() as u64;
                file.write_all(&chunk).await?;
                if written >= next_progress {
                    info!(msg_id = message.id, downloaded = %files::format_size(written), "download progress");
                    next_progress += PROGRESS_EVERY;
                }
            }
            file.flush().await?;
            Ok(())
        };
        self.finish_file(write.await, &partial, &target).await
    }

    /// Promote the partial file on success; remove it on failure so no
    /// partial or zero-byte artifact is left behind.
    async fn finish_file(
        &self,
        result: Result<(), DomainError>,
        partial: &Path,
        target: &Path,
    ) -> Result<PathBuf, DomainError> {
        match result {
            Ok(()) => {
                tokio::fs::rename(partial, target).await?;
                Ok(target.to_path_buf())
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(partial).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %cleanup, "failed to remove partial file");
                    }
                }
                Err(e)
            }
        }
    }
}

enum Fetched {
    Memory(Vec<u8>),
    Disk(PathBuf),
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Declared sizes are themselves sometimes approximate: outside-tolerance
/// artifacts are kept, with a warning.
fn verify_size(message_id: i32, actual: u64, expected: u64) {
    if expected == 0 {
        return;
    }
    let tolerance = (expected / 100).max(1024);
    if actual.abs_diff(expected) > tolerance {
        warn!(
            msg_id = message_id,
            expected,
            actual,
            "size mismatch beyond tolerance, keeping artifact"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::adapters::telegram::mock::MockChatGateway;
    use crate::domain::{MediaKind, MediaMeta};
    use crate::ports::ChatGateway;

    const LOCAL_DC: i32 = 2;
    const REMOTE_DC: i32 = 4;

    fn location(media_id: i64, dc_id: i32) -> FileLocation {
        FileLocation {
            media_id,
            access_hash: 7,
            file_reference: vec![9],
            dc_id,
            thumb_size: None,
            is_photo: false,
        }
    }

    fn media_message(
        id: i32,
        kind: MediaKind,
        size: u64,
        loc: Option<FileLocation>,
    ) -> Message {
        Message {
            id,
            chat_id: 1,
            group_id: None,
            text: None,
            caption: Some("cap".into()),
            media: Some(MediaDescriptor {
                kind,
                file_size: Some(size),
                mime_type: None,
                file_name: None,
                meta: MediaMeta::default(),
                location: loc,
            }),
        }
    }

    async fn pooled(gateway: Arc<MockChatGateway>) -> Arc<PooledSession> {
        struct OneShot(Arc<MockChatGateway>);
        #[async_trait::async_trait]
        impl crate::ports::GatewayFactory for OneShot {
            async fn open(&self, _name: &str) -> Result<Arc<dyn ChatGateway>, DomainError> {
                Ok(Arc::clone(&self.0) as Arc<dyn ChatGateway>)
            }
        }
        let name = gateway.name().to_string();
        let pool = crate::usecases::session_pool::SessionPool::initialize_with_stagger(
            &OneShot(gateway),
            &[name],
            Duration::ZERO,
        )
        .await
        .unwrap();
        pool.start_all().await.unwrap();
        pool.sessions().remove(0)
    }

    fn downloader() -> MediaDownloader {
        MediaDownloader::new(20 * 1024 * 1024, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_small_document_uses_raw_path_in_memory() {
        let payload = vec![5u8; 100];
        // Bytes registered only under the raw location id: the streaming
        // path would fail, so success proves the raw path was chosen.
        let gateway = MockChatGateway::new("s1").with_file_bytes(555, payload.clone());
        let session = pooled(gateway).await;
        let message = media_message(1, MediaKind::Document, 100, Some(location(555, LOCAL_DC)));

        let outcome = downloader()
            .download(&session, "@src", &message, &DownloadMode::Memory)
            .await
            .unwrap();
        let DownloadOutcome::Downloaded(item) = outcome else {
            panic!("expected a download")
        };
        match &item.payload {
            ItemPayload::InMemory { bytes, md5_hex } => {
                assert_eq!(bytes, &payload);
                assert_eq!(md5_hex, &format!("{:x}", md5::compute(&payload)));
            }
            other => panic!("expected in-memory payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_video_streams_even_when_small() {
        let payload = vec![7u8; 64];
        // Bytes registered only under the message id (stream key).
        let gateway = MockChatGateway::new("s1").with_file_bytes(2, payload.clone());
        let session = pooled(gateway).await;
        let message = media_message(2, MediaKind::Video, 64, Some(location(999, LOCAL_DC)));

        let outcome = downloader()
            .download(&session, "@src", &message, &DownloadMode::Memory)
            .await
            .unwrap();
        let DownloadOutcome::Downloaded(item) = outcome else {
            panic!("expected a download")
        };
        assert_eq!(item.size(), 64);
    }

    #[tokio::test]
    async fn test_cross_datacenter_raw_in_memory_fails() {
        let gateway = MockChatGateway::new("s1").with_file_bytes(555, vec![1; 10]);
        let session = pooled(gateway).await;
        let message = media_message(3, MediaKind::Document, 10, Some(location(555, REMOTE_DC)));

        let result = downloader()
            .download(&session, "@src", &message, &DownloadMode::Memory)
            .await;
        assert!(matches!(result, Err(DomainError::CrossDatacenter { .. })));
    }

    #[tokio::test]
    async fn test_unknown_session_datacenter_skips_the_guard() {
        // A transport that cannot report its datacenter leaves the guard
        // inert; the raw path proceeds and succeeds on the local dc.
        let payload = vec![8u8; 24];
        let gateway = MockChatGateway::new("s1")
            .with_file_bytes(555, payload.clone())
            .with_home_dc(None);
        let session = pooled(gateway).await;
        let message = media_message(9, MediaKind::Document, 24, Some(location(555, REMOTE_DC)));

        let outcome = downloader()
            .download(&session, "@src", &message, &DownloadMode::Memory)
            .await
            .unwrap();
        let DownloadOutcome::Downloaded(item) = outcome else {
            panic!("expected a download")
        };
        assert_eq!(item.size(), 24);
    }

    #[tokio::test]
    async fn test_cross_datacenter_on_disk_falls_back_to_stream() {
        let payload = vec![3u8; 32];
        let dir = tempfile::tempdir().unwrap();
        // Stream bytes present, raw bytes absent: fallback must stream.
        let gateway = MockChatGateway::new("s1").with_file_bytes(4, payload.clone());
        let session = pooled(gateway).await;
        let message = media_message(4, MediaKind::Document, 32, Some(location(555, REMOTE_DC)));
        let mode = DownloadMode::Disk { base: dir.path().to_path_buf(), folder: "chan".into() };

        let outcome = downloader().download(&session, "@src", &message, &mode).await.unwrap();
        let DownloadOutcome::Downloaded(item) = outcome else {
            panic!("expected a download")
        };
        let ItemPayload::OnDisk { path, size } = &item.payload else {
            panic!("expected on-disk payload")
        };
        assert_eq!(*size, 32);
        assert_eq!(std::fs::read(path).unwrap(), payload);
        assert!(path.ends_with("chan/4_document.bin"));
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped_without_platform_reads() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("chan");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("5_document.bin"), b"already here").unwrap();

        let gateway = MockChatGateway::new("s1");
        let session = pooled(Arc::clone(&gateway)).await;
        let message = media_message(5, MediaKind::Document, 12, Some(location(555, LOCAL_DC)));
        let mode = DownloadMode::Disk { base: dir.path().to_path_buf(), folder: "chan".into() };

        let outcome = downloader().download(&session, "@src", &message, &mode).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Skipped(_)));
        assert!(gateway.fetch_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        // No bytes registered at all: the stream open fails.
        let gateway = MockChatGateway::new("s1");
        let session = pooled(gateway).await;
        let message = media_message(6, MediaKind::Video, 100, None);
        let mode = DownloadMode::Disk { base: dir.path().to_path_buf(), folder: "chan".into() };

        let result = downloader().download(&session, "@src", &message, &mode).await;
        assert!(result.is_err());
        let leftovers: Vec<_> = walk(dir.path());
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_message_without_media_is_rejected() {
        let gateway = MockChatGateway::new("s1");
        let session = pooled(gateway).await;
        let message = Message {
            id: 8,
            chat_id: 1,
            group_id: None,
            text: Some("plain".into()),
            caption: None,
            media: None,
        };
        let result = downloader()
            .download(&session, "@src", &message, &DownloadMode::Memory)
            .await;
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            if let Ok(entries) = std::fs::read_dir(&current) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else {
                        files.push(path);
                    }
                }
            }
        }
        files
    }
}
