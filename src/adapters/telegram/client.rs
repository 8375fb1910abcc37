//! Implements ChatGateway using the grammers Client.
//!
//! One instance per session. Handles FloodWait by surfacing the wait to the
//! caller as a domain error; uses raw invoke for the operations the
//! high-level client does not cover (chunked reads, kind-specific sends,
//! album sends, scratch deletes).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use grammers_client::tl;
use grammers_client::Client;
use grammers_client::InvocationError;
use grammers_session::types::PeerRef;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::telegram::mapper;
use crate::adapters::telegram::session::SessionStore;
use crate::domain::{
    AccountInfo, ChatInfo, DomainError, FileLocation, FileRef, MediaKind, Message,
};
use crate::ports::{
    ChatGateway, GatewayFactory, MediaStream, OutgoingMedia, PublishItem, StagedMessage,
    SELF_CHAT,
};

/// Upload part size; the platform requires a power of two up to 512 KiB.
const UPLOAD_PART: usize = 512 * 1024;

/// Files above this use the big-file upload calls (no md5 checksum).
const BIG_FILE: usize = 10 * 1024 * 1024;

/// Telegram gateway adapter for one session. Wraps a grammers Client whose
/// sender pool runs on a background task.
pub struct GrammersChatGateway {
    name: String,
    client: Client,
    /// Cache resolved peers (with their dialog ids) per channel handle so
    /// repeated operations do not hit ResolveUsername (avoids FLOOD_WAIT).
    peer_cache: Mutex<HashMap<String, (PeerRef, i64)>>,
    /// Monotonic source for client-generated ids (uploads, random_id).
    next_id: AtomicI64,
}

impl GrammersChatGateway {
    pub fn new(name: impl Into<String>, client: Client) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(1)
            .wrapping_abs()
            | 1;
        Self {
            name: name.into(),
            client,
            peer_cache: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(seed),
        }
    }

    fn fresh_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn map_error(&self, context: &str, error: InvocationError) -> DomainError {
        match &error {
            InvocationError::Rpc(rpc) if rpc.code == 420 => {
                DomainError::FloodWait { seconds: rpc.value.unwrap_or(60) as u64 }
            }
            InvocationError::Rpc(rpc) if rpc.name.starts_with("FILE_MIGRATE") => {
                DomainError::CrossDatacenter {
                    file_dc: rpc.value.unwrap_or(0) as i32,
                    session_dc: 0,
                }
            }
            InvocationError::Rpc(rpc) if rpc.code == 401 => {
                DomainError::Auth(format!("{context}: {}", rpc.name))
            }
            InvocationError::Rpc(rpc)
                if rpc.code == 403
                    || rpc.name == "CHANNEL_PRIVATE"
                    || rpc.name == "CHAT_ADMIN_REQUIRED"
                    || rpc.name == "CHAT_WRITE_FORBIDDEN"
                    || rpc.name == "USER_BANNED_IN_CHANNEL" =>
            {
                DomainError::Permission(format!("{context}: {}", rpc.name))
            }
            _ => DomainError::Gateway(format!("{context}: {error}")),
        }
    }

    /// Resolve a channel handle (or the self chat) to a cached peer.
    async fn resolve_peer(&self, channel: &str) -> Result<tl::enums::InputPeer, DomainError> {
        if channel == SELF_CHAT {
            return Ok(tl::enums::InputPeer::PeerSelf);
        }
        let (peer_ref, _) = self.resolve_peer_ref(channel).await?;
        Ok(peer_ref.into())
    }

    /// Resolve to the peer reference plus its dialog id, filling the cache
    /// on first use.
    async fn resolve_peer_ref(&self, channel: &str) -> Result<(PeerRef, i64), DomainError> {
        {
            let cache = self.peer_cache.lock().await;
            if let Some(entry) = cache.get(channel) {
                return Ok(entry.clone());
            }
        }
        let handle = channel.trim_start_matches('@');
        let peer = self
            .client
            .resolve_username(handle)
            .await
            .map_err(|e| self.map_error("resolve channel", e))?
            .ok_or_else(|| DomainError::Gateway(format!("channel {channel} not found")))?;
        let chat_id = peer.id().bot_api_dialog_id_unchecked();
        let peer_ref = peer
            .to_ref()
            .await
            .map_err(|e| DomainError::Gateway(format!("resolve peer ref: {e}")))?
            .ok_or_else(|| DomainError::Gateway(format!("peer {channel} not in session cache")))?;
        let entry = (peer_ref, chat_id);
        self.peer_cache.lock().await.insert(channel.to_string(), entry.clone());
        Ok(entry)
    }

    /// Upload bytes part by part and build the input-file reference.
    async fn upload_bytes(
        &self,
        bytes: &[u8],
        file_name: &str,
    ) -> Result<tl::enums::InputFile, DomainError> {
        let file_id = self.fresh_id();
        let parts = bytes.len().div_ceil(UPLOAD_PART).max(1) as i32;
        let big = bytes.len() > BIG_FILE;

        for (index, part) in bytes.chunks(UPLOAD_PART).enumerate() {
            if big {
                self.client
                    .invoke(&tl::functions::upload::SaveBigFilePart {
                        file_id,
                        file_part: index as i32,
                        file_total_parts: parts,
                        bytes: part.to_vec(),
                    })
                    .await
                    .map_err(|e| self.map_error("upload part", e))?;
            } else {
                self.client
                    .invoke(&tl::functions::upload::SaveFilePart {
                        file_id,
                        file_part: index as i32,
                        bytes: part.to_vec(),
                    })
                    .await
                    .map_err(|e| self.map_error("upload part", e))?;
            }
        }

        Ok(if big {
            tl::enums::InputFile::Big(tl::types::InputFileBig {
                id: file_id,
                parts,
                name: file_name.to_string(),
            })
        } else {
            tl::enums::InputFile::File(tl::types::InputFile {
                id: file_id,
                parts,
                name: file_name.to_string(),
                md5_checksum: format!("{:x}", md5::compute(bytes)),
            })
        })
    }

    /// Kind-specific uploaded-media descriptor for the scratch send.
    fn uploaded_media(
        &self,
        media: &OutgoingMedia,
        file: tl::enums::InputFile,
    ) -> tl::enums::InputMedia {
        if media.kind == MediaKind::Photo {
            return tl::enums::InputMedia::UploadedPhoto(tl::types::InputMediaUploadedPhoto {
                spoiler: false,
                live_photo: false,
                file,
                stickers: None,
                ttl_seconds: None,
                video: None,
            });
        }

        let mut attributes = vec![tl::enums::DocumentAttribute::Filename(
            tl::types::DocumentAttributeFilename { file_name: media.file_name.clone() },
        )];
        match media.kind {
            MediaKind::Video | MediaKind::VideoNote => {
                attributes.push(tl::enums::DocumentAttribute::Video(
                    tl::types::DocumentAttributeVideo {
                        round_message: media.kind == MediaKind::VideoNote,
                        supports_streaming: true,
                        nosound: false,
                        duration: media.meta.duration_secs.unwrap_or(0.0),
                        w: media.meta.width.unwrap_or(0),
                        h: media.meta.height.unwrap_or(0),
                        preload_prefix_size: None,
                        video_start_ts: None,
                        video_codec: None,
                    },
                ));
            }
            MediaKind::Audio | MediaKind::Voice => {
                attributes.push(tl::enums::DocumentAttribute::Audio(
                    tl::types::DocumentAttributeAudio {
                        voice: media.kind == MediaKind::Voice,
                        duration: media.meta.duration_secs.unwrap_or(0.0) as i32,
                        title: None,
                        performer: None,
                        waveform: None,
                    },
                ));
            }
            MediaKind::Animation => {
                attributes.push(tl::enums::DocumentAttribute::Animated);
            }
            _ => {}
        }

        tl::enums::InputMedia::UploadedDocument(tl::types::InputMediaUploadedDocument {
            nosound_video: media.kind == MediaKind::Animation,
            force_file: media.kind == MediaKind::Document,
            spoiler: false,
            file,
            thumb: None,
            mime_type: mime_for(media.kind),
            attributes,
            stickers: None,
            video_cover: None,
            video_timestamp: None,
            ttl_seconds: None,
        })
    }

    /// Pull the sent message out of the updates the server returns.
    fn sent_message_from_updates(updates: tl::enums::Updates) -> Option<tl::types::Message> {
        let inner = match updates {
            tl::enums::Updates::Updates(u) => u.updates,
            tl::enums::Updates::Combined(u) => u.updates,
            _ => return None,
        };
        for update in inner {
            let message = match update {
                tl::enums::Update::NewMessage(m) => m.message,
                tl::enums::Update::NewChannelMessage(m) => m.message,
                _ => continue,
            };
            if let tl::enums::Message::Message(raw) = message {
                return Some(raw);
            }
        }
        None
    }

    fn sent_message_ids(updates: tl::enums::Updates) -> Vec<i32> {
        let inner = match updates {
            tl::enums::Updates::Updates(u) => u.updates,
            tl::enums::Updates::Combined(u) => u.updates,
            _ => return Vec::new(),
        };
        inner
            .into_iter()
            .filter_map(|update| match update {
                tl::enums::Update::NewMessage(m) => Some(m.message),
                tl::enums::Update::NewChannelMessage(m) => Some(m.message),
                _ => None,
            })
            .filter_map(|message| match message {
                tl::enums::Message::Message(raw) => Some(raw.id),
                _ => None,
            })
            .collect()
    }

    /// File handle for a freshly-sent scratch message.
    fn file_ref_from_sent(raw: &tl::types::Message) -> Result<FileRef, DomainError> {
        let media = raw
            .media
            .as_ref()
            .ok_or_else(|| DomainError::Publish("scratch message has no media".into()))?;
        match media {
            tl::enums::MessageMedia::Photo(mp) => match mp.photo.as_ref() {
                Some(tl::enums::Photo::Photo(photo)) => Ok(FileRef {
                    media_id: photo.id,
                    access_hash: photo.access_hash,
                    file_reference: photo.file_reference.clone(),
                    is_photo: true,
                }),
                _ => Err(DomainError::Publish("scratch photo is empty".into())),
            },
            tl::enums::MessageMedia::Document(md) => match md.document.as_ref() {
                Some(tl::enums::Document::Document(document)) => Ok(FileRef {
                    media_id: document.id,
                    access_hash: document.access_hash,
                    file_reference: document.file_reference.clone(),
                    is_photo: false,
                }),
                _ => Err(DomainError::Publish("scratch document is empty".into())),
            },
            _ => Err(DomainError::Publish("unexpected scratch media".into())),
        }
    }

    fn publish_media(item: &PublishItem) -> tl::enums::InputMedia {
        if item.file_ref.is_photo {
            tl::enums::InputMedia::Photo(tl::types::InputMediaPhoto {
                spoiler: false,
                live_photo: false,
                id: tl::enums::InputPhoto::Photo(tl::types::InputPhoto {
                    id: item.file_ref.media_id,
                    access_hash: item.file_ref.access_hash,
                    file_reference: item.file_ref.file_reference.clone(),
                }),
                ttl_seconds: None,
                video: None,
            })
        } else {
            tl::enums::InputMedia::Document(tl::types::InputMediaDocument {
                spoiler: false,
                id: tl::enums::InputDocument::Document(tl::types::InputDocument {
                    id: item.file_ref.media_id,
                    access_hash: item.file_ref.access_hash,
                    file_reference: item.file_ref.file_reference.clone(),
                }),
                video_cover: None,
                video_timestamp: None,
                ttl_seconds: None,
                query: None,
            })
        }
    }
}

struct GrammersMediaStream {
    iter: grammers_client::DownloadIter,
    session: String,
}

#[async_trait::async_trait]
impl MediaStream for GrammersMediaStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DomainError> {
        self.iter.next().await.map_err(|e| match e {
            InvocationError::Rpc(rpc) if rpc.code == 420 => {
                DomainError::FloodWait { seconds: rpc.value.unwrap_or(60) as u64 }
            }
            other => DomainError::Download(format!("stream ({}): {other}", self.session)),
        })
    }
}

#[async_trait::async_trait]
impl ChatGateway for GrammersChatGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<AccountInfo, DomainError> {
        let authorized = self
            .client
            .is_authorized()
            .await
            .map_err(|e| self.map_error("authorization check", e))?;
        if !authorized {
            return Err(DomainError::Auth(format!(
                "session '{}' is not authorized; create it with the session wizard first",
                self.name
            )));
        }

        let me = self
            .client
            .get_me()
            .await
            .map_err(|e| self.map_error("get_me", e))?;
        let raw = &me.raw;
        let display_name = match (&raw.first_name, &raw.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first.clone(),
            _ => raw.username.clone().unwrap_or_else(|| raw.id.to_string()),
        };
        let account = AccountInfo {
            user_id: raw.id,
            display_name,
            is_premium: raw.premium,
            dc_id: None,
        };
        info!(session = %self.name, user = %account.display_name, "gateway connected");
        Ok(account)
    }

    async fn disconnect(&self) -> Result<(), DomainError> {
        // Session state persists as it changes (sqlite-backed); the sender
        // pool task ends when its handle side is dropped.
        debug!(session = %self.name, "gateway disconnected");
        Ok(())
    }

    async fn get_chat(&self, channel: &str) -> Result<ChatInfo, DomainError> {
        let handle = channel.trim_start_matches('@');
        let peer = self
            .client
            .resolve_username(handle)
            .await
            .map_err(|e| self.map_error("get_chat", e))?
            .ok_or_else(|| DomainError::Gateway(format!("channel {channel} not found")))?;
        Ok(ChatInfo {
            id: peer.id().bot_api_dialog_id_unchecked(),
            title: peer.name().map(String::from).unwrap_or_else(|| handle.to_string()),
            username: peer.username().map(String::from),
        })
    }

    async fn get_messages(
        &self,
        channel: &str,
        ids: &[i32],
    ) -> Result<Vec<Message>, DomainError> {
        let (peer_ref, chat_id) = self.resolve_peer_ref(channel).await?;
        let fetched = self
            .client
            .get_messages_by_id(peer_ref, ids)
            .await
            .map_err(|e| self.map_error("get_messages", e))?;
        Ok(fetched
            .into_iter()
            .flatten()
            .filter_map(|message| {
                mapper::message_to_domain(&tl::enums::Message::Message(message.raw.clone()), chat_id)
            })
            .collect())
    }

    async fn open_stream(
        &self,
        channel: &str,
        message_id: i32,
    ) -> Result<Box<dyn MediaStream>, DomainError> {
        let (peer_ref, _) = self.resolve_peer_ref(channel).await?;
        let fetched = self
            .client
            .get_messages_by_id(peer_ref, &[message_id])
            .await
            .map_err(|e| self.map_error("open_stream", e))?;
        let message = fetched
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| DomainError::Download(format!("message {message_id} not found")))?;
        let media = message
            .media()
            .ok_or_else(|| DomainError::Download(format!("message {message_id} has no media")))?;
        Ok(Box::new(GrammersMediaStream {
            iter: self.client.iter_download(&media),
            session: self.name.clone(),
        }))
    }

    async fn fetch_file_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<u8>, DomainError> {
        let input_location = if location.is_photo {
            tl::enums::InputFileLocation::InputPhotoFileLocation(
                tl::types::InputPhotoFileLocation {
                    id: location.media_id,
                    access_hash: location.access_hash,
                    file_reference: location.file_reference.clone(),
                    thumb_size: location.thumb_size.clone().unwrap_or_default(),
                },
            )
        } else {
            tl::enums::InputFileLocation::InputDocumentFileLocation(
                tl::types::InputDocumentFileLocation {
                    id: location.media_id,
                    access_hash: location.access_hash,
                    file_reference: location.file_reference.clone(),
                    thumb_size: String::new(),
                },
            )
        };

        let file = self
            .client
            .invoke(&tl::functions::upload::GetFile {
                precise: true,
                cdn_supported: false,
                location: input_location,
                offset: offset as i64,
                limit: limit as i32,
            })
            .await
            .map_err(|e| self.map_error("raw read", e))?;

        match file {
            tl::enums::upload::File::File(f) => Ok(f.bytes),
            tl::enums::upload::File::CdnRedirect(_) => {
                Err(DomainError::Download("cdn redirect on raw read".into()))
            }
        }
    }

    fn home_dc(&self) -> Option<i32> {
        // The transport does not expose the bound datacenter; cross-dc raw
        // reads surface as FILE_MIGRATE errors and the downloader reroutes.
        None
    }

    async fn send_media(
        &self,
        chat: &str,
        media: OutgoingMedia,
    ) -> Result<StagedMessage, DomainError> {
        let peer = self.resolve_peer(chat).await?;
        let file = self.upload_bytes(&media.bytes, &media.file_name).await?;
        let input_media = self.uploaded_media(&media, file);
        let caption = media.caption.clone().unwrap_or_default();

        let updates = self
            .client
            .invoke(&tl::functions::messages::SendMedia {
                silent: true,
                background: false,
                clear_draft: false,
                noforwards: false,
                update_stickersets_order: false,
                invert_media: false,
                allow_paid_floodskip: false,
                peer,
                reply_to: None,
                media: input_media,
                message: caption,
                random_id: self.fresh_id(),
                reply_markup: None,
                entities: None,
                schedule_date: None,
                schedule_repeat_period: None,
                send_as: None,
                quick_reply_shortcut: None,
                effect: None,
                allow_paid_stars: None,
                suggested_post: None,
            })
            .await
            .map_err(|e| self.map_error("scratch send", e))?;

        let raw = Self::sent_message_from_updates(updates)
            .ok_or_else(|| DomainError::Publish("sent message missing from updates".into()))?;
        let file_ref = Self::file_ref_from_sent(&raw)?;
        Ok(StagedMessage { message_id: raw.id, file_ref })
    }

    async fn send_media_group(
        &self,
        chat: &str,
        items: &[PublishItem],
    ) -> Result<Vec<i32>, DomainError> {
        let peer = self.resolve_peer(chat).await?;
        let multi_media = items
            .iter()
            .map(|item| {
                tl::enums::InputSingleMedia::Media(tl::types::InputSingleMedia {
                    media: Self::publish_media(item),
                    random_id: self.fresh_id(),
                    message: item.caption.clone().unwrap_or_default(),
                    entities: None,
                })
            })
            .collect();

        let updates = self
            .client
            .invoke(&tl::functions::messages::SendMultiMedia {
                silent: false,
                background: false,
                clear_draft: false,
                noforwards: false,
                update_stickersets_order: false,
                invert_media: false,
                allow_paid_floodskip: false,
                peer,
                reply_to: None,
                multi_media,
                schedule_date: None,
                send_as: None,
                quick_reply_shortcut: None,
                effect: None,
                allow_paid_stars: None,
            })
            .await
            .map_err(|e| self.map_error("album send", e))?;

        Ok(Self::sent_message_ids(updates))
    }

    async fn delete_messages(&self, chat: &str, ids: &[i32]) -> Result<(), DomainError> {
        if chat != SELF_CHAT {
            return Err(DomainError::Validation(
                "scratch cleanup only targets the self chat".into(),
            ));
        }
        self.client
            .invoke(&tl::functions::messages::DeleteMessages {
                revoke: true,
                id: ids.to_vec(),
            })
            .await
            .map_err(|e| self.map_error("delete", e))?;
        Ok(())
    }
}

fn mime_for(kind: MediaKind) -> String {
    match kind {
        MediaKind::Photo => "image/jpeg",
        MediaKind::Video | MediaKind::VideoNote | MediaKind::Animation => "video/mp4",
        MediaKind::Audio => "audio/mpeg",
        MediaKind::Voice => "audio/ogg",
        MediaKind::Sticker => "image/webp",
        MediaKind::Document => "application/octet-stream",
    }
    .to_string()
}

/// Creates grammers-backed gateways from the session directory.
pub struct GrammersGatewayFactory {
    api_id: i32,
    store: SessionStore,
    proxy_url: Option<String>,
}

impl GrammersGatewayFactory {
    pub fn new(api_id: i32, store: SessionStore, proxy_url: Option<String>) -> Self {
        Self { api_id, store, proxy_url }
    }
}

#[async_trait::async_trait]
impl GatewayFactory for GrammersGatewayFactory {
    async fn open(
        &self,
        session_name: &str,
    ) -> Result<Arc<dyn ChatGateway>, DomainError> {
        let session = Arc::new(self.store.open(session_name).await?);
        let pool = match &self.proxy_url {
            Some(url) => {
                grammers_client::SenderPool::new_with_proxy(session, self.api_id, url.clone())
            }
            None => grammers_client::SenderPool::new(session, self.api_id),
        };
        let handle = pool.handle.clone();
        tokio::spawn(async move {
            pool.runner.run().await;
        });
        let client = Client::new(handle);
        if self.proxy_url.is_some() {
            warn!(session = %session_name, "outbound connection routed through proxy");
        }
        Ok(Arc::new(GrammersChatGateway::new(session_name, client)))
    }
}
