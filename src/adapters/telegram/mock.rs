//! Scripted in-memory gateway for pipeline tests.
//!
//! Behaves like a connected session over a fixed message store; failures and
//! flood waits are queued up-front by the test.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::domain::{
    AccountInfo, ChatInfo, DomainError, FileLocation, FileRef, MediaKind, Message,
};
use crate::ports::{ChatGateway, MediaStream, OutgoingMedia, PublishItem, StagedMessage};

const STREAM_CHUNK: usize = 4;

#[derive(Default)]
struct MockState {
    connect_floodwaits: VecDeque<u64>,
    connect_failures: u32,
    is_premium: bool,
    home_dc: Option<i32>,

    messages: HashMap<i32, Message>,
    file_bytes: HashMap<i64, Vec<u8>>,

    fetch_floodwaits: VecDeque<u64>,
    fetch_failures: u32,
    fetch_calls: Vec<Vec<i32>>,

    stage_failures: HashSet<i32>,
    next_scratch_id: i32,
    staged: Vec<(String, String)>,

    publish_permission_denied: HashSet<String>,
    publish_transient_failures: HashMap<String, u32>,
    publish_floodwaits: VecDeque<u64>,
    published: Vec<(String, usize)>,

    deleted: Vec<(String, Vec<i32>)>,
}

pub struct MockChatGateway {
    name: String,
    state: Mutex<MockState>,
}

impl MockChatGateway {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(MockState {
                next_scratch_id: 10_000,
                home_dc: Some(2),
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    pub fn with_messages(self: Arc<Self>, messages: Vec<Message>) -> Arc<Self> {
        let mut state = self.lock();
        for message in messages {
            state.messages.insert(message.id, message);
        }
        drop(state);
        self
    }

    /// Register bytes served both by the stream and by raw chunk reads; the
    /// key doubles as message id and raw-location media id.
    pub fn with_file_bytes(self: Arc<Self>, id: i64, bytes: Vec<u8>) -> Arc<Self> {
        self.lock().file_bytes.insert(id, bytes);
        self
    }

    pub fn premium(self: Arc<Self>, value: bool) -> Arc<Self> {
        self.lock().is_premium = value;
        self
    }

    pub fn with_home_dc(self: Arc<Self>, dc: Option<i32>) -> Arc<Self> {
        self.lock().home_dc = dc;
        self
    }

    pub fn queue_connect_floodwait(self: Arc<Self>, seconds: u64) -> Arc<Self> {
        self.lock().connect_floodwaits.push_back(seconds);
        self
    }

    pub fn fail_connects(self: Arc<Self>, count: u32) -> Arc<Self> {
        self.lock().connect_failures = count;
        self
    }

    pub fn queue_fetch_floodwait(self: Arc<Self>, seconds: u64) -> Arc<Self> {
        self.lock().fetch_floodwaits.push_back(seconds);
        self
    }

    pub fn fail_fetches(self: Arc<Self>, count: u32) -> Arc<Self> {
        self.lock().fetch_failures = count;
        self
    }

    pub fn fail_stage_for(self: Arc<Self>, message_id: i32) -> Arc<Self> {
        self.lock().stage_failures.insert(message_id);
        self
    }

    pub fn deny_publish_to(self: Arc<Self>, chat: &str) -> Arc<Self> {
        self.lock().publish_permission_denied.insert(chat.to_string());
        self
    }

    pub fn fail_publishes_to(self: Arc<Self>, chat: &str, count: u32) -> Arc<Self> {
        self.lock().publish_transient_failures.insert(chat.to_string(), count);
        self
    }

    pub fn queue_publish_floodwait(self: Arc<Self>, seconds: u64) -> Arc<Self> {
        self.lock().publish_floodwaits.push_back(seconds);
        self
    }

    pub fn fetch_calls(&self) -> Vec<Vec<i32>> {
        self.lock().fetch_calls.clone()
    }

    pub fn staged_uploads(&self) -> Vec<(String, String)> {
        self.lock().staged.clone()
    }

    pub fn published_groups(&self) -> Vec<(String, usize)> {
        self.lock().published.clone()
    }

    pub fn deleted_messages(&self) -> Vec<(String, Vec<i32>)> {
        self.lock().deleted.clone()
    }
}

struct MockMediaStream {
    chunks: VecDeque<Vec<u8>>,
}

#[async_trait::async_trait]
impl MediaStream for MockMediaStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DomainError> {
        Ok(self.chunks.pop_front())
    }
}

#[async_trait::async_trait]
impl ChatGateway for MockChatGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<AccountInfo, DomainError> {
        let mut state = self.lock();
        if let Some(seconds) = state.connect_floodwaits.pop_front() {
            return Err(DomainError::FloodWait { seconds });
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(DomainError::Auth("mock connect failure".into()));
        }
        Ok(AccountInfo {
            user_id: 1,
            display_name: self.name.clone(),
            is_premium: state.is_premium,
            dc_id: state.home_dc,
        })
    }

    async fn disconnect(&self) -> Result<(), DomainError> {
        Ok(())
    }

    async fn get_chat(&self, channel: &str) -> Result<ChatInfo, DomainError> {
        Ok(ChatInfo {
            id: 777,
            title: "Mock Channel".into(),
            username: Some(channel.trim_start_matches('@').to_string()),
        })
    }

    async fn get_messages(
        &self,
        _channel: &str,
        ids: &[i32],
    ) -> Result<Vec<Message>, DomainError> {
        let mut state = self.lock();
        state.fetch_calls.push(ids.to_vec());
        if let Some(seconds) = state.fetch_floodwaits.pop_front() {
            return Err(DomainError::FloodWait { seconds });
        }
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(DomainError::Gateway("mock fetch failure".into()));
        }
        Ok(ids.iter().filter_map(|id| state.messages.get(id).cloned()).collect())
    }

    async fn open_stream(
        &self,
        _channel: &str,
        message_id: i32,
    ) -> Result<Box<dyn MediaStream>, DomainError> {
        let state = self.lock();
        let bytes = state
            .file_bytes
            .get(&(message_id as i64))
            .ok_or_else(|| DomainError::Download(format!("no bytes for message {message_id}")))?;
        let chunks = bytes.chunks(STREAM_CHUNK).map(|c| c.to_vec()).collect();
        Ok(Box::new(MockMediaStream { chunks }))
    }

    async fn fetch_file_chunk(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<u8>, DomainError> {
        let state = self.lock();
        let bytes = state
            .file_bytes
            .get(&location.media_id)
            .ok_or_else(|| DomainError::Download(format!("no bytes for media {}", location.media_id)))?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + limit).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn home_dc(&self) -> Option<i32> {
        self.lock().home_dc
    }

    async fn send_media(
        &self,
        chat: &str,
        media: OutgoingMedia,
    ) -> Result<StagedMessage, DomainError> {
        let mut state = self.lock();
        let origin: i32 = media
            .file_name
            .split('_')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if state.stage_failures.contains(&origin) {
            return Err(DomainError::Publish(format!("mock stage failure for {origin}")));
        }
        state.next_scratch_id += 1;
        let scratch_id = state.next_scratch_id;
        state.staged.push((chat.to_string(), media.file_name.clone()));
        Ok(StagedMessage {
            message_id: scratch_id,
            file_ref: FileRef {
                media_id: scratch_id as i64,
                access_hash: 42,
                file_reference: vec![1, 2, 3],
                is_photo: media.kind == MediaKind::Photo,
            },
        })
    }

    async fn send_media_group(
        &self,
        chat: &str,
        items: &[PublishItem],
    ) -> Result<Vec<i32>, DomainError> {
        let mut state = self.lock();
        if let Some(seconds) = state.publish_floodwaits.pop_front() {
            return Err(DomainError::FloodWait { seconds });
        }
        if state.publish_permission_denied.contains(chat) {
            return Err(DomainError::Permission(format!("mock denies {chat}")));
        }
        if let Some(remaining) = state.publish_transient_failures.get_mut(chat) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DomainError::Publish(format!("mock transient failure for {chat}")));
            }
        }
        state.published.push((chat.to_string(), items.len()));
        let base = 50_000 + state.published.len() as i32 * 100;
        Ok((0..items.len() as i32).map(|i| base + i).collect())
    }

    async fn delete_messages(&self, chat: &str, ids: &[i32]) -> Result<(), DomainError> {
        self.lock().deleted.push((chat.to_string(), ids.to_vec()));
        Ok(())
    }
}
