//! In-process fakes for the chat transport and attachment fetcher, plus a
//! fully wired engine harness backed by the in-memory store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::shared::models::OrganizationConfig;
use crate::storage::MemoryStore;
use crate::tickets::archive::Archiver;
use crate::tickets::cooldown::CooldownGuard;
use crate::tickets::store::{ArchiveStore, ConfigStore, TicketStore};
use crate::tickets::TicketEngine;
use crate::transport::attachments::AttachmentFetch;
use crate::transport::{
    AttachmentRef, Author, ChannelAccess, ChatTransport, Control, CreateChannelSpec,
    HistoryMessage, NewChannelAccess, OutboundMessage, Privilege, TransportError,
};

#[derive(Debug, Clone)]
pub struct FakeMessage {
    pub id: String,
    pub author_id: String,
    pub author_tag: String,
    pub content: String,
    pub controls: Vec<Control>,
    pub attachments: Vec<AttachmentRef>,
    pub has_file: bool,
}

#[derive(Debug, Default)]
pub struct FakeChannel {
    pub name: String,
    pub category_id: Option<String>,
    /// Messages in send order (oldest first).
    pub messages: Vec<FakeMessage>,
    pub access: HashMap<String, ChannelAccess>,
    pub privileged_only: bool,
}

#[derive(Default)]
struct FakeState {
    channels: HashMap<String, FakeChannel>,
    deleted_channels: Vec<String>,
    managers: HashSet<String>,
    admins: HashSet<String>,
    next_id: u64,
}

impl FakeState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }
}

/// Deterministic in-memory stand-in for the platform adapter.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
    pub reconnects: AtomicU32,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_manager(&self, user_id: &str) {
        self.lock().managers.insert(user_id.to_string());
    }

    pub fn grant_admin(&self, user_id: &str) {
        self.lock().admins.insert(user_id.to_string());
    }

    /// Seed a channel directly, bypassing `create_channel`.
    pub fn seed_channel(&self, channel_id: &str, name: &str) {
        self.lock().channels.insert(
            channel_id.to_string(),
            FakeChannel {
                name: name.to_string(),
                ..FakeChannel::default()
            },
        );
    }

    /// Append a user message to a channel's history.
    pub fn push_history(
        &self,
        channel_id: &str,
        author_id: &str,
        content: &str,
        attachments: Vec<AttachmentRef>,
    ) {
        let mut state = self.lock();
        let id = state.next_id();
        if let Some(channel) = state.channels.get_mut(channel_id) {
            channel.messages.push(FakeMessage {
                id,
                author_id: author_id.to_string(),
                author_tag: format!("user-{author_id}"),
                content: content.to_string(),
                controls: Vec::new(),
                attachments,
                has_file: false,
            });
        }
    }

    pub fn channel(&self, channel_id: &str) -> Option<FakeChannelView> {
        self.lock().channels.get(channel_id).map(|c| FakeChannelView {
            name: c.name.clone(),
            messages: c.messages.clone(),
            access: c.access.clone(),
            privileged_only: c.privileged_only,
        })
    }

    pub fn channel_exists(&self, channel_id: &str) -> bool {
        self.lock().channels.contains_key(channel_id)
    }

    pub fn deleted_channels(&self) -> Vec<String> {
        self.lock().deleted_channels.clone()
    }

    /// Channel id of the most recently created channel with this name.
    pub fn channel_id_by_name(&self, name: &str) -> Option<String> {
        let state = self.lock();
        let mut found: Option<(u64, String)> = None;
        for (id, channel) in &state.channels {
            if channel.name == name {
                let numeric = id.parse::<u64>().unwrap_or(0);
                if found.as_ref().map(|(n, _)| numeric > *n).unwrap_or(true) {
                    found = Some((numeric, id.clone()));
                }
            }
        }
        found.map(|(_, id)| id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Snapshot of a fake channel for assertions.
#[derive(Debug, Clone)]
pub struct FakeChannelView {
    pub name: String,
    pub messages: Vec<FakeMessage>,
    pub access: HashMap<String, ChannelAccess>,
    pub privileged_only: bool,
}

/// Embed messages are flattened so assertions can match any visible part:
/// title, description and footer in order.
fn flatten_embed(embed: &crate::transport::Embed) -> String {
    [
        embed.title.as_deref(),
        embed.description.as_deref(),
        embed.footer.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join("\n")
}

fn to_history(message: &FakeMessage) -> HistoryMessage {
    HistoryMessage {
        id: message.id.clone(),
        author: Author {
            id: message.author_id.clone(),
            tag: message.author_tag.clone(),
            bot: false,
        },
        content: message.content.clone(),
        created_at: Utc::now(),
        attachments: message.attachments.clone(),
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutboundMessage,
    ) -> Result<String, TransportError> {
        let mut state = self.lock();
        let id = state.next_id();
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| TransportError::NotFound(format!("channel {channel_id}")))?;
        let content = message
            .content
            .clone()
            .or_else(|| message.embed.as_ref().map(flatten_embed))
            .unwrap_or_default();
        channel.messages.push(FakeMessage {
            id: id.clone(),
            author_id: "bot".to_string(),
            author_tag: "bot#0000".to_string(),
            content,
            controls: message.controls.clone(),
            attachments: Vec::new(),
            has_file: message.file.is_some(),
        });
        Ok(id)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| TransportError::NotFound(format!("channel {channel_id}")))?;
        let existing = channel
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| TransportError::NotFound(format!("message {message_id}")))?;
        if let Some(content) = &message.content {
            existing.content = content.clone();
        } else if let Some(embed) = &message.embed {
            existing.content = flatten_embed(embed);
        }
        if !message.controls.is_empty() {
            existing.controls = message.controls.clone();
        } else if message.clear_controls {
            existing.controls.clear();
        }
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<HistoryMessage>, TransportError> {
        let state = self.lock();
        Ok(state
            .channels
            .get(channel_id)
            .and_then(|c| c.messages.iter().find(|m| m.id == message_id))
            .map(to_history))
    }

    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| TransportError::NotFound(format!("channel {channel_id}")))?;
        channel.messages.retain(|m| m.id != message_id);
        Ok(())
    }

    async fn history_page(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: u8,
    ) -> Result<Vec<HistoryMessage>, TransportError> {
        let state = self.lock();
        let channel = state
            .channels
            .get(channel_id)
            .ok_or_else(|| TransportError::NotFound(format!("channel {channel_id}")))?;
        let cutoff = match before {
            Some(id) => channel
                .messages
                .iter()
                .position(|m| m.id == id)
                .unwrap_or(0),
            None => channel.messages.len(),
        };
        Ok(channel.messages[..cutoff]
            .iter()
            .rev()
            .take(limit as usize)
            .map(to_history)
            .collect())
    }

    async fn create_channel(
        &self,
        _org_id: &str,
        spec: &CreateChannelSpec,
    ) -> Result<String, TransportError> {
        let mut state = self.lock();
        let id = state.next_id();
        let mut channel = FakeChannel {
            name: spec.name.clone(),
            category_id: spec.category_id.clone(),
            ..FakeChannel::default()
        };
        match &spec.access {
            NewChannelAccess::OwnerOnly { owner_id } => {
                channel.access.insert(owner_id.clone(), ChannelAccess::GRANTED);
            }
            NewChannelAccess::PrivilegedOnly => channel.privileged_only = true,
        }
        state.channels.insert(id.clone(), channel);
        Ok(id)
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| TransportError::NotFound(format!("channel {channel_id}")))?;
        channel.name = name.to_string();
        Ok(())
    }

    async fn delete_channel(
        &self,
        channel_id: &str,
        _reason: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.channels.remove(channel_id).is_none() {
            return Err(TransportError::NotFound(format!("channel {channel_id}")));
        }
        state.deleted_channels.push(channel_id.to_string());
        Ok(())
    }

    async fn set_member_access(
        &self,
        channel_id: &str,
        user_id: &str,
        access: ChannelAccess,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let channel = state
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| TransportError::NotFound(format!("channel {channel_id}")))?;
        channel.access.insert(user_id.to_string(), access);
        Ok(())
    }

    async fn member_has_privilege(
        &self,
        _org_id: &str,
        user_id: &str,
        privilege: Privilege,
    ) -> Result<bool, TransportError> {
        let state = self.lock();
        Ok(match privilege {
            Privilege::Manage => {
                state.managers.contains(user_id) || state.admins.contains(user_id)
            }
            Privilege::Admin => state.admins.contains(user_id),
        })
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Attachment fetcher that records destinations instead of downloading.
#[derive(Default)]
pub struct FakeFetcher {
    fail_urls: Mutex<HashSet<String>>,
    saved: Mutex<Vec<PathBuf>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_url(&self, url: &str) {
        if let Ok(mut urls) = self.fail_urls.lock() {
            urls.insert(url.to_string());
        }
    }

    pub fn saved(&self) -> Vec<PathBuf> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AttachmentFetch for FakeFetcher {
    async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, TransportError> {
        let fails = self
            .fail_urls
            .lock()
            .map(|urls| urls.contains(url))
            .unwrap_or(false);
        if fails {
            return Err(TransportError::Network(format!("unreachable: {url}")));
        }
        if let Ok(mut saved) = self.saved.lock() {
            saved.push(dest.to_path_buf());
        }
        Ok(1)
    }
}

/// A fully wired engine over fakes and the in-memory store.
pub struct TestHarness {
    pub transport: Arc<FakeTransport>,
    pub fetcher: Arc<FakeFetcher>,
    pub engine: Arc<TicketEngine>,
    pub archiver: Arc<Archiver>,
    pub configs: Arc<ConfigStore>,
    pub tickets: Arc<TicketStore>,
    pub archives: Arc<ArchiveStore>,
}

pub const TEST_ORG: &str = "100";

impl TestHarness {
    pub async fn with_config(config: OrganizationConfig) -> Self {
        let kv = Arc::new(MemoryStore::new());
        let configs = Arc::new(ConfigStore::new(kv.clone()));
        let tickets = Arc::new(TicketStore::new(kv.clone()));
        let archives = Arc::new(ArchiveStore::new(kv));
        let transport = Arc::new(FakeTransport::new());
        let fetcher = Arc::new(FakeFetcher::new());

        if let Err(e) = configs.save(TEST_ORG, &config).await {
            panic!("seeding config failed: {e:?}");
        }

        let archiver = Arc::new(Archiver::new(
            transport.clone(),
            configs.clone(),
            tickets.clone(),
            archives.clone(),
            fetcher.clone(),
            std::env::temp_dir().join("ticketserver-test-attachments"),
        ));
        let engine = Arc::new(TicketEngine::new(
            transport.clone(),
            configs.clone(),
            tickets.clone(),
            archives.clone(),
            Arc::new(CooldownGuard::new()),
            archiver.clone(),
        ));

        Self {
            transport,
            fetcher,
            engine,
            archiver,
            configs,
            tickets,
            archives,
        }
    }

    pub async fn new() -> Self {
        Self::with_config(OrganizationConfig::default_template()).await
    }
}
