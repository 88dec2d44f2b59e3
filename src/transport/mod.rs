//! Chat-platform boundary.
//!
//! The ticket engine only talks to [`ChatTransport`]; the Discord REST
//! adapter lives in [`discord`] and tests substitute an in-process fake.
//! All calls are asynchronous and may fail transiently.

pub mod attachments;
pub mod discord;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum TransportError {
    Network(String),
    Api {
        code: Option<String>,
        message: String,
    },
    RateLimited {
        retry_after: Option<u64>,
    },
    AuthenticationFailed(String),
    /// The inbound interaction token is no longer valid; the narrow error
    /// class that warrants a transport reconnect.
    StaleInteraction(String),
    NotFound(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "Network error: {msg}"),
            Self::Api { code, message } => {
                if let Some(c) = code {
                    write!(f, "API error [{c}]: {message}")
                } else {
                    write!(f, "API error: {message}")
                }
            }
            Self::RateLimited { retry_after } => {
                if let Some(secs) = retry_after {
                    write!(f, "Rate limited, retry after {secs} seconds")
                } else {
                    write!(f, "Rate limited")
                }
            }
            Self::AuthenticationFailed(msg) => write!(f, "Authentication failed: {msg}"),
            Self::StaleInteraction(msg) => write!(f, "Interaction no longer valid: {msg}"),
            Self::NotFound(what) => write!(f, "Not found: {what}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    pub fn is_stale_interaction(&self) -> bool {
        matches!(self, Self::StaleInteraction(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStyle {
    Primary,
    Secondary,
    Success,
    Danger,
}

/// An interactive button attached to a message.
#[derive(Debug, Clone)]
pub struct Control {
    pub custom_id: String,
    pub label: String,
    pub style: ControlStyle,
    pub emoji: Option<String>,
    pub disabled: bool,
}

impl Control {
    pub fn new(custom_id: impl Into<String>, label: impl Into<String>, style: ControlStyle) -> Self {
        Self {
            custom_id: custom_id.into(),
            label: label.into(),
            style,
            emoji: None,
            disabled: false,
        }
    }

    pub fn with_emoji(mut self, emoji: &str) -> Self {
        self.emoji = Some(emoji.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SelectMenu {
    pub custom_id: String,
    pub placeholder: String,
    pub options: Vec<SelectOption>,
}

#[derive(Debug, Clone)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Embed {
    pub title: Option<String>,
    pub description: Option<String>,
    pub color: Option<u32>,
    pub fields: Vec<EmbedField>,
    pub footer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Outbound message payload.
///
/// For edits, `None`/empty parts leave the live message untouched;
/// `clear_controls` removes existing controls when no new ones are given.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub content: Option<String>,
    pub embed: Option<Embed>,
    pub controls: Vec<Control>,
    pub menu: Option<SelectMenu>,
    pub file: Option<FileUpload>,
    pub clear_controls: bool,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            embed: Some(embed),
            ..Self::default()
        }
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.controls.push(control);
        self
    }

    pub fn with_menu(mut self, menu: SelectMenu) -> Self {
        self.menu = Some(menu);
        self
    }

    pub fn with_file(mut self, file: FileUpload) -> Self {
        self.file = Some(file);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Author {
    pub id: String,
    pub tag: String,
    pub bot: bool,
}

#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: String,
    pub author: Author,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<AttachmentRef>,
}

/// Per-user channel permission overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAccess {
    pub view: bool,
    pub send: bool,
    pub history: bool,
}

impl ChannelAccess {
    pub const GRANTED: Self = Self {
        view: true,
        send: true,
        history: true,
    };
    pub const REVOKED: Self = Self {
        view: false,
        send: false,
        history: false,
    };
}

/// Who can see a newly created channel.
#[derive(Debug, Clone)]
pub enum NewChannelAccess {
    /// Hidden from everyone except the requesting user (and staff roles
    /// with organization-wide visibility).
    OwnerOnly { owner_id: String },
    /// Restricted to roles holding management/administrator privileges.
    PrivilegedOnly,
}

#[derive(Debug, Clone)]
pub struct CreateChannelSpec {
    pub name: String,
    pub category_id: Option<String>,
    pub access: NewChannelAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Staff privilege: close/reopen/delete tickets, override amounts.
    Manage,
    /// Administrator privilege: post panels.
    Admin,
}

/// Maximum page size the transport accepts for history retrieval.
pub const HISTORY_PAGE_LIMIT: u8 = 100;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a message, returning its id.
    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutboundMessage,
    ) -> Result<String, TransportError>;

    /// Edit a previously sent message. `None` parts are left unchanged.
    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), TransportError>;

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<HistoryMessage>, TransportError>;

    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), TransportError>;

    /// Fetch a page of history strictly older than `before`, newest first,
    /// at most `limit` (≤ [`HISTORY_PAGE_LIMIT`]) entries.
    async fn history_page(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: u8,
    ) -> Result<Vec<HistoryMessage>, TransportError>;

    /// Create a channel, returning its id.
    async fn create_channel(
        &self,
        org_id: &str,
        spec: &CreateChannelSpec,
    ) -> Result<String, TransportError>;

    async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<(), TransportError>;

    async fn delete_channel(&self, channel_id: &str, reason: &str)
        -> Result<(), TransportError>;

    async fn set_member_access(
        &self,
        channel_id: &str,
        user_id: &str,
        access: ChannelAccess,
    ) -> Result<(), TransportError>;

    /// Privileges are resolved at the moment of the action, never cached.
    async fn member_has_privilege(
        &self,
        org_id: &str,
        user_id: &str,
        privilege: Privilege,
    ) -> Result<bool, TransportError>;

    /// Re-establish the platform connection after a stale-interaction class
    /// failure.
    async fn reconnect(&self) -> Result<(), TransportError>;
}

/// Platform mention for a user id.
pub fn mention(user_id: &str) -> String {
    format!("<@{user_id}>")
}

/// Platform mention for a channel id.
pub fn channel_mention(channel_id: &str) -> String {
    format!("<#{channel_id}>")
}

const RECONNECT_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Rate-limited reconnect safeguard: at most one transport reconnect per
/// minute, regardless of how many stale-interaction errors arrive.
pub struct ReconnectGuard {
    transport: Arc<dyn ChatTransport>,
    last_attempt: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl ReconnectGuard {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            last_attempt: Mutex::new(None),
            min_interval: RECONNECT_MIN_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_interval(transport: Arc<dyn ChatTransport>, min_interval: Duration) -> Self {
        Self {
            transport,
            last_attempt: Mutex::new(None),
            min_interval,
        }
    }

    /// Trigger a reconnect for the narrow stale-interaction error class;
    /// all other errors are left to local recovery.
    pub async fn handle_error(&self, err: &TransportError) {
        if err.is_stale_interaction() {
            self.try_reconnect(&err.to_string()).await;
        }
    }

    pub async fn try_reconnect(&self, reason: &str) {
        let mut last = self.last_attempt.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < self.min_interval {
                return;
            }
        }
        *last = Some(Instant::now());
        info!("attempting transport reconnect: {reason}");
        if let Err(e) = self.transport.reconnect().await {
            warn!("transport reconnect failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingTransport {
        reconnects: AtomicU32,
    }

    #[async_trait]
    impl ChatTransport for CountingTransport {
        async fn send_message(
            &self,
            _channel_id: &str,
            _message: &OutboundMessage,
        ) -> Result<String, TransportError> {
            Ok("0".to_string())
        }
        async fn edit_message(
            &self,
            _channel_id: &str,
            _message_id: &str,
            _message: &OutboundMessage,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn fetch_message(
            &self,
            _channel_id: &str,
            _message_id: &str,
        ) -> Result<Option<HistoryMessage>, TransportError> {
            Ok(None)
        }
        async fn delete_message(
            &self,
            _channel_id: &str,
            _message_id: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn history_page(
            &self,
            _channel_id: &str,
            _before: Option<&str>,
            _limit: u8,
        ) -> Result<Vec<HistoryMessage>, TransportError> {
            Ok(vec![])
        }
        async fn create_channel(
            &self,
            _org_id: &str,
            _spec: &CreateChannelSpec,
        ) -> Result<String, TransportError> {
            Ok("0".to_string())
        }
        async fn rename_channel(
            &self,
            _channel_id: &str,
            _name: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn delete_channel(
            &self,
            _channel_id: &str,
            _reason: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn set_member_access(
            &self,
            _channel_id: &str,
            _user_id: &str,
            _access: ChannelAccess,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn member_has_privilege(
            &self,
            _org_id: &str,
            _user_id: &str,
            _privilege: Privilege,
        ) -> Result<bool, TransportError> {
            Ok(false)
        }
        async fn reconnect(&self) -> Result<(), TransportError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn reconnect_is_rate_limited() {
        let transport = Arc::new(CountingTransport {
            reconnects: AtomicU32::new(0),
        });
        let guard = ReconnectGuard::with_interval(transport.clone(), Duration::from_secs(60));

        let stale = TransportError::StaleInteraction("token expired".to_string());
        guard.handle_error(&stale).await;
        guard.handle_error(&stale).await;
        guard.handle_error(&stale).await;

        assert_eq!(transport.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_stale_errors_do_not_reconnect() {
        let transport = Arc::new(CountingTransport {
            reconnects: AtomicU32::new(0),
        });
        let guard = ReconnectGuard::new(transport.clone());

        guard
            .handle_error(&TransportError::Network("timeout".to_string()))
            .await;
        guard
            .handle_error(&TransportError::Api {
                code: None,
                message: "boom".to_string(),
            })
            .await;

        assert_eq!(transport.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconnect_allowed_after_interval() {
        let transport = Arc::new(CountingTransport {
            reconnects: AtomicU32::new(0),
        });
        let guard = ReconnectGuard::with_interval(transport.clone(), Duration::from_millis(10));

        guard.try_reconnect("first").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.try_reconnect("second").await;

        assert_eq!(transport.reconnects.load(Ordering::SeqCst), 2);
    }
}
