//! Archival pipeline: capture a ticket channel's full history and
//! attachments into an immutable record, then destroy the live channel.
//!
//! The sequence has no rollback. The archive record is authoritative: a
//! failure while deleting the channel leaves a stale channel without
//! metadata, and later actions against it fail cleanly as "not a ticket".

use chrono::Utc;
use log::warn;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::shared::models::{ArchivedMessage, SavedAttachment, TicketArchive, TicketMetadata};
use crate::tickets::store::{ArchiveStore, ConfigStore, TicketStore};
use crate::tickets::TicketError;
use crate::transport::attachments::{url_basename, AttachmentFetch};
use crate::transport::{
    mention, ChatTransport, CreateChannelSpec, HistoryMessage, NewChannelAccess, OutboundMessage,
    HISTORY_PAGE_LIMIT,
};

const TRANSCRIPT_CHANNEL_NAME: &str = "ticket-transcript";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived { ticket_id: u64 },
    /// Another archival already cleared the metadata; nothing to do.
    MetadataMissing,
}

pub struct Archiver {
    transport: Arc<dyn ChatTransport>,
    configs: Arc<ConfigStore>,
    tickets: Arc<TicketStore>,
    archives: Arc<ArchiveStore>,
    fetcher: Arc<dyn AttachmentFetch>,
    attachment_root: PathBuf,
    channel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Archiver {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        configs: Arc<ConfigStore>,
        tickets: Arc<TicketStore>,
        archives: Arc<ArchiveStore>,
        fetcher: Arc<dyn AttachmentFetch>,
        attachment_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            configs,
            tickets,
            archives,
            fetcher,
            attachment_root: attachment_root.into(),
            channel_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn channel_lock(&self, channel_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.channel_locks.lock().await;
            locks
                .entry(channel_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Archive a ticket channel and destroy it. At most one archival runs
    /// per channel; a concurrent second request observes the metadata is
    /// gone and no-ops.
    pub async fn archive(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
    ) -> Result<ArchiveOutcome, TicketError> {
        let _guard = self.channel_lock(channel_id).await;

        // Re-read under the channel lock; the loser of a race sees None.
        let Some(meta) = self.tickets.get(org, channel_id).await? else {
            return Ok(ArchiveOutcome::MetadataMissing);
        };

        self.capture(org, &meta, Some(actor_id.to_string())).await?;

        if meta.is_prize {
            self.post_prize_confirmation(org, &meta, actor_id).await;
        }

        self.tickets.delete(org, channel_id).await?;

        if let Err(e) = self.transport.delete_channel(channel_id, "Ticket archived").await {
            // The archive record is already authoritative; a stale channel
            // without metadata is tolerated.
            warn!("channel delete failed for {channel_id}: {e}");
        }

        Ok(ArchiveOutcome::Archived {
            ticket_id: meta.ticket_id,
        })
    }

    /// Capture the channel into a stored archive record without touching
    /// the live channel or metadata. Also used for on-demand transcripts
    /// of tickets that are closed but not yet archived.
    pub async fn capture(
        &self,
        org: &str,
        meta: &TicketMetadata,
        closed_by: Option<String>,
    ) -> Result<TicketArchive, TicketError> {
        let history = self.fetch_full_history(&meta.channel_id).await?;
        let messages = self.capture_messages(org, meta, history).await;

        let archive = TicketArchive {
            org_id: org.to_string(),
            ticket_id: meta.ticket_id,
            option_id: meta.option_id.clone(),
            label: meta.label.clone(),
            owner_id: meta.owner_id.clone(),
            is_prize: meta.is_prize,
            prize_amount_raw: meta.prize_amount_raw.clone(),
            prize_parsed: meta.prize_parsed.clone(),
            prize_details: meta.prize_details.clone(),
            summary: meta.summary.clone(),
            created_at: meta.created_at,
            closed_at: meta.closed_at.unwrap_or_else(Utc::now),
            closed_by: closed_by.or_else(|| meta.closed_by.clone()),
            messages,
        };
        self.archives.put(org, &archive).await?;
        Ok(archive)
    }

    /// Full channel history, oldest first. The transport caps a single
    /// fetch, so pages are pulled until exhausted.
    async fn fetch_full_history(
        &self,
        channel_id: &str,
    ) -> Result<Vec<HistoryMessage>, TicketError> {
        let mut newest_first: Vec<HistoryMessage> = Vec::new();
        let mut before: Option<String> = None;

        loop {
            let page = self
                .transport
                .history_page(channel_id, before.as_deref(), HISTORY_PAGE_LIMIT)
                .await?;
            if page.is_empty() {
                break;
            }
            let short_page = page.len() < HISTORY_PAGE_LIMIT as usize;
            before = page.last().map(|m| m.id.clone());
            newest_first.extend(page);
            if short_page {
                break;
            }
        }

        newest_first.reverse();
        Ok(newest_first)
    }

    async fn capture_messages(
        &self,
        org: &str,
        meta: &TicketMetadata,
        history: Vec<HistoryMessage>,
    ) -> Vec<ArchivedMessage> {
        let attachment_dir = self
            .attachment_root
            .join(org)
            .join(format!("{}_attachments", meta.ticket_id));

        let mut messages = Vec::with_capacity(history.len());
        for message in history {
            let mut saved = Vec::new();
            for attachment in &message.attachments {
                let filename = format!("{}_{}", message.id, url_basename(&attachment.url));
                let dest = attachment_dir.join(&filename);
                match self.fetcher.download_to(&attachment.url, &dest).await {
                    Ok(_) => saved.push(SavedAttachment {
                        filename,
                        url: attachment.url.clone(),
                    }),
                    // An individual failed download never aborts archival.
                    Err(e) => warn!("attachment download failed ({}): {e}", attachment.url),
                }
            }
            messages.push(ArchivedMessage {
                id: message.id,
                author_id: message.author.id,
                author_tag: message.author.tag,
                content: message.content,
                created_at: message.created_at,
                attachments: saved,
            });
        }
        messages
    }

    /// Post the human-readable payout confirmation line to the transcript
    /// channel. Best effort: archival already succeeded.
    async fn post_prize_confirmation(&self, org: &str, meta: &TicketMetadata, actor_id: &str) {
        let transcript = match self.ensure_transcript_channel(org).await {
            Ok(Some(channel_id)) => channel_id,
            Ok(None) => return,
            Err(e) => {
                warn!("transcript channel unavailable for {org}: {e}");
                return;
            }
        };

        let when = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let text = format!(
            "{} has confirmed that {} sent {} at {} {}.",
            mention(&meta.owner_id),
            mention(actor_id),
            meta.prize_display(),
            meta.current_name(),
            when,
        );
        if let Err(e) = self
            .transport
            .send_message(&transcript, &OutboundMessage::text(text))
            .await
        {
            warn!("transcript confirmation send failed: {e}");
        }
    }

    /// Resolve the well-known transcript channel, creating it on first use
    /// with visibility restricted to privileged roles.
    pub async fn ensure_transcript_channel(
        &self,
        org: &str,
    ) -> Result<Option<String>, TicketError> {
        let Some(config) = self.configs.load(org).await? else {
            return Ok(None);
        };
        if let Some(existing) = config.transcript_channel_id {
            return Ok(Some(existing));
        }

        let channel_id = self
            .transport
            .create_channel(
                org,
                &CreateChannelSpec {
                    name: TRANSCRIPT_CHANNEL_NAME.to_string(),
                    category_id: None,
                    access: NewChannelAccess::PrivilegedOnly,
                },
            )
            .await?;

        let channel = channel_id.clone();
        self.configs
            .update(org, move |config| {
                config.transcript_channel_id = Some(channel);
            })
            .await?;

        Ok(Some(channel_id))
    }
}
