//! Ticket lifecycle engine.
//!
//! States: OPEN → CLOSED → ARCHIVED (terminal), with staff-only
//! CLOSED → OPEN reopening and direct OPEN → ARCHIVED via confirm/delete.
//! Privileges are re-resolved at the moment of every action; any action
//! against a channel without metadata is rejected rather than repaired.

pub mod actions;
pub mod amount;
pub mod archive;
pub mod cooldown;
pub mod store;

use chrono::Utc;
use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::shared::models::{
    OrganizationConfig, TicketMetadata, TicketOption, PRIZE_AMOUNT_FIELD, SUMMARY_FIELD,
};
use crate::storage::StoreError;
use crate::tickets::actions::ControlAction;
use crate::tickets::amount::parse_amount;
use crate::tickets::archive::{ArchiveOutcome, Archiver};
use crate::tickets::cooldown::{Cooldown, CooldownGuard};
use crate::tickets::store::{ArchiveStore, ConfigStore, TicketStore};
use crate::transport::{
    mention, ChannelAccess, ChatTransport, Control, ControlStyle, CreateChannelSpec, Embed,
    EmbedField, FileUpload, NewChannelAccess, OutboundMessage, Privilege, SelectMenu,
    SelectOption, TransportError,
};

#[derive(Debug)]
pub enum TicketError {
    /// The organization has no stored configuration.
    NotConfigured,
    UnknownOption(String),
    MissingField(String),
    /// Action referenced a channel with no ticket metadata.
    NotATicket,
    InsufficientPrivilege,
    Cooldown { wait_secs: u64 },
    Store(StoreError),
    Transport(TransportError),
}

impl std::fmt::Display for TicketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "This server is not configured for tickets."),
            Self::UnknownOption(id) => write!(f, "Unknown ticket option: {id}"),
            Self::MissingField(label) => write!(f, "Field \"{label}\" is required."),
            Self::NotATicket => write!(f, "Ticket metadata missing."),
            Self::InsufficientPrivilege => {
                write!(f, "You do not have permission to do that.")
            }
            Self::Cooldown { wait_secs } => {
                write!(f, "You are on cooldown. Please wait {wait_secs}s before trying again.")
            }
            Self::Store(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TicketError {}

impl From<StoreError> for TicketError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TransportError> for TicketError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl TicketError {
    /// Validation errors are reported verbatim; infrastructure failures get
    /// a generic message while the detail stays in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Store(_) | Self::Transport(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedTicket {
    pub ticket_id: u64,
    pub channel_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    /// The ticket was already closed; the second press is a no-op.
    AlreadyClosed,
}

pub struct TicketEngine {
    transport: Arc<dyn ChatTransport>,
    configs: Arc<ConfigStore>,
    tickets: Arc<TicketStore>,
    archives: Arc<ArchiveStore>,
    cooldowns: Arc<CooldownGuard>,
    archiver: Arc<Archiver>,
}

impl TicketEngine {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        configs: Arc<ConfigStore>,
        tickets: Arc<TicketStore>,
        archives: Arc<ArchiveStore>,
        cooldowns: Arc<CooldownGuard>,
        archiver: Arc<Archiver>,
    ) -> Self {
        Self {
            transport,
            configs,
            tickets,
            archives,
            cooldowns,
            archiver,
        }
    }

    async fn require_privilege(
        &self,
        org: &str,
        user: &str,
        privilege: Privilege,
    ) -> Result<(), TicketError> {
        if self
            .transport
            .member_has_privilege(org, user, privilege)
            .await?
        {
            Ok(())
        } else {
            Err(TicketError::InsufficientPrivilege)
        }
    }

    /// Owner of the ticket, or a member holding management privilege.
    async fn require_owner_or_manage(
        &self,
        org: &str,
        user: &str,
        meta: &TicketMetadata,
    ) -> Result<(), TicketError> {
        if user == meta.owner_id {
            return Ok(());
        }
        self.require_privilege(org, user, Privilege::Manage).await
    }

    async fn load_config(&self, org: &str) -> Result<OrganizationConfig, TicketError> {
        self.configs
            .load(org)
            .await?
            .ok_or(TicketError::NotConfigured)
    }

    async fn load_meta(&self, org: &str, channel_id: &str) -> Result<TicketMetadata, TicketError> {
        self.tickets
            .get(org, channel_id)
            .await?
            .ok_or(TicketError::NotATicket)
    }

    /// Panel option selection: reject inside the global creation window
    /// before the form is even shown (without recording; only the submit
    /// gate records), then the per-option gate, then option resolution so
    /// the caller can render the matching form.
    pub async fn select_option(
        &self,
        org: &str,
        user: &str,
        option_id: &str,
    ) -> Result<TicketOption, TicketError> {
        let now = Utc::now();
        if let Cooldown::Wait(wait_secs) = self.cooldowns.peek_ticket_creation(org, user, now).await
        {
            return Err(TicketError::Cooldown { wait_secs });
        }
        match self.cooldowns.check_option(org, user, option_id, now).await {
            Cooldown::Wait(wait_secs) => return Err(TicketError::Cooldown { wait_secs }),
            Cooldown::Ready => {}
        }

        let config = self.load_config(org).await?;
        let option = config
            .option(option_id)
            .ok_or_else(|| TicketError::UnknownOption(option_id.to_string()))?;
        Ok(option.clone())
    }

    /// Create a ticket from a completed form: allocate the next ticket id,
    /// create the owner-only channel, persist metadata and post the opening
    /// notification(s) with a Close control.
    pub async fn create_ticket(
        &self,
        org: &str,
        user: &str,
        option_id: &str,
        form_values: BTreeMap<String, String>,
    ) -> Result<CreatedTicket, TicketError> {
        let config = self.load_config(org).await?;
        let option = config
            .option(option_id)
            .ok_or_else(|| TicketError::UnknownOption(option_id.to_string()))?
            .clone();

        let fields = option.effective_form();
        for field in &fields {
            if field.required
                && form_values
                    .get(&field.id)
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            {
                return Err(TicketError::MissingField(field.label.clone()));
            }
        }

        // Validation precedes the gate so a rejected form does not burn the
        // creation window.
        match self
            .cooldowns
            .check_ticket_creation(org, user, Utc::now())
            .await
        {
            Cooldown::Wait(wait_secs) => return Err(TicketError::Cooldown { wait_secs }),
            Cooldown::Ready => {}
        }

        let ticket_id = self
            .configs
            .allocate_ticket_id(org)
            .await?
            .ok_or(TicketError::NotConfigured)?;

        let prefix = option.name_prefix().to_string();
        let name = format!("{}-{:04}", prefix, ticket_id);

        let channel_id = self
            .transport
            .create_channel(
                org,
                &CreateChannelSpec {
                    name: name.clone(),
                    category_id: config.category_id.clone(),
                    access: NewChannelAccess::OwnerOnly {
                        owner_id: user.to_string(),
                    },
                },
            )
            .await?;

        let summary = form_values.get(SUMMARY_FIELD).cloned().unwrap_or_default();
        let prize_amount_raw = form_values.get(PRIZE_AMOUNT_FIELD).cloned();
        let prize_parsed = prize_amount_raw.as_deref().and_then(parse_amount);
        let prize_details = form_values.get("prize_details").cloned();
        let form_labels = fields
            .iter()
            .map(|f| (f.id.clone(), f.label.clone()))
            .collect();

        let mut meta = TicketMetadata {
            ticket_id,
            channel_id: channel_id.clone(),
            option_id: option.id.clone(),
            label: option.label.clone(),
            prefix,
            is_prize: option.is_prize,
            owner_id: user.to_string(),
            summary: summary.clone(),
            form_values,
            form_labels,
            prize_amount_raw,
            prize_parsed,
            prize_details,
            created_at: Utc::now(),
            closed: false,
            closed_at: None,
            closed_by: None,
            respond_message_id: None,
            confirm_message_id: None,
            control_message_id: None,
        };
        self.tickets.put(org, &meta).await?;

        let template = option
            .response_template
            .clone()
            .unwrap_or_else(|| config.opening_template.clone());
        let opening_text = template
            .replace("{user}", &mention(user))
            .replace("{summary}", &summary);

        let close_control = Self::close_control(&channel_id);
        let opening = if option.response_use_embed {
            OutboundMessage::embed(Embed {
                description: Some(opening_text),
                color: config.panel.color,
                timestamp: Some(Utc::now()),
                ..Embed::default()
            })
            .with_control(close_control.clone())
        } else {
            OutboundMessage::text(opening_text).with_control(close_control.clone())
        };
        meta.respond_message_id = Some(self.transport.send_message(&channel_id, &opening).await?);

        if meta.is_prize {
            let details = OutboundMessage::embed(Self::details_embed(&config, &meta))
                .with_control(close_control);
            let details_id = self.transport.send_message(&channel_id, &details).await?;
            // The details message becomes the canonical notification to
            // edit later, replacing the opening message id.
            meta.respond_message_id = Some(details_id);
        }

        self.tickets.put(org, &meta).await?;

        Ok(CreatedTicket {
            ticket_id,
            channel_id,
            name,
        })
    }

    /// Close a ticket: rename the channel, revoke the owner's access,
    /// stamp the closing, disable the opening control and post the
    /// staff-only control panel. Idempotent: a second close is a no-op.
    pub async fn close_ticket(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
        actor_tag: &str,
    ) -> Result<CloseOutcome, TicketError> {
        let meta = self.load_meta(org, channel_id).await?;
        self.require_owner_or_manage(org, actor_id, &meta).await?;

        // Mark closed atomically first; side effects only run for the
        // transition winner.
        let mut was_closed = false;
        let meta = self
            .tickets
            .update(org, channel_id, |m| {
                if m.closed {
                    was_closed = true;
                } else {
                    m.closed = true;
                    m.closed_at = Some(Utc::now());
                    m.closed_by = Some(actor_id.to_string());
                }
            })
            .await?
            .ok_or(TicketError::NotATicket)?;
        if was_closed {
            return Ok(CloseOutcome::AlreadyClosed);
        }

        if let Err(e) = self
            .transport
            .rename_channel(channel_id, &meta.closed_name())
            .await
        {
            warn!("rename to closed name failed for {channel_id}: {e}");
        }
        if let Err(e) = self
            .transport
            .set_member_access(channel_id, &meta.owner_id, ChannelAccess::REVOKED)
            .await
        {
            warn!("owner access revoke failed for {channel_id}: {e}");
        }

        if let Some(respond_id) = &meta.respond_message_id {
            // Stamp the notification itself: footer on the details embed,
            // appended content line otherwise, and an inert button in
            // place of Close.
            let mut edited = OutboundMessage::default().with_control(
                Control::new(
                    actions::DISABLED_CONTROL,
                    format!("Closed by {actor_tag}"),
                    ControlStyle::Secondary,
                )
                .with_emoji("🔒")
                .disabled(),
            );
            if meta.is_prize {
                match self.load_config(org).await {
                    Ok(config) => {
                        let mut embed = Self::details_embed(&config, &meta);
                        embed.footer = Some(format!("Closed by {actor_tag}"));
                        edited.embed = Some(embed);
                    }
                    Err(e) => warn!("details re-render on close failed for {channel_id}: {e}"),
                }
            } else {
                match self.transport.fetch_message(channel_id, respond_id).await {
                    Ok(Some(existing)) => {
                        edited.content = Some(format!(
                            "{}\nClosed by {}",
                            existing.content,
                            mention(actor_id)
                        ));
                    }
                    Ok(None) => {}
                    Err(e) => warn!("opening message fetch failed for {channel_id}: {e}"),
                }
            }
            if let Err(e) = self
                .transport
                .edit_message(channel_id, respond_id, &edited)
                .await
            {
                warn!("disabling close control failed for {channel_id}: {e}");
            }
        }

        self.post_support_controls(org, channel_id).await;

        Ok(CloseOutcome::Closed)
    }

    /// Staff control panel (Transcript / Open / Delete) posted into the
    /// closed channel; presses are privilege-checked on arrival.
    async fn post_support_controls(&self, org: &str, channel_id: &str) {
        let panel = OutboundMessage::embed(Embed {
            title: Some("Support team ticket controls".to_string()),
            color: Some(0x2F3136),
            ..Embed::default()
        })
        .with_control(
            Control::new(
                ControlAction::Transcript {
                    channel_id: channel_id.to_string(),
                }
                .custom_id(),
                "Transcript",
                ControlStyle::Primary,
            )
            .with_emoji("📜"),
        )
        .with_control(
            Control::new(
                ControlAction::Reopen {
                    channel_id: channel_id.to_string(),
                }
                .custom_id(),
                "Open",
                ControlStyle::Success,
            )
            .with_emoji("🔓"),
        )
        .with_control(
            Control::new(
                ControlAction::Delete {
                    channel_id: channel_id.to_string(),
                }
                .custom_id(),
                "Delete",
                ControlStyle::Danger,
            )
            .with_emoji("⛔"),
        );

        match self.transport.send_message(channel_id, &panel).await {
            Ok(message_id) => {
                if let Err(e) = self
                    .tickets
                    .update(org, channel_id, |m| {
                        m.control_message_id = Some(message_id.clone());
                    })
                    .await
                {
                    warn!("recording control panel id failed for {channel_id}: {e}");
                }
            }
            Err(e) => warn!("posting support controls failed for {channel_id}: {e}"),
        }
    }

    /// Reopen a closed ticket: restore naming and owner access, clear the
    /// closing stamp and remove the staff control panel.
    pub async fn reopen_ticket(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
    ) -> Result<String, TicketError> {
        self.require_privilege(org, actor_id, Privilege::Manage)
            .await?;
        let meta = self.load_meta(org, channel_id).await?;

        let name = meta.open_name();
        if let Err(e) = self.transport.rename_channel(channel_id, &name).await {
            warn!("rename on reopen failed for {channel_id}: {e}");
        }
        if let Err(e) = self
            .transport
            .set_member_access(channel_id, &meta.owner_id, ChannelAccess::GRANTED)
            .await
        {
            warn!("owner access restore failed for {channel_id}: {e}");
        }

        let control_message = meta.control_message_id.clone();
        self.tickets
            .update(org, channel_id, |m| {
                m.closed = false;
                m.closed_at = None;
                m.closed_by = None;
                m.control_message_id = None;
            })
            .await?
            .ok_or(TicketError::NotATicket)?;

        if let Some(message_id) = control_message {
            if let Err(e) = self.transport.delete_message(channel_id, &message_id).await {
                warn!("control panel removal failed for {channel_id}: {e}");
            }
        }

        Ok(name)
    }

    /// Post the payout confirmation prompt with its Confirm control.
    pub async fn post_confirm_prompt(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
    ) -> Result<(), TicketError> {
        let meta = self.load_meta(org, channel_id).await?;
        self.require_owner_or_manage(org, actor_id, &meta).await?;

        let content = format!(
            "{} Transaction sent! Please click confirm to confirm that {} has been sent to the wallet.",
            mention(&meta.owner_id),
            meta.prize_display(),
        );
        let prompt = OutboundMessage::text(content).with_control(Control::new(
            ControlAction::Confirm {
                channel_id: channel_id.to_string(),
            }
            .custom_id(),
            "Confirm",
            ControlStyle::Success,
        ));
        let message_id = self.transport.send_message(channel_id, &prompt).await?;

        self.tickets
            .update(org, channel_id, |m| {
                m.confirm_message_id = Some(message_id.clone());
            })
            .await?
            .ok_or(TicketError::NotATicket)?;
        Ok(())
    }

    /// Confirm the ticket: mark the prompt as confirmed, then archive and
    /// destroy the channel.
    pub async fn confirm_ticket(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
    ) -> Result<u64, TicketError> {
        let meta = self.load_meta(org, channel_id).await?;
        self.require_owner_or_manage(org, actor_id, &meta).await?;

        if let Some(confirm_id) = &meta.confirm_message_id {
            let existing = self
                .transport
                .fetch_message(channel_id, confirm_id)
                .await
                .unwrap_or(None);
            let base = existing.map(|m| m.content).unwrap_or_default();
            let edited = OutboundMessage {
                content: Some(format!(
                    "{base}\n\nConfirmed by {} — archiving...",
                    mention(actor_id)
                )),
                clear_controls: true,
                ..OutboundMessage::default()
            };
            if let Err(e) = self
                .transport
                .edit_message(channel_id, confirm_id, &edited)
                .await
            {
                warn!("confirm prompt edit failed for {channel_id}: {e}");
            }
        }

        self.archive_and_report(org, channel_id, actor_id).await
    }

    /// Staff delete: archive and destroy without confirmation.
    pub async fn delete_ticket(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
    ) -> Result<u64, TicketError> {
        self.require_privilege(org, actor_id, Privilege::Manage)
            .await?;
        // Metadata existence is re-checked under the archiver's channel
        // lock; racing requests resolve there.
        self.archive_and_report(org, channel_id, actor_id).await
    }

    async fn archive_and_report(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
    ) -> Result<u64, TicketError> {
        match self.archiver.archive(org, channel_id, actor_id).await? {
            ArchiveOutcome::Archived { ticket_id } => Ok(ticket_id),
            ArchiveOutcome::MetadataMissing => Err(TicketError::NotATicket),
        }
    }

    /// Staff override of the payout amount; re-renders the details message
    /// when one exists. Returns the display string for the reply.
    pub async fn set_prize_amount(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
        amount: &str,
    ) -> Result<String, TicketError> {
        self.require_privilege(org, actor_id, Privilege::Manage)
            .await?;
        self.load_meta(org, channel_id).await?;

        let parsed = parse_amount(amount);
        let display = parsed
            .as_ref()
            .map(|p| p.display.clone())
            .unwrap_or_else(|| amount.to_string());

        let raw = amount.to_string();
        let meta = self
            .tickets
            .update(org, channel_id, move |m| {
                m.prize_amount_raw = Some(raw);
                m.prize_parsed = parsed;
            })
            .await?
            .ok_or(TicketError::NotATicket)?;

        if meta.is_prize {
            if let Some(respond_id) = &meta.respond_message_id {
                let config = self.load_config(org).await?;
                let edited = OutboundMessage::embed(Self::details_embed(&config, &meta));
                if let Err(e) = self
                    .transport
                    .edit_message(channel_id, respond_id, &edited)
                    .await
                {
                    warn!("details re-render failed for {channel_id}: {e}");
                }
            }
        }

        Ok(display)
    }

    /// Post the option panel into a channel and make sure the transcript
    /// channel exists. `actor` is `None` for trusted dashboard calls.
    pub async fn post_panel(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: Option<&str>,
    ) -> Result<String, TicketError> {
        if let Some(actor_id) = actor_id {
            self.require_privilege(org, actor_id, Privilege::Admin)
                .await?;
        }
        let config = self.load_config(org).await?;

        let panel = OutboundMessage::embed(Embed {
            title: Some(config.panel.title.clone()),
            description: Some(config.panel.description.clone()),
            color: config.panel.color,
            ..Embed::default()
        })
        .with_menu(SelectMenu {
            custom_id: actions::PANEL_SELECT_ID.to_string(),
            placeholder: "Make a selection".to_string(),
            options: config
                .options
                .iter()
                .map(|o| SelectOption {
                    value: o.id.clone(),
                    label: o.label.clone(),
                    description: if o.description.is_empty() {
                        None
                    } else {
                        Some(o.description.clone())
                    },
                })
                .collect(),
        });
        let message_id = self.transport.send_message(channel_id, &panel).await?;

        if let Err(e) = self.archiver.ensure_transcript_channel(org).await {
            warn!("transcript channel setup failed for {org}: {e}");
        }

        Ok(message_id)
    }

    /// Staff request for the stored archive of this ticket, posted to the
    /// transcript channel as a JSON attachment.
    pub async fn post_transcript(
        &self,
        org: &str,
        channel_id: &str,
        actor_id: &str,
    ) -> Result<(), TicketError> {
        self.require_privilege(org, actor_id, Privilege::Manage)
            .await?;
        let meta = self.load_meta(org, channel_id).await?;

        // Stored archive when one exists; otherwise capture the still-live
        // channel on demand.
        let archive = match self.archives.get(org, meta.ticket_id).await? {
            Some(archive) => archive,
            None => self.archiver.capture(org, &meta, None).await?,
        };

        let transcript = self
            .archiver
            .ensure_transcript_channel(org)
            .await?
            .ok_or(TicketError::NotConfigured)?;

        let bytes = serde_json::to_vec_pretty(&archive)
            .map_err(StoreError::from)?;
        let closed_by = archive
            .closed_by
            .as_deref()
            .map(mention)
            .unwrap_or_else(|| "unknown".to_string());
        let message = OutboundMessage::text(format!(
            "Transcript for ticket {} (closed by {closed_by}):",
            meta.open_name(),
        ))
        .with_file(FileUpload {
            filename: format!("ticket-{}.json", meta.ticket_id),
            bytes,
        });
        self.transport.send_message(&transcript, &message).await?;
        Ok(())
    }

    fn close_control(channel_id: &str) -> Control {
        Control::new(
            ControlAction::Close {
                channel_id: channel_id.to_string(),
            }
            .custom_id(),
            "Close",
            ControlStyle::Secondary,
        )
        .with_emoji("🔒")
    }

    /// Details embed for prize tickets: every captured field except the
    /// amount itself, then the parsed amount display.
    fn details_embed(config: &OrganizationConfig, meta: &TicketMetadata) -> Embed {
        let mut fields = Vec::new();
        for (id, value) in &meta.form_values {
            if id == PRIZE_AMOUNT_FIELD {
                continue;
            }
            let name = meta.form_labels.get(id).cloned().unwrap_or_else(|| id.clone());
            let value = if value.is_empty() {
                "\u{200b}".to_string()
            } else {
                // Field values are capped in characters, never mid-codepoint.
                value.chars().take(1024).collect()
            };
            fields.push(EmbedField { name, value });
        }
        if let Some(parsed) = &meta.prize_parsed {
            fields.push(EmbedField {
                name: "Prize amount".to_string(),
                value: parsed.display.clone(),
            });
        }
        Embed {
            title: Some(config.details_title.clone()),
            color: config.details_color,
            fields,
            timestamp: Some(Utc::now()),
            ..Embed::default()
        }
    }
}
