//! Interaction routing: custom-id codec for controls and forms, plus the
//! dispatcher that turns inbound interactions into engine calls.
//!
//! Custom ids are the only state carried inside a message; everything else
//! is re-read from the stores when the interaction arrives.

use log::error;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::shared::models::TicketOption;
use crate::tickets::{CloseOutcome, TicketEngine, TicketError};
use crate::transport::{channel_mention, mention, ReconnectGuard};

/// Custom id of the panel's option select menu.
pub const PANEL_SELECT_ID: &str = "ticket_select";
/// Custom id of the inert "closed by" button; never dispatched.
pub const DISABLED_CONTROL: &str = "disabled";

const FORM_PREFIX: &str = "ticket_modal";
const SEP: &str = "::";

/// Button actions, each carrying the channel it operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    Close { channel_id: String },
    Confirm { channel_id: String },
    Transcript { channel_id: String },
    Reopen { channel_id: String },
    Delete { channel_id: String },
}

impl ControlAction {
    pub fn custom_id(&self) -> String {
        let (prefix, channel_id) = match self {
            Self::Close { channel_id } => ("ticket_close", channel_id),
            Self::Confirm { channel_id } => ("ticket_confirm", channel_id),
            Self::Transcript { channel_id } => ("support_transcript", channel_id),
            Self::Reopen { channel_id } => ("support_open", channel_id),
            Self::Delete { channel_id } => ("support_delete", channel_id),
        };
        format!("{prefix}{SEP}{channel_id}")
    }

    /// Decode a button custom id. Unknown and inert ids return `None`.
    pub fn parse(custom_id: &str) -> Option<Self> {
        let (prefix, channel_id) = custom_id.split_once(SEP)?;
        if channel_id.is_empty() {
            return None;
        }
        let channel_id = channel_id.to_string();
        match prefix {
            "ticket_close" => Some(Self::Close { channel_id }),
            "ticket_confirm" => Some(Self::Confirm { channel_id }),
            "support_transcript" => Some(Self::Transcript { channel_id }),
            "support_open" => Some(Self::Reopen { channel_id }),
            "support_delete" => Some(Self::Delete { channel_id }),
            _ => None,
        }
    }
}

pub fn form_custom_id(option_id: &str) -> String {
    format!("{FORM_PREFIX}{SEP}{option_id}")
}

pub fn parse_form_custom_id(custom_id: &str) -> Option<&str> {
    let (prefix, option_id) = custom_id.split_once(SEP)?;
    if prefix == FORM_PREFIX && !option_id.is_empty() {
        Some(option_id)
    } else {
        None
    }
}

/// Slash-command surface.
#[derive(Debug, Clone)]
pub enum Command {
    PostPanel,
    Confirm,
    SetPrize { amount: String },
}

#[derive(Debug, Clone)]
pub enum InteractionKind {
    SelectOption { option_id: String },
    SubmitForm {
        option_id: String,
        values: BTreeMap<String, String>,
    },
    Control(ControlAction),
    Command(Command),
}

/// A decoded inbound interaction, platform specifics already stripped.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub org_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub user_tag: String,
    pub kind: InteractionKind,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub ephemeral: bool,
}

impl Reply {
    fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ephemeral: true,
        }
    }

    fn public(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ephemeral: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Reply(Reply),
    /// Present the option's form to the user.
    ShowForm(TicketOption),
}

pub struct Dispatcher {
    engine: Arc<TicketEngine>,
    reconnect: Arc<ReconnectGuard>,
}

impl Dispatcher {
    pub fn new(engine: Arc<TicketEngine>, reconnect: Arc<ReconnectGuard>) -> Self {
        Self { engine, reconnect }
    }

    /// Handle one interaction end to end. Never fails: errors become an
    /// ephemeral reply, with infrastructure detail kept in the logs.
    pub async fn handle(&self, interaction: Interaction) -> Outcome {
        match self.dispatch(&interaction).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let TicketError::Transport(t) = &err {
                    self.reconnect.handle_error(t).await;
                }
                match &err {
                    TicketError::Store(_) | TicketError::Transport(_) => {
                        error!(
                            "interaction failed (org {}, channel {}, user {}): {err}",
                            interaction.org_id, interaction.channel_id, interaction.user_id
                        );
                    }
                    _ => {}
                }
                Outcome::Reply(Reply::ephemeral(err.user_message()))
            }
        }
    }

    async fn dispatch(&self, interaction: &Interaction) -> Result<Outcome, TicketError> {
        let org = &interaction.org_id;
        let channel = &interaction.channel_id;
        let user = &interaction.user_id;

        match &interaction.kind {
            InteractionKind::SelectOption { option_id } => {
                let option = self.engine.select_option(org, user, option_id).await?;
                Ok(Outcome::ShowForm(option))
            }
            InteractionKind::SubmitForm { option_id, values } => {
                let created = self
                    .engine
                    .create_ticket(org, user, option_id, values.clone())
                    .await?;
                Ok(Outcome::Reply(Reply::ephemeral(format!(
                    "Ticket created: {}",
                    channel_mention(&created.channel_id)
                ))))
            }
            InteractionKind::Control(action) => self.dispatch_control(interaction, action).await,
            InteractionKind::Command(Command::PostPanel) => {
                self.engine.post_panel(org, channel, Some(user)).await?;
                Ok(Outcome::Reply(Reply::ephemeral("Panel posted.")))
            }
            InteractionKind::Command(Command::Confirm) => {
                self.engine.post_confirm_prompt(org, channel, user).await?;
                Ok(Outcome::Reply(Reply::ephemeral(
                    "Confirmation prompt posted.",
                )))
            }
            InteractionKind::Command(Command::SetPrize { amount }) => {
                let display = self
                    .engine
                    .set_prize_amount(org, channel, user, amount)
                    .await?;
                Ok(Outcome::Reply(Reply::ephemeral(format!(
                    "Prize amount set to {display}."
                ))))
            }
        }
    }

    async fn dispatch_control(
        &self,
        interaction: &Interaction,
        action: &ControlAction,
    ) -> Result<Outcome, TicketError> {
        let org = &interaction.org_id;
        let user = &interaction.user_id;

        let reply = match action {
            ControlAction::Close { channel_id } => {
                match self
                    .engine
                    .close_ticket(org, channel_id, user, &interaction.user_tag)
                    .await?
                {
                    // Everyone in the channel sees who closed it.
                    CloseOutcome::Closed => {
                        Reply::public(format!("Ticket closed by {}", mention(user)))
                    }
                    CloseOutcome::AlreadyClosed => {
                        Reply::ephemeral("This ticket is already closed.")
                    }
                }
            }
            ControlAction::Confirm { channel_id } => {
                self.engine.confirm_ticket(org, channel_id, user).await?;
                Reply::ephemeral("Confirmed. Ticket archived.")
            }
            ControlAction::Transcript { channel_id } => {
                self.engine.post_transcript(org, channel_id, user).await?;
                Reply::ephemeral("Transcript posted.")
            }
            ControlAction::Reopen { channel_id } => {
                let name = self.engine.reopen_ticket(org, channel_id, user).await?;
                Reply::ephemeral(format!("Ticket reopened as {name}."))
            }
            ControlAction::Delete { channel_id } => {
                self.engine.delete_ticket(org, channel_id, user).await?;
                Reply::ephemeral("Ticket archived and deleted.")
            }
        };
        Ok(Outcome::Reply(reply))
    }
}
