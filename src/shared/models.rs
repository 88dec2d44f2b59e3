use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::tickets::amount::ParsedAmount;

/// Field id implicitly appended to the form of prize options.
pub const PRIZE_AMOUNT_FIELD: &str = "prize_amount";
pub const SUMMARY_FIELD: &str = "summary";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub color: Option<u32>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            title: "Ticket Panel".to_string(),
            description: "Select an option to open a ticket".to_string(),
            color: Some(0x1E90FF),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStyle {
    Short,
    Paragraph,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub id: String,
    pub label: String,
    pub style: FieldStyle,
    pub required: bool,
    #[serde(default)]
    pub placeholder: Option<String>,
}

impl FormField {
    pub fn new(id: &str, label: &str, style: FieldStyle, required: bool) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            style,
            required,
            placeholder: None,
        }
    }

    pub fn with_placeholder(mut self, placeholder: &str) -> Self {
        self.placeholder = Some(placeholder.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Channel-name prefix; falls back to the option id when blank.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub is_prize: bool,
    #[serde(default)]
    pub form: Vec<FormField>,
    #[serde(default)]
    pub response_template: Option<String>,
    #[serde(default)]
    pub response_use_embed: bool,
}

impl TicketOption {
    pub fn name_prefix(&self) -> &str {
        let trimmed = self.prefix.trim();
        if trimmed.is_empty() {
            &self.id
        } else {
            trimmed
        }
    }

    /// Form fields with the implicit prize amount field appended for prize
    /// options that do not already declare one.
    pub fn effective_form(&self) -> Vec<FormField> {
        let mut fields = if self.form.is_empty() {
            vec![FormField::new(
                SUMMARY_FIELD,
                "Short description",
                FieldStyle::Paragraph,
                true,
            )]
        } else {
            self.form.clone()
        };
        if self.is_prize && !fields.iter().any(|f| f.id == PRIZE_AMOUNT_FIELD) {
            fields.push(
                FormField::new(PRIZE_AMOUNT_FIELD, "Prize amount", FieldStyle::Short, true)
                    .with_placeholder("$100 or 100c"),
            );
        }
        fields
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationConfig {
    #[serde(default)]
    pub panel: PanelConfig,
    #[serde(default = "default_opening_template")]
    pub opening_template: String,
    #[serde(default = "default_details_title")]
    pub details_title: String,
    #[serde(default)]
    pub details_color: Option<u32>,
    pub options: Vec<TicketOption>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub ticket_counter: u64,
    #[serde(default)]
    pub transcript_channel_id: Option<String>,
}

fn default_opening_template() -> String {
    "Hey there! {user}\nSupport will be with you shortly.".to_string()
}

fn default_details_title() -> String {
    "Details".to_string()
}

impl OrganizationConfig {
    pub fn option(&self, id: &str) -> Option<&TicketOption> {
        self.options.iter().find(|o| o.id == id)
    }

    /// Config template served to the dashboard when an organization has no
    /// stored config yet.
    pub fn default_template() -> Self {
        Self {
            panel: PanelConfig::default(),
            opening_template: default_opening_template(),
            details_title: default_details_title(),
            details_color: Some(0x2EA043),
            options: vec![
                TicketOption {
                    id: "prize".to_string(),
                    label: "Prize / Payout".to_string(),
                    description: "Report a payout".to_string(),
                    prefix: "PRZ".to_string(),
                    is_prize: true,
                    form: vec![
                        FormField::new(
                            SUMMARY_FIELD,
                            "Short description / summary",
                            FieldStyle::Paragraph,
                            true,
                        ),
                        FormField::new(
                            PRIZE_AMOUNT_FIELD,
                            "Prize amount",
                            FieldStyle::Short,
                            true,
                        )
                        .with_placeholder("$100 or 100c"),
                        FormField::new(
                            "prize_details",
                            "Prize details",
                            FieldStyle::Paragraph,
                            false,
                        ),
                    ],
                    response_template: Some(
                        "Thank you {user}, staff will review your payout.".to_string(),
                    ),
                    response_use_embed: false,
                },
                TicketOption {
                    id: "other".to_string(),
                    label: "Other Support".to_string(),
                    description: "General support".to_string(),
                    prefix: "OTH".to_string(),
                    is_prize: false,
                    form: vec![FormField::new(
                        SUMMARY_FIELD,
                        "Short description / summary",
                        FieldStyle::Paragraph,
                        true,
                    )],
                    response_template: Some(
                        "Thanks {user} — please describe your issue and staff will assist."
                            .to_string(),
                    ),
                    response_use_embed: false,
                },
            ],
            category_id: None,
            ticket_counter: 0,
            transcript_channel_id: None,
        }
    }
}

/// Mutable record of one live (or closed but not yet archived) ticket.
/// Exactly one exists per ticket channel; it is deleted when the channel is
/// archived and destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketMetadata {
    pub ticket_id: u64,
    pub channel_id: String,
    pub option_id: String,
    pub label: String,
    pub prefix: String,
    pub is_prize: bool,
    pub owner_id: String,
    pub summary: String,
    #[serde(default)]
    pub form_values: BTreeMap<String, String>,
    /// Field id → display label, kept so the details message can be
    /// re-rendered after the option definition changes.
    #[serde(default)]
    pub form_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub prize_amount_raw: Option<String>,
    #[serde(default)]
    pub prize_parsed: Option<ParsedAmount>,
    #[serde(default)]
    pub prize_details: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_by: Option<String>,
    /// Canonical notification to edit later; for prize tickets this is the
    /// details message rather than the opening message.
    #[serde(default)]
    pub respond_message_id: Option<String>,
    #[serde(default)]
    pub confirm_message_id: Option<String>,
    #[serde(default)]
    pub control_message_id: Option<String>,
}

impl TicketMetadata {
    pub fn open_name(&self) -> String {
        format!("{}-{:04}", self.prefix, self.ticket_id)
    }

    pub fn closed_name(&self) -> String {
        format!("closed-{:04}", self.ticket_id)
    }

    pub fn current_name(&self) -> String {
        if self.closed {
            self.closed_name()
        } else {
            self.open_name()
        }
    }

    pub fn prize_display(&self) -> String {
        if let Some(parsed) = &self.prize_parsed {
            parsed.display.clone()
        } else if let Some(raw) = &self.prize_amount_raw {
            raw.clone()
        } else {
            "[prize amount]".to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedAttachment {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedMessage {
    pub id: String,
    pub author_id: String,
    pub author_tag: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<SavedAttachment>,
}

/// Immutable snapshot written at archival time; survives channel destruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketArchive {
    pub org_id: String,
    pub ticket_id: u64,
    pub option_id: String,
    pub label: String,
    pub owner_id: String,
    pub is_prize: bool,
    #[serde(default)]
    pub prize_amount_raw: Option<String>,
    #[serde(default)]
    pub prize_parsed: Option<ParsedAmount>,
    #[serde(default)]
    pub prize_details: Option<String>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub closed_by: Option<String>,
    pub messages: Vec<ArchivedMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prize_option_gains_amount_field() {
        let opt = TicketOption {
            id: "prize".to_string(),
            label: "Prize".to_string(),
            description: String::new(),
            prefix: "PRZ".to_string(),
            is_prize: true,
            form: vec![FormField::new(
                SUMMARY_FIELD,
                "Summary",
                FieldStyle::Paragraph,
                true,
            )],
            response_template: None,
            response_use_embed: false,
        };
        let fields = opt.effective_form();
        assert!(fields.iter().any(|f| f.id == PRIZE_AMOUNT_FIELD));
        assert!(fields.iter().find(|f| f.id == PRIZE_AMOUNT_FIELD).map(|f| f.required) == Some(true));
    }

    #[test]
    fn blank_prefix_falls_back_to_option_id() {
        let mut opt = OrganizationConfig::default_template().options[1].clone();
        opt.prefix = "  ".to_string();
        assert_eq!(opt.name_prefix(), "other");
    }

    #[test]
    fn ticket_naming() {
        let meta = TicketMetadata {
            ticket_id: 7,
            channel_id: "1".to_string(),
            option_id: "other".to_string(),
            label: "Other".to_string(),
            prefix: "OTH".to_string(),
            is_prize: false,
            owner_id: "2".to_string(),
            summary: String::new(),
            form_values: BTreeMap::new(),
            form_labels: BTreeMap::new(),
            prize_amount_raw: None,
            prize_parsed: None,
            prize_details: None,
            created_at: Utc::now(),
            closed: false,
            closed_at: None,
            closed_by: None,
            respond_message_id: None,
            confirm_message_id: None,
            control_message_id: None,
        };
        assert_eq!(meta.open_name(), "OTH-0007");
        assert_eq!(meta.closed_name(), "closed-0007");
    }

    #[test]
    fn config_roundtrip() {
        let cfg = OrganizationConfig::default_template();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: OrganizationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.options.len(), 2);
        assert_eq!(back.ticket_counter, 0);
    }
}
