//! Discord REST adapter for [`ChatTransport`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{
    ChannelAccess, ChatTransport, Control, ControlStyle, CreateChannelSpec, HistoryMessage,
    NewChannelAccess, OutboundMessage, Privilege, TransportError,
};

const VIEW_CHANNEL: u64 = 1 << 10;
const SEND_MESSAGES: u64 = 1 << 11;
const READ_MESSAGE_HISTORY: u64 = 1 << 16;
const ADMINISTRATOR: u64 = 1 << 3;
const MANAGE_GUILD: u64 = 1 << 5;

const OVERWRITE_ROLE: u8 = 0;
const OVERWRITE_MEMBER: u8 = 1;

const GUILD_TEXT: u8 = 0;

pub struct DiscordTransport {
    client: RwLock<reqwest::Client>,
    base_url: String,
    bot_token: String,
}

impl DiscordTransport {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            client: RwLock::new(reqwest::Client::new()),
            base_url: "https://discord.com/api/v10".to_string(),
            bot_token: bot_token.into(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    async fn client(&self) -> reqwest::Client {
        self.client.read().await.clone()
    }

    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(TransportError::RateLimited { retry_after });
        }

        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        Err(Self::classify_error(status, error_text))
    }

    /// Map an error body to the taxonomy the engine recovers from:
    /// stale-interaction errors trigger the reconnect safeguard, unknown
    /// resources are non-retriable, everything else is a plain API error.
    fn classify_error(status: reqwest::StatusCode, body: String) -> TransportError {
        let code = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .map(|b| b.code)
            .unwrap_or(0);

        match code {
            10062 | 40060 => TransportError::StaleInteraction(body),
            10003 | 10008 => TransportError::NotFound(body),
            _ if body.contains("Unknown interaction") => TransportError::StaleInteraction(body),
            _ if status.as_u16() == 401 || status.as_u16() == 403 => {
                TransportError::AuthenticationFailed(body)
            }
            _ if status.as_u16() == 404 => TransportError::NotFound(body),
            _ => TransportError::Api {
                code: Some(status.to_string()),
                message: body,
            },
        }
    }

    fn build_components(message: &OutboundMessage) -> Option<Vec<ApiActionRow>> {
        let mut rows = Vec::new();
        if let Some(menu) = &message.menu {
            rows.push(ApiActionRow {
                kind: 1,
                components: vec![ApiComponent::Select(ApiSelect {
                    kind: 3,
                    custom_id: menu.custom_id.clone(),
                    placeholder: menu.placeholder.clone(),
                    options: menu
                        .options
                        .iter()
                        .map(|o| ApiSelectOption {
                            label: o.label.clone(),
                            value: o.value.clone(),
                            description: o.description.clone(),
                        })
                        .collect(),
                })],
            });
        }
        if !message.controls.is_empty() {
            rows.push(ApiActionRow {
                kind: 1,
                components: message.controls.iter().map(ApiComponent::button).collect(),
            });
        }

        if rows.is_empty() {
            if message.clear_controls {
                Some(Vec::new())
            } else {
                None
            }
        } else {
            Some(rows)
        }
    }

    fn build_payload(message: &OutboundMessage) -> ApiMessagePayload {
        ApiMessagePayload {
            content: message.content.clone(),
            embeds: message.embed.as_ref().map(|e| vec![ApiEmbed::from(e)]),
            components: Self::build_components(message),
        }
    }

    async fn guild_roles(&self, guild_id: &str) -> Result<Vec<ApiRole>, TransportError> {
        let response = self
            .client()
            .await
            .get(format!("{}/guilds/{}/roles", self.base_url, guild_id))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Self::check_response(response)
            .await?
            .json::<Vec<ApiRole>>()
            .await
            .map_err(|e| TransportError::Api {
                code: None,
                message: e.to_string(),
            })
    }

    /// Non-managed roles granting management or administrator rights; used
    /// for staff-only channel overwrites.
    async fn privileged_roles(&self, guild_id: &str) -> Result<Vec<ApiRole>, TransportError> {
        let roles = self.guild_roles(guild_id).await?;
        Ok(roles
            .into_iter()
            .filter(|r| !r.managed && r.permission_bits() & (ADMINISTRATOR | MANAGE_GUILD) != 0)
            .collect())
    }

    async fn get_current_user(&self) -> Result<ApiUser, TransportError> {
        let response = self
            .client()
            .await
            .get(format!("{}/users/@me", self.base_url))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(TransportError::AuthenticationFailed(error_text));
        }

        response.json::<ApiUser>().await.map_err(|e| TransportError::Api {
            code: None,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl ChatTransport for DiscordTransport {
    async fn send_message(
        &self,
        channel_id: &str,
        message: &OutboundMessage,
    ) -> Result<String, TransportError> {
        let url = format!("{}/channels/{}/messages", self.base_url, channel_id);
        let payload = Self::build_payload(message);

        let request = self
            .client()
            .await
            .post(&url)
            .header("Authorization", self.auth_header());

        let response = if let Some(file) = &message.file {
            let payload_json =
                serde_json::to_string(&payload).map_err(|e| TransportError::Api {
                    code: None,
                    message: e.to_string(),
                })?;
            let form = reqwest::multipart::Form::new()
                .text("payload_json", payload_json)
                .part(
                    "files[0]",
                    reqwest::multipart::Part::bytes(file.bytes.clone())
                        .file_name(file.filename.clone()),
                );
            request.multipart(form).send().await
        } else {
            request.json(&payload).send().await
        }
        .map_err(|e| TransportError::Network(e.to_string()))?;

        let message: ApiMessage = Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Api {
                code: None,
                message: e.to_string(),
            })?;
        Ok(message.id)
    }

    async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, channel_id, message_id
        );
        let payload = Self::build_payload(message);
        let response = self
            .client()
            .await
            .patch(&url)
            .header("Authorization", self.auth_header())
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Option<HistoryMessage>, TransportError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, channel_id, message_id
        );
        let response = self
            .client()
            .await
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        match Self::check_response(response).await {
            Ok(response) => {
                let message: ApiMessage =
                    response.json().await.map_err(|e| TransportError::Api {
                        code: None,
                        message: e.to_string(),
                    })?;
                Ok(Some(message.into_history()))
            }
            Err(TransportError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<(), TransportError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.base_url, channel_id, message_id
        );
        let response = self
            .client()
            .await
            .delete(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn history_page(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: u8,
    ) -> Result<Vec<HistoryMessage>, TransportError> {
        let mut url = format!(
            "{}/channels/{}/messages?limit={}",
            self.base_url, channel_id, limit
        );
        if let Some(before) = before {
            url.push_str(&format!("&before={before}"));
        }
        let response = self
            .client()
            .await
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let messages: Vec<ApiMessage> = Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Api {
                code: None,
                message: e.to_string(),
            })?;
        Ok(messages.into_iter().map(ApiMessage::into_history).collect())
    }

    async fn create_channel(
        &self,
        org_id: &str,
        spec: &CreateChannelSpec,
    ) -> Result<String, TransportError> {
        let mut overwrites = vec![ApiOverwrite {
            // @everyone shares the guild id.
            id: org_id.to_string(),
            kind: OVERWRITE_ROLE,
            allow: "0".to_string(),
            deny: VIEW_CHANNEL.to_string(),
        }];

        match &spec.access {
            NewChannelAccess::OwnerOnly { owner_id } => {
                overwrites.push(ApiOverwrite {
                    id: owner_id.clone(),
                    kind: OVERWRITE_MEMBER,
                    allow: (VIEW_CHANNEL | SEND_MESSAGES | READ_MESSAGE_HISTORY).to_string(),
                    deny: "0".to_string(),
                });
            }
            NewChannelAccess::PrivilegedOnly => {
                for role in self.privileged_roles(org_id).await? {
                    overwrites.push(ApiOverwrite {
                        id: role.id,
                        kind: OVERWRITE_ROLE,
                        allow: (VIEW_CHANNEL | READ_MESSAGE_HISTORY).to_string(),
                        deny: "0".to_string(),
                    });
                }
            }
        }

        let body = ApiCreateChannel {
            name: spec.name.clone(),
            kind: GUILD_TEXT,
            parent_id: spec.category_id.clone(),
            permission_overwrites: overwrites,
        };

        let response = self
            .client()
            .await
            .post(format!("{}/guilds/{}/channels", self.base_url, org_id))
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let channel: ApiChannel = Self::check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Api {
                code: None,
                message: e.to_string(),
            })?;
        Ok(channel.id)
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<(), TransportError> {
        let response = self
            .client()
            .await
            .patch(format!("{}/channels/{}", self.base_url, channel_id))
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn delete_channel(
        &self,
        channel_id: &str,
        reason: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .client()
            .await
            .delete(format!("{}/channels/{}", self.base_url, channel_id))
            .header("Authorization", self.auth_header())
            .header("X-Audit-Log-Reason", reason)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn set_member_access(
        &self,
        channel_id: &str,
        user_id: &str,
        access: ChannelAccess,
    ) -> Result<(), TransportError> {
        let mut allow = 0u64;
        let mut deny = 0u64;
        for (granted, bit) in [
            (access.view, VIEW_CHANNEL),
            (access.send, SEND_MESSAGES),
            (access.history, READ_MESSAGE_HISTORY),
        ] {
            if granted {
                allow |= bit;
            } else {
                deny |= bit;
            }
        }

        let response = self
            .client()
            .await
            .put(format!(
                "{}/channels/{}/permissions/{}",
                self.base_url, channel_id, user_id
            ))
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({
                "type": OVERWRITE_MEMBER,
                "allow": allow.to_string(),
                "deny": deny.to_string(),
            }))
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Self::check_response(response).await?;
        Ok(())
    }

    async fn member_has_privilege(
        &self,
        org_id: &str,
        user_id: &str,
        privilege: Privilege,
    ) -> Result<bool, TransportError> {
        let response = self
            .client()
            .await
            .get(format!(
                "{}/guilds/{}/members/{}",
                self.base_url, org_id, user_id
            ))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let member: ApiMember = match Self::check_response(response).await {
            Ok(response) => response.json().await.map_err(|e| TransportError::Api {
                code: None,
                message: e.to_string(),
            })?,
            Err(TransportError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let roles = self.guild_roles(org_id).await?;
        let mut permissions = 0u64;
        for role in &roles {
            // The @everyone role applies to every member.
            if role.id == org_id || member.roles.contains(&role.id) {
                permissions |= role.permission_bits();
            }
        }

        if permissions & ADMINISTRATOR != 0 {
            return Ok(true);
        }
        Ok(match privilege {
            Privilege::Admin => false,
            Privilege::Manage => permissions & MANAGE_GUILD != 0,
        })
    }

    /// The REST transport holds no session, so a reconnect rebuilds the
    /// connection pool and re-validates the token.
    async fn reconnect(&self) -> Result<(), TransportError> {
        {
            let mut client = self.client.write().await;
            *client = reqwest::Client::new();
        }
        let user = self.get_current_user().await?;
        warn!("transport reconnected as {}", user.tag());
        Ok(())
    }
}

// ---- wire types ----

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: u32,
}

#[derive(Debug, Serialize)]
struct ApiMessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embeds: Option<Vec<ApiEmbed>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    components: Option<Vec<ApiActionRow>>,
}

#[derive(Debug, Serialize)]
struct ApiActionRow {
    #[serde(rename = "type")]
    kind: u8,
    components: Vec<ApiComponent>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiComponent {
    Button(ApiButton),
    Select(ApiSelect),
}

impl ApiComponent {
    fn button(control: &Control) -> Self {
        Self::Button(ApiButton {
            kind: 2,
            style: match control.style {
                ControlStyle::Primary => 1,
                ControlStyle::Secondary => 2,
                ControlStyle::Success => 3,
                ControlStyle::Danger => 4,
            },
            label: control.label.clone(),
            custom_id: control.custom_id.clone(),
            emoji: control
                .emoji
                .as_ref()
                .map(|name| ApiEmoji { name: name.clone() }),
            disabled: control.disabled,
        })
    }
}

#[derive(Debug, Serialize)]
struct ApiButton {
    #[serde(rename = "type")]
    kind: u8,
    style: u8,
    label: String,
    custom_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    emoji: Option<ApiEmoji>,
    disabled: bool,
}

#[derive(Debug, Serialize)]
struct ApiEmoji {
    name: String,
}

#[derive(Debug, Serialize)]
struct ApiSelect {
    #[serde(rename = "type")]
    kind: u8,
    custom_id: String,
    placeholder: String,
    options: Vec<ApiSelectOption>,
}

#[derive(Debug, Serialize)]
struct ApiSelectOption {
    label: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiEmbed {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<ApiEmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<ApiEmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

impl From<&super::Embed> for ApiEmbed {
    fn from(embed: &super::Embed) -> Self {
        Self {
            title: embed.title.clone(),
            description: embed.description.clone(),
            color: embed.color,
            fields: embed
                .fields
                .iter()
                .map(|f| ApiEmbedField {
                    name: f.name.clone(),
                    value: f.value.clone(),
                    inline: false,
                })
                .collect(),
            footer: embed
                .footer
                .as_ref()
                .map(|text| ApiEmbedFooter { text: text.clone() }),
            timestamp: embed.timestamp.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiEmbedField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct ApiEmbedFooter {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: String,
    author: Option<ApiUser>,
    #[serde(default)]
    attachments: Vec<ApiAttachment>,
}

impl ApiMessage {
    fn into_history(self) -> HistoryMessage {
        let created_at = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let author = self.author.unwrap_or(ApiUser {
            id: String::new(),
            username: "unknown".to_string(),
            discriminator: "0".to_string(),
            bot: false,
        });
        HistoryMessage {
            id: self.id,
            author: super::Author {
                id: author.id.clone(),
                tag: author.tag(),
                bot: author.bot,
            },
            content: self.content,
            created_at,
            attachments: self
                .attachments
                .into_iter()
                .map(|a| super::AttachmentRef {
                    filename: a.filename,
                    url: a.url,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiAttachment {
    filename: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    #[serde(default)]
    discriminator: String,
    #[serde(default)]
    bot: bool,
}

impl ApiUser {
    fn tag(&self) -> String {
        if self.discriminator.is_empty() || self.discriminator == "0" {
            self.username.clone()
        } else {
            format!("{}#{}", self.username, self.discriminator)
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiMember {
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRole {
    id: String,
    #[serde(default)]
    permissions: String,
    #[serde(default)]
    managed: bool,
}

impl ApiRole {
    fn permission_bits(&self) -> u64 {
        self.permissions.parse().unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
struct ApiCreateChannel {
    name: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    permission_overwrites: Vec<ApiOverwrite>,
}

#[derive(Debug, Serialize)]
struct ApiOverwrite {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    allow: String,
    deny: String,
}

#[derive(Debug, Deserialize)]
struct ApiChannel {
    id: String,
}
