use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form post / response properties.
pub type Props = Map<String, Value>;

/// Longest message a single post may carry, in runes.
pub const POST_MESSAGE_MAX_RUNES: usize = 16383;
pub const POST_PROPS_MAX_RUNES: usize = 800_000;
/// Budget for user-supplied props; the rest is left for server-side additions.
pub const POST_PROPS_MAX_USER_RUNES: usize = POST_PROPS_MAX_RUNES - 400_000;

pub const POST_SYSTEM_MESSAGE_PREFIX: &str = "system_";
pub const POST_SLACK_ATTACHMENT: &str = "slack_attachment";

pub const DEFAULT_CHANNEL: &str = "town-square";
pub const DEFAULT_WEBHOOK_USERNAME: &str = "webhook";

pub const SYSTEM_ADMIN_ROLE: &str = "system_admin";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_AWAY: &str = "away";
pub const STATUS_OFFLINE: &str = "offline";
pub const STATUS_DND: &str = "dnd";

/// Command webhooks stop resolving 30 minutes after creation.
pub const COMMAND_WEBHOOK_LIFETIME_MS: i64 = 30 * 60 * 1000;
/// A command webhook may be posted to at most this many times.
pub const COMMAND_WEBHOOK_MAX_USES: i32 = 5;

pub const COMMAND_TRIGGER_MAX_LEN: usize = 128;

// -- Users, teams, channels --

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub create_at: i64,
    pub update_at: i64,
    pub delete_at: i64,
    pub username: String,
    pub email: String,
    pub nickname: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
    /// Space separated role names.
    pub roles: String,
    pub locale: String,
    pub is_bot: bool,
    pub notify_props: HashMap<String, String>,
    pub props: HashMap<String, String>,
}

/// User prop holding the JSON-encoded [`CustomStatus`].
pub const USER_PROP_CUSTOM_STATUS: &str = "customStatus";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Team {
    pub id: String,
    pub create_at: i64,
    pub delete_at: i64,
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub team_type: String,
    pub description: String,
    pub allow_open_invite: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    #[default]
    #[serde(rename = "O")]
    Open,
    #[serde(rename = "P")]
    Private,
    #[serde(rename = "D")]
    Direct,
    #[serde(rename = "G")]
    Group,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "O",
            Self::Private => "P",
            Self::Direct => "D",
            Self::Group => "G",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub id: String,
    pub create_at: i64,
    pub delete_at: i64,
    pub team_id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: String,
    pub display_name: String,
    pub header: String,
    pub purpose: String,
}

impl Channel {
    pub fn is_open(&self) -> bool {
        self.channel_type == ChannelType::Open
    }

    /// Name of the direct channel between two users; stable regardless of order.
    pub fn direct_channel_name(a: &str, b: &str) -> String {
        if a < b {
            format!("{}__{}", a, b)
        } else {
            format!("{}__{}", b, a)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMember {
    pub channel_id: String,
    pub user_id: String,
    pub roles: String,
    pub notify_props: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamMember {
    pub team_id: String,
    pub user_id: String,
    pub roles: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub user_id: String,
    pub status: String,
    pub manual: bool,
    pub last_activity_at: i64,
}

impl Status {
    pub fn offline(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: STATUS_OFFLINE.to_string(),
            manual: false,
            last_activity_at: 0,
        }
    }
}

/// A user's custom status (emoji + text) stored in user props.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomStatus {
    pub emoji: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileInfo {
    pub id: String,
    pub post_id: String,
    pub creator_id: String,
    pub path: String,
    pub name: String,
    pub size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reaction {
    pub user_id: String,
    pub post_id: String,
    pub emoji_name: String,
    pub create_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Emoji {
    pub id: String,
    pub create_at: i64,
    pub delete_at: i64,
    pub creator_id: String,
    pub name: String,
}

// -- Sessions --

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub id: String,
    pub token: String,
    pub user_id: String,
    pub create_at: i64,
    /// Milliseconds since the epoch; 0 means the session never expires.
    pub expires_at: i64,
    pub roles: Vec<String>,
    pub team_members: Vec<TeamMember>,
    pub csrf_token: String,
    pub props: HashMap<String, String>,
}

impl Session {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at > 0 && self.expires_at <= now_ms
    }

    pub fn is_system_admin(&self) -> bool {
        self.roles.iter().any(|r| r == SYSTEM_ADMIN_ROLE)
    }

    pub fn is_guest(&self) -> bool {
        self.props.get("is_guest").map(String::as_str) == Some("true")
    }

    pub fn team_member(&self, team_id: &str) -> Option<&TeamMember> {
        self.team_members.iter().find(|m| m.team_id == team_id)
    }
}

// -- Posts --

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Post {
    pub id: String,
    pub create_at: i64,
    pub update_at: i64,
    pub delete_at: i64,
    pub user_id: String,
    pub channel_id: String,
    pub root_id: String,
    pub parent_id: String,
    pub message: String,
    #[serde(rename = "type")]
    pub post_type: String,
    pub props: Props,
    pub file_ids: Vec<String>,
    pub has_reactions: bool,
}

impl Post {
    pub fn add_prop(&mut self, key: &str, value: impl Into<Value>) {
        self.props.insert(key.to_string(), value.into());
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    pub fn is_system_message(&self) -> bool {
        self.post_type.starts_with(POST_SYSTEM_MESSAGE_PREFIX)
    }

    /// Attachments stored under the `attachments` prop, if any parse.
    pub fn attachments(&self) -> Vec<SlackAttachment> {
        self.props
            .get("attachments")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackAttachment {
    #[serde(skip_serializing_if = "is_zero")]
    pub id: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fallback: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub color: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pretext: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author_link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author_icon: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title_link: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<SlackAttachmentField>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thumb_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub footer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub footer_icon: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub ts: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackAttachmentField {
    pub title: String,
    pub value: Value,
    pub short: bool,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

// -- Commands --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandMethod {
    #[default]
    #[serde(rename = "P")]
    Post,
    #[serde(rename = "G")]
    Get,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub id: String,
    pub token: String,
    pub create_at: i64,
    pub update_at: i64,
    pub delete_at: i64,
    pub creator_id: String,
    pub team_id: String,
    pub trigger: String,
    pub method: CommandMethod,
    pub username: String,
    pub icon_url: String,
    pub auto_complete: bool,
    pub auto_complete_desc: String,
    pub auto_complete_hint: String,
    pub display_name: String,
    pub description: String,
    pub url: String,
    pub plugin_id: String,
}

impl Command {
    /// Checks the fields a caller controls. Returns the offending field name.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.team_id.is_empty() {
            return Err("team_id");
        }
        if self.trigger.is_empty()
            || self.trigger.len() > COMMAND_TRIGGER_MAX_LEN
            || self.trigger.starts_with('/')
            || self.trigger.contains(char::is_whitespace)
        {
            return Err("trigger");
        }
        if self.plugin_id.is_empty() {
            if self.url.is_empty() || self.url.len() > 1024 {
                return Err("url");
            }
            if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
                return Err("url");
            }
        }
        if self.display_name.chars().count() > 64 {
            return Err("display_name");
        }
        if self.description.chars().count() > 128 {
            return Err("description");
        }
        Ok(())
    }

    /// Strip fields that must never reach a client listing.
    pub fn sanitize(&mut self) {
        self.token.clear();
        self.creator_id.clear();
        self.method = CommandMethod::default();
        self.url.clear();
        self.username.clear();
        self.icon_url.clear();
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_at != 0
    }
}

/// Request-scoped arguments of one slash-command invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandArgs {
    pub command: String,
    pub channel_id: String,
    pub team_id: String,
    pub user_id: String,
    pub root_id: String,
    pub parent_id: String,
    pub trigger_id: String,
    pub site_url: String,
    pub locale: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
    #[default]
    Unspecified,
    InChannel,
    Ephemeral,
}

impl From<String> for ResponseType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "in_channel" => Self::InChannel,
            "ephemeral" => Self::Ephemeral,
            _ => Self::Unspecified,
        }
    }
}

impl From<ResponseType> for String {
    fn from(value: ResponseType) -> Self {
        match value {
            ResponseType::Unspecified => String::new(),
            ResponseType::InChannel => "in_channel".to_string(),
            ResponseType::Ephemeral => "ephemeral".to_string(),
        }
    }
}

impl Serialize for ResponseType {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from(*self))
    }
}

impl<'de> Deserialize<'de> for ResponseType {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.map(Self::from).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandResponse {
    pub response_type: ResponseType,
    pub text: String,
    pub username: String,
    #[serde(alias = "override_channel_id")]
    pub channel_id: String,
    pub icon_url: String,
    #[serde(rename = "type")]
    pub post_type: String,
    pub props: Props,
    pub goto_location: String,
    pub trigger_id: String,
    pub skip_slack_parsing: bool,
    pub attachments: Vec<SlackAttachment>,
    pub extra_responses: Vec<CommandResponse>,
}

impl CommandResponse {
    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Ephemeral,
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn in_channel(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::InChannel,
            text: text.into(),
            ..Default::default()
        }
    }

    /// Parse an HTTP response body according to its content type.
    /// JSON bodies that fail to parse yield `None`; anything else is plain text.
    pub fn from_http_body(content_type: &str, body: &[u8]) -> Option<Self> {
        if content_type.starts_with("application/json") {
            return Self::from_json(body);
        }
        let text = String::from_utf8_lossy(body).into_owned();
        Some(Self::from_plain_text(text))
    }

    pub fn from_plain_text(text: String) -> Self {
        Self {
            text,
            ..Default::default()
        }
    }

    pub fn from_json(body: &[u8]) -> Option<Self> {
        let mut response: CommandResponse = serde_json::from_slice(body).ok()?;
        response.normalize();
        Some(response)
    }

    fn normalize(&mut self) {
        stringify_field_values(&mut self.attachments);
        for extra in &mut self.extra_responses {
            extra.normalize();
        }
    }
}

/// Slack allows numbers and booleans as field values; downstream renders strings only.
pub fn stringify_field_values(attachments: &mut [SlackAttachment]) {
    for attachment in attachments {
        for field in &mut attachment.fields {
            field.value = match std::mem::take(&mut field.value) {
                Value::String(s) => Value::String(s),
                Value::Null => Value::String(String::new()),
                other => Value::String(other.to_string()),
            };
        }
    }
}

// -- Webhooks --

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingWebhook {
    pub id: String,
    pub create_at: i64,
    pub update_at: i64,
    pub delete_at: i64,
    pub user_id: String,
    pub channel_id: String,
    pub team_id: String,
    pub display_name: String,
    pub description: String,
    pub username: String,
    pub icon_url: String,
    pub channel_locked: bool,
}

/// When an outgoing webhook fires relative to its trigger words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum TriggerWhen {
    #[default]
    Exact,
    StartsWith,
}

impl From<i32> for TriggerWhen {
    fn from(value: i32) -> Self {
        if value == 1 { Self::StartsWith } else { Self::Exact }
    }
}

impl From<TriggerWhen> for i32 {
    fn from(value: TriggerWhen) -> Self {
        match value {
            TriggerWhen::Exact => 0,
            TriggerWhen::StartsWith => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutgoingWebhook {
    pub id: String,
    pub token: String,
    pub create_at: i64,
    pub update_at: i64,
    pub delete_at: i64,
    pub creator_id: String,
    pub channel_id: String,
    pub team_id: String,
    pub trigger_words: Vec<String>,
    pub trigger_when: TriggerWhen,
    pub callback_urls: Vec<String>,
    pub display_name: String,
    pub description: String,
    pub content_type: String,
    pub username: String,
    pub icon_url: String,
}

impl OutgoingWebhook {
    pub fn trigger_word_exact_match(&self, word: &str) -> bool {
        !word.is_empty() && self.trigger_words.iter().any(|t| t == word)
    }

    pub fn trigger_word_starts_with(&self, word: &str) -> bool {
        !word.is_empty()
            && self
                .trigger_words
                .iter()
                .any(|t| !t.is_empty() && word.starts_with(t.as_str()))
    }

    /// The trigger word that matched `word`, if any.
    pub fn trigger_word(&self, word: &str, exact: bool) -> Option<&str> {
        self.trigger_words
            .iter()
            .find(|t| {
                if exact {
                    t.as_str() == word
                } else {
                    !t.is_empty() && word.starts_with(t.as_str())
                }
            })
            .map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.team_id.is_empty() {
            return Err("team_id");
        }
        if self.callback_urls.is_empty() {
            return Err("callback_urls");
        }
        for url in &self.callback_urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err("callback_urls");
            }
        }
        if self.trigger_words.iter().any(|w| w.is_empty()) {
            return Err("trigger_words");
        }
        if !self.content_type.is_empty()
            && self.content_type != "application/json"
            && self.content_type != "application/x-www-form-urlencoded"
        {
            return Err("content_type");
        }
        Ok(())
    }
}

/// One-shot callback handed to a custom slash command as `response_url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandWebhook {
    pub id: String,
    pub create_at: i64,
    pub command_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub root_id: String,
    pub parent_id: String,
    pub use_count: i32,
}

impl CommandWebhook {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.create_at + COMMAND_WEBHOOK_LIFETIME_MS <= now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_type_round_trips_through_strings() {
        let resp: CommandResponse =
            serde_json::from_value(json!({"response_type": "in_channel", "text": "hi"})).unwrap();
        assert_eq!(resp.response_type, ResponseType::InChannel);

        let resp: CommandResponse =
            serde_json::from_value(json!({"response_type": "bogus"})).unwrap();
        assert_eq!(resp.response_type, ResponseType::Unspecified);

        let out = serde_json::to_value(CommandResponse::ephemeral("x")).unwrap();
        assert_eq!(out["response_type"], "ephemeral");
    }

    #[test]
    fn override_channel_id_is_accepted() {
        let resp = CommandResponse::from_json(br#"{"override_channel_id":"abc"}"#).unwrap();
        assert_eq!(resp.channel_id, "abc");
    }

    #[test]
    fn http_body_parsing_follows_content_type() {
        let json = CommandResponse::from_http_body("application/json; charset=utf-8", br#"{"text":"a"}"#);
        assert_eq!(json.unwrap().text, "a");

        assert!(CommandResponse::from_http_body("application/json", b"not json").is_none());

        let plain = CommandResponse::from_http_body("text/plain", b"hello").unwrap();
        assert_eq!(plain.text, "hello");
        assert_eq!(plain.response_type, ResponseType::Unspecified);
    }

    #[test]
    fn field_values_become_strings() {
        let resp = CommandResponse::from_json(
            br#"{"attachments":[{"fields":[{"title":"n","value":3},{"title":"b","value":true}]}]}"#,
        )
        .unwrap();
        let fields = &resp.attachments[0].fields;
        assert_eq!(fields[0].value, json!("3"));
        assert_eq!(fields[1].value, json!("true"));
    }

    #[test]
    fn command_method_uses_single_letters() {
        let cmd: Command = serde_json::from_value(json!({"method": "G"})).unwrap();
        assert_eq!(cmd.method, CommandMethod::Get);
        assert_eq!(serde_json::to_value(CommandMethod::Post).unwrap(), json!("P"));
    }

    #[test]
    fn command_validation() {
        let mut cmd = Command {
            team_id: "t".into(),
            trigger: "jira".into(),
            url: "https://jira.example/hook".into(),
            ..Default::default()
        };
        assert!(cmd.validate().is_ok());

        cmd.trigger = "/jira".into();
        assert_eq!(cmd.validate(), Err("trigger"));

        cmd.trigger = "ji ra".into();
        assert_eq!(cmd.validate(), Err("trigger"));

        cmd.trigger = "jira".into();
        cmd.url = "ftp://nope".into();
        assert_eq!(cmd.validate(), Err("url"));

        cmd.url.clear();
        cmd.plugin_id = "com.example.jira".into();
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn trigger_word_matching() {
        let hook = OutgoingWebhook {
            trigger_words: vec!["deploy".into(), "ship".into()],
            ..Default::default()
        };
        assert!(hook.trigger_word_exact_match("deploy"));
        assert!(!hook.trigger_word_exact_match("deployment"));
        assert!(hook.trigger_word_starts_with("deployment"));
        assert!(!hook.trigger_word_starts_with(""));
        assert_eq!(hook.trigger_word("shipit", false), Some("ship"));
        assert_eq!(hook.trigger_word("shipit", true), None);
    }

    #[test]
    fn trigger_when_serializes_as_number() {
        let hook: OutgoingWebhook = serde_json::from_value(json!({"trigger_when": 1})).unwrap();
        assert_eq!(hook.trigger_when, TriggerWhen::StartsWith);
        assert_eq!(serde_json::to_value(TriggerWhen::Exact).unwrap(), json!(0));
    }

    #[test]
    fn session_helpers() {
        let mut session = Session {
            roles: vec!["system_user".into(), SYSTEM_ADMIN_ROLE.into()],
            expires_at: 1_000,
            ..Default::default()
        };
        assert!(session.is_system_admin());
        assert!(!session.is_guest());
        assert!(session.is_expired(1_000));
        assert!(!session.is_expired(999));

        session.props.insert("is_guest".into(), "true".into());
        assert!(session.is_guest());
    }

    #[test]
    fn direct_channel_name_is_order_independent() {
        assert_eq!(
            Channel::direct_channel_name("b", "a"),
            Channel::direct_channel_name("a", "b")
        );
    }
}
