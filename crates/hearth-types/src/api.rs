//! Wire payloads exchanged with external HTTP integrations.

use serde::{Deserialize, Serialize};
use crate::models::{Props, SlackAttachment};

/// Body of `POST /hooks/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingWebhookRequest {
    pub text: String,
    pub username: String,
    pub icon_url: String,
    pub channel: String,
    pub props: Props,
    pub attachments: Vec<SlackAttachment>,
    #[serde(rename = "type")]
    pub post_type: String,
    pub icon_emoji: String,
}

impl IncomingWebhookRequest {
    /// Accepts JSON, or a form body carrying JSON in its `payload` field.
    pub fn parse(content_type: &str, body: &[u8]) -> Option<Self> {
        if content_type.starts_with("application/x-www-form-urlencoded") {
            let payload = form_urlencoded_value(body, "payload")?;
            return serde_json::from_str(&payload).ok();
        }
        serde_json::from_slice(body).ok()
    }
}

/// Value of `key` in an `application/x-www-form-urlencoded` body.
pub fn form_urlencoded_value(body: &[u8], key: &str) -> Option<String> {
    url::form_urlencoded::parse(body)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Request body an outgoing webhook sends to each callback URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutgoingWebhookPayload {
    pub token: String,
    pub team_id: String,
    pub team_domain: String,
    pub channel_id: String,
    pub channel_name: String,
    pub timestamp: i64,
    pub user_id: String,
    pub user_name: String,
    pub post_id: String,
    pub text: String,
    pub trigger_word: String,
    pub file_ids: String,
}

impl OutgoingWebhookPayload {
    pub fn to_form_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("token", self.token.clone()),
            ("team_id", self.team_id.clone()),
            ("team_domain", self.team_domain.clone()),
            ("channel_id", self.channel_id.clone()),
            ("channel_name", self.channel_name.clone()),
            ("timestamp", self.timestamp.to_string()),
            ("user_id", self.user_id.clone()),
            ("user_name", self.user_name.clone()),
            ("post_id", self.post_id.clone()),
            ("text", self.text.clone()),
            ("trigger_word", self.trigger_word.clone()),
            ("file_ids", self.file_ids.clone()),
        ]
    }
}

/// What a callback URL may answer with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutgoingWebhookResponse {
    pub text: Option<String>,
    pub username: String,
    pub icon_url: String,
    pub props: Props,
    pub attachments: Vec<SlackAttachment>,
    #[serde(rename = "type")]
    pub post_type: String,
    pub response_type: String,
}

pub const OUTGOING_HOOK_RESPONSE_TYPE_COMMENT: &str = "comment";

/// Body of `POST /api/v4/commands/execute`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteCommandRequest {
    pub command: String,
    pub channel_id: String,
    pub team_id: String,
    pub root_id: String,
    pub parent_id: String,
}

/// JWT claims of a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Session id.
    pub sid: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub teams: Vec<String>,
    #[serde(default)]
    pub csrf: String,
    #[serde(default)]
    pub guest: bool,
    /// Seconds since the epoch.
    pub exp: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_request_from_json() {
        let req = IncomingWebhookRequest::parse(
            "application/json",
            br##"{"text":"hi","channel":"#general","type":"custom_x"}"##,
        )
        .unwrap();
        assert_eq!(req.text, "hi");
        assert_eq!(req.channel, "#general");
        assert_eq!(req.post_type, "custom_x");
    }

    #[test]
    fn incoming_request_from_form_payload() {
        let body = b"payload=%7B%22text%22%3A%22a+b%22%7D";
        let req = IncomingWebhookRequest::parse("application/x-www-form-urlencoded", body).unwrap();
        assert_eq!(req.text, "a b");
    }

    #[test]
    fn form_value_missing_key() {
        assert_eq!(form_urlencoded_value(b"a=1&b=2", "c"), None);
        assert_eq!(form_urlencoded_value(b"a=1&b=2", "b").as_deref(), Some("2"));
    }

    #[test]
    fn outgoing_response_text_is_optional() {
        let resp: OutgoingWebhookResponse = serde_json::from_str(r#"{"response_type":"comment"}"#).unwrap();
        assert!(resp.text.is_none());
        assert_eq!(resp.response_type, OUTGOING_HOOK_RESPONSE_TYPE_COMMENT);
    }
}
