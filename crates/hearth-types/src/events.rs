use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Event names ──

pub const EVENT_TYPING: &str = "typing";
pub const EVENT_POSTED: &str = "posted";
pub const EVENT_EPHEMERAL_MESSAGE: &str = "ephemeral_message";
pub const EVENT_STATUS_CHANGE: &str = "status_change";
pub const EVENT_CHANNEL_VIEWED: &str = "channel_viewed";
pub const EVENT_USER_UPDATED: &str = "user_updated";
pub const EVENT_NEW_USER: &str = "new_user";
pub const EVENT_HELLO: &str = "hello";

// ── Websocket actions ──

pub const ACTION_AUTHENTICATION_CHALLENGE: &str = "authentication_challenge";
pub const ACTION_USER_TYPING: &str = "user_typing";
pub const ACTION_GET_STATUSES_BY_IDS: &str = "get_statuses_by_ids";
pub const ACTION_PING: &str = "ping";

pub const STATUS_OK: &str = "OK";
pub const STATUS_FAIL: &str = "FAIL";

/// Events that may be dropped when a connection's queue is backing up.
pub fn is_droppable_event(event: &str) -> bool {
    matches!(event, EVENT_TYPING | EVENT_STATUS_CHANGE | EVENT_CHANNEL_VIEWED)
}

/// Routing metadata that decides which connections receive an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Broadcast {
    pub omit_users: Option<std::collections::HashMap<String, bool>>,
    pub user_id: String,
    pub channel_id: String,
    pub team_id: String,
    #[serde(skip)]
    pub contains_sanitized_data: bool,
    #[serde(skip)]
    pub contains_sensitive_data: bool,
}

impl Broadcast {
    pub fn is_omitted(&self, user_id: &str) -> bool {
        self.omit_users
            .as_ref()
            .is_some_and(|m| m.get(user_id).copied().unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketEvent {
    pub event: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub broadcast: Broadcast,
    #[serde(default)]
    pub seq: i64,
}

impl WebSocketEvent {
    pub fn new(event: &str, team_id: &str, channel_id: &str, user_id: &str) -> Self {
        Self {
            event: event.to_string(),
            data: Map::new(),
            broadcast: Broadcast {
                user_id: user_id.to_string(),
                channel_id: channel_id.to_string(),
                team_id: team_id.to_string(),
                ..Default::default()
            },
            seq: 0,
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn omit_user(mut self, user_id: &str) -> Self {
        self.broadcast
            .omit_users
            .get_or_insert_with(Default::default)
            .insert(user_id.to_string(), true);
        self
    }

    /// Serialize with the given per-connection sequence without cloning the event.
    pub fn to_json_with_seq(&self, seq: i64) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Wire<'a> {
            event: &'a str,
            data: &'a Map<String, Value>,
            broadcast: &'a Broadcast,
            seq: i64,
        }
        serde_json::to_string(&Wire {
            event: &self.event,
            data: &self.data,
            broadcast: &self.broadcast,
            seq,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketRequest {
    pub seq: i64,
    pub action: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketError {
    pub id: String,
    pub message: String,
    pub status_code: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq_reply: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WebSocketError>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl WebSocketResponse {
    pub fn ok(seq_reply: i64, data: Option<Map<String, Value>>) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            seq_reply,
            data,
            error: None,
        }
    }

    pub fn error(seq_reply: i64, id: &str, message: &str, status_code: u16) -> Self {
        Self {
            status: STATUS_FAIL.to_string(),
            seq_reply,
            data: None,
            error: Some(WebSocketError {
                id: id.to_string(),
                message: message.to_string(),
                status_code,
            }),
        }
    }
}

/// What travels through a connection's send queue.
#[derive(Debug, Clone)]
pub enum WebSocketMessage {
    /// Broadcast event; filtered and sequence-stamped by the writer.
    Event(Arc<WebSocketEvent>),
    /// Reply to a client request; written as-is.
    Response(WebSocketResponse),
}

impl WebSocketMessage {
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Self::Event(ev) => Some(&ev.event),
            Self::Response(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_stamped_on_serialize() {
        let ev = WebSocketEvent::new(EVENT_POSTED, "", "c1", "").with_data("post", "{}");
        let json: Value = serde_json::from_str(&ev.to_json_with_seq(7).unwrap()).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["event"], "posted");
        assert_eq!(json["broadcast"]["channel_id"], "c1");
        assert!(json["broadcast"].get("contains_sensitive_data").is_none());
    }

    #[test]
    fn omit_users() {
        let ev = WebSocketEvent::new(EVENT_TYPING, "", "c", "").omit_user("u1");
        assert!(ev.broadcast.is_omitted("u1"));
        assert!(!ev.broadcast.is_omitted("u2"));
    }

    #[test]
    fn droppable_events() {
        assert!(is_droppable_event(EVENT_TYPING));
        assert!(is_droppable_event(EVENT_STATUS_CHANGE));
        assert!(is_droppable_event(EVENT_CHANNEL_VIEWED));
        assert!(!is_droppable_event(EVENT_POSTED));
    }

    #[test]
    fn response_omits_empty_fields() {
        let json = serde_json::to_value(WebSocketResponse::ok(3, None)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "OK", "seq_reply": 3}));
    }
}
