use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use hearth_types::events::{
    ACTION_AUTHENTICATION_CHALLENGE, ACTION_GET_STATUSES_BY_IDS, ACTION_PING, ACTION_USER_TYPING,
    EVENT_HELLO, EVENT_TYPING, WebSocketEvent, WebSocketMessage, WebSocketRequest,
    WebSocketResponse,
};
use hearth_types::models::{STATUS_OFFLINE, Session};
use hearth_types::now_millis;

use crate::connection::{ConnContext, WebConn};
use crate::presence;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Failure of a websocket action, reported back in the response envelope.
struct ActionError {
    id: &'static str,
    message: String,
    status_code: u16,
}

impl ActionError {
    fn new(id: &'static str, message: impl Into<String>, status_code: u16) -> Self {
        Self {
            id,
            message: message.into(),
            status_code,
        }
    }

    fn invalid_param(name: &str) -> Self {
        Self::new(
            "api.websocket_handler.invalid_param.app_error",
            format!("invalid {} parameter", name),
            400,
        )
    }
}

type ActionResult = Result<Option<Map<String, Value>>, ActionError>;

/// Attach `session` to `conn`, register it with the hub and greet it.
pub async fn complete_authentication(ctx: &ConnContext, conn: &Arc<WebConn>, session: Session, token: String) -> bool {
    let user_id = session.user_id.clone();
    if !conn.authenticate(session, token) {
        return false;
    }
    ctx.hub.register(conn.clone()).await;
    presence::set_status_online(ctx.store.as_ref(), &ctx.hub, &user_id).await;

    let hello = WebSocketEvent::new(EVENT_HELLO, "", "", &user_id)
        .with_data("connection_id", conn.id.as_str())
        .with_data("server_version", SERVER_VERSION);
    ctx.hub
        .send_message(conn, WebSocketMessage::Event(Arc::new(hello)))
        .await;
    info!("conn {} authenticated as {}", conn.id, user_id);
    true
}

/// Dispatch one client request and enqueue the reply.
pub async fn route(ctx: &ConnContext, conn: &Arc<WebConn>, req: WebSocketRequest) {
    if req.action == ACTION_AUTHENTICATION_CHALLENGE {
        if conn.session.has_token() {
            return;
        }
        let result = authentication_challenge(ctx, conn, &req).await;
        reply(ctx, conn, req.seq, result).await;
        return;
    }

    if !conn.is_authenticated(ctx.gate.as_ref()).await {
        let err = ActionError::new(
            "api.web_socket_router.not_authenticated.app_error",
            "websocket request before authentication",
            401,
        );
        reply(ctx, conn, req.seq, Err(err)).await;
        return;
    }

    let result = match req.action.as_str() {
        ACTION_USER_TYPING => user_typing(ctx, conn, &req).await,
        ACTION_GET_STATUSES_BY_IDS => get_statuses_by_ids(ctx, &req).await,
        ACTION_PING => Ok(Some(ping())),
        other => {
            debug!("conn {} sent unknown action {}", conn.id, other);
            Err(ActionError::new(
                "api.web_socket_router.bad_action.app_error",
                format!("unknown action {}", other),
                501,
            ))
        }
    };
    reply(ctx, conn, req.seq, result).await;
}

async fn reply(ctx: &ConnContext, conn: &Arc<WebConn>, seq: i64, result: ActionResult) {
    let response = match result {
        Ok(data) => WebSocketResponse::ok(seq, data),
        Err(e) => WebSocketResponse::error(seq, e.id, &e.message, e.status_code),
    };
    ctx.hub
        .send_message(conn, WebSocketMessage::Response(response))
        .await;
}

async fn authentication_challenge(ctx: &ConnContext, conn: &Arc<WebConn>, req: &WebSocketRequest) -> ActionResult {
    let token = req
        .data
        .get("token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ActionError::invalid_param("token"))?;

    let session = ctx.gate.session(token).await.map_err(|e| {
        ActionError::new(
            "api.web_socket_router.bad_token.app_error",
            e.to_string(),
            e.status_code(),
        )
    })?;

    if !complete_authentication(ctx, conn, session, token.to_string()).await {
        return Err(ActionError::new(
            "api.web_socket_router.bad_token.app_error",
            "token belongs to another user",
            401,
        ));
    }
    Ok(None)
}

async fn user_typing(ctx: &ConnContext, conn: &Arc<WebConn>, req: &WebSocketRequest) -> ActionResult {
    let channel_id = req
        .data
        .get("channel_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ActionError::invalid_param("channel_id"))?;
    let parent_id = req
        .data
        .get("parent_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let user_id = conn.user_id().unwrap_or_default();

    ctx.store
        .get_channel_member(channel_id, user_id)
        .await
        .map_err(|_| {
            ActionError::new(
                "api.websocket_handler.user_typing.permissions.app_error",
                "not a member of the channel",
                403,
            )
        })?;

    let event = WebSocketEvent::new(EVENT_TYPING, "", channel_id, "")
        .with_data("parent_id", parent_id)
        .with_data("user_id", user_id)
        .omit_user(user_id);
    ctx.hub.publish(event).await;
    Ok(None)
}

async fn get_statuses_by_ids(ctx: &ConnContext, req: &WebSocketRequest) -> ActionResult {
    let ids: Vec<String> = req
        .data
        .get("user_ids")
        .and_then(Value::as_array)
        .ok_or_else(|| ActionError::invalid_param("user_ids"))?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect::<Option<_>>()
        .ok_or_else(|| ActionError::invalid_param("user_ids"))?;

    let statuses = ctx.store.get_statuses(&ids).await.map_err(|e| {
        ActionError::new("api.status.get.app_error", e.to_string(), 500)
    })?;

    let mut data = Map::new();
    for id in &ids {
        data.insert(id.clone(), Value::from(STATUS_OFFLINE));
    }
    for status in statuses {
        data.insert(status.user_id, Value::from(status.status));
    }
    Ok(Some(data))
}

fn ping() -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("text".into(), "pong".into());
    data.insert("version".into(), SERVER_VERSION.into());
    data.insert("server_time".into(), now_millis().into());
    data
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::{Semaphore, mpsc};

    use hearth_db::{MemoryStore, Store};
    use hearth_types::models::{Channel, ChannelMember, STATUS_ONLINE};

    use super::*;
    use crate::auth::{JwtSessionGate, SessionGrant};
    use crate::connection::PumpConfig;
    use crate::hub::Hub;

    fn context() -> (ConnContext, Arc<JwtSessionGate>, Arc<MemoryStore>) {
        let gate = Arc::new(JwtSessionGate::new("secret", chrono::Duration::hours(1)));
        let store = Arc::new(MemoryStore::new());
        let ctx = ConnContext {
            hub: Hub::new(),
            store: store.clone(),
            gate: gate.clone(),
            config: PumpConfig::default(),
            reader_permits: Arc::new(Semaphore::new(2)),
        };
        (ctx, gate, store)
    }

    fn request(seq: i64, action: &str, data: Value) -> WebSocketRequest {
        WebSocketRequest {
            seq,
            action: action.into(),
            data: data.as_object().cloned().unwrap_or_default(),
        }
    }

    fn responses(rx: &mut mpsc::Receiver<WebSocketMessage>) -> Vec<WebSocketResponse> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let WebSocketMessage::Response(r) = msg {
                out.push(r);
            }
        }
        out
    }

    #[tokio::test]
    async fn challenge_authenticates_and_registers() {
        let (ctx, gate, store) = context();
        let (token, _) = gate.issue(SessionGrant { user_id: "u1".into(), ..Default::default() }).unwrap();
        let (conn, mut rx) = WebConn::new("en");

        route(&ctx, &conn, request(1, ACTION_AUTHENTICATION_CHALLENGE, json!({"token": token}))).await;

        assert_eq!(conn.user_id(), Some("u1"));
        assert!(ctx.hub.is_online("u1").await);
        assert_eq!(store.get_status("u1").await.unwrap().status, STATUS_ONLINE);

        let replies = responses(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status, "OK");
        assert_eq!(replies[0].seq_reply, 1);
    }

    #[tokio::test]
    async fn bad_tokens_and_anonymous_requests_fail() {
        let (ctx, _gate, _store) = context();
        let (conn, mut rx) = WebConn::new("en");

        route(&ctx, &conn, request(1, ACTION_AUTHENTICATION_CHALLENGE, json!({"token": "junk"}))).await;
        route(&ctx, &conn, request(2, ACTION_PING, json!({}))).await;

        let replies = responses(&mut rx);
        assert_eq!(replies[0].error.as_ref().unwrap().status_code, 401);
        let err = replies[1].error.as_ref().unwrap();
        assert_eq!(err.id, "api.web_socket_router.not_authenticated.app_error");
        assert!(conn.user_id().is_none());
    }

    #[tokio::test]
    async fn unknown_actions_are_rejected() {
        let (ctx, gate, _store) = context();
        let (token, session) = gate.issue(SessionGrant { user_id: "u1".into(), ..Default::default() }).unwrap();
        let (conn, mut rx) = WebConn::new("en");
        conn.authenticate(session, token);

        route(&ctx, &conn, request(3, "teleport", json!({}))).await;
        let replies = responses(&mut rx);
        assert_eq!(replies[0].error.as_ref().unwrap().status_code, 501);
    }

    #[tokio::test]
    async fn typing_is_broadcast_to_the_channel_without_the_sender() {
        let (ctx, gate, store) = context();
        let channel = store
            .save_channel(Channel { team_id: "t".into(), name: "dev".into(), ..Default::default() })
            .await
            .unwrap();
        store
            .save_channel_member(ChannelMember {
                channel_id: channel.id.clone(),
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let (token, _) = gate.issue(SessionGrant { user_id: "u1".into(), ..Default::default() }).unwrap();
        let (conn, mut rx) = WebConn::new("en");
        route(&ctx, &conn, request(1, ACTION_AUTHENTICATION_CHALLENGE, json!({"token": token}))).await;
        while rx.try_recv().is_ok() {}

        route(&ctx, &conn, request(2, ACTION_USER_TYPING, json!({"channel_id": channel.id}))).await;

        let mut typing = None;
        while let Ok(msg) = rx.try_recv() {
            if let WebSocketMessage::Event(ev) = msg {
                typing = Some(ev);
            }
        }
        let typing = typing.expect("typing event enqueued");
        assert_eq!(typing.event, EVENT_TYPING);
        assert!(typing.broadcast.is_omitted("u1"));
        assert_eq!(typing.broadcast.channel_id, channel.id);

        route(&ctx, &conn, request(3, ACTION_USER_TYPING, json!({"channel_id": "elsewhere"}))).await;
        let replies = responses(&mut rx);
        assert_eq!(replies.last().unwrap().error.as_ref().unwrap().status_code, 403);
    }

    #[tokio::test]
    async fn statuses_default_to_offline() {
        let (ctx, gate, store) = context();
        store
            .save_status(hearth_types::models::Status {
                user_id: "u2".into(),
                status: STATUS_ONLINE.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let (token, session) = gate.issue(SessionGrant { user_id: "u1".into(), ..Default::default() }).unwrap();
        let (conn, mut rx) = WebConn::new("en");
        conn.authenticate(session, token);

        route(&ctx, &conn, request(4, ACTION_GET_STATUSES_BY_IDS, json!({"user_ids": ["u2", "u3"]}))).await;
        let data = responses(&mut rx).remove(0).data.unwrap();
        assert_eq!(data["u2"], STATUS_ONLINE);
        assert_eq!(data["u3"], STATUS_OFFLINE);
    }
}
