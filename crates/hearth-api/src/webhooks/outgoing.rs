use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, info, warn};

use hearth_types::api::{OUTGOING_HOOK_RESPONSE_TYPE_COMMENT, OutgoingWebhookPayload, OutgoingWebhookResponse};
use hearth_types::models::{Channel, OutgoingWebhook, Post, TriggerWhen};
use hearth_types::{new_id, now_millis};

use super::{WebhookPost, create_webhook_post, display_name_prop};
use crate::error::AppError;
use crate::http_client::{self, MAX_INTEGRATION_RESPONSE_SIZE};
use crate::slack;
use crate::state::{AppState, AppStateInner};

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

/// Hooks that fire for `post`, each with the trigger word that matched
/// (empty for channel-bound hooks without trigger words).
pub fn select_hooks(hooks: Vec<OutgoingWebhook>, post: &Post, channel: &Channel) -> Vec<(OutgoingWebhook, String)> {
    if !channel.is_open() {
        return Vec::new();
    }
    let first_word = post.message.split_whitespace().next().unwrap_or_default();

    hooks
        .into_iter()
        .filter(|hook| hook.channel_id.is_empty() || hook.channel_id == channel.id)
        .filter_map(|hook| {
            let word = if hook.channel_id == channel.id && hook.trigger_words.is_empty() {
                Some(String::new())
            } else {
                match hook.trigger_when {
                    TriggerWhen::Exact if hook.trigger_word_exact_match(first_word) => {
                        hook.trigger_word(first_word, true).map(str::to_string)
                    }
                    TriggerWhen::StartsWith if hook.trigger_word_starts_with(first_word) => {
                        hook.trigger_word(first_word, false).map(str::to_string)
                    }
                    _ => None,
                }
            }?;
            Some((hook, word))
        })
        .collect()
}

/// Fire the team's outgoing webhooks that match a new post. Each callback
/// runs in its own task; a reply, if any, is posted when it answers.
pub async fn handle_webhook_events(state: &AppState, post: &Post, channel: &Channel) -> Result<(), AppError> {
    const LOC: &str = "handle_webhook_events";
    if !state.config.service_settings.enable_outgoing_webhooks || !channel.is_open() {
        return Ok(());
    }

    let hooks = state
        .store
        .get_team_outgoing_webhooks(&channel.team_id)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.webhook.handle_webhook_events.get.app_error", e))?;
    let selected = select_hooks(hooks, post, channel);
    if selected.is_empty() {
        return Ok(());
    }

    let (user, team) = tokio::join!(state.store.get_user(&post.user_id), state.store.get_team(&channel.team_id));
    let user = user.map_err(|e| AppError::from_store(LOC, "api.webhook.handle_webhook_events.user.app_error", e))?;
    let team = team.map_err(|e| AppError::from_store(LOC, "api.webhook.handle_webhook_events.team.app_error", e))?;

    let post = Arc::new(post.clone());
    let channel = Arc::new(channel.clone());
    for (hook, trigger_word) in selected {
        let payload = OutgoingWebhookPayload {
            token: hook.token.clone(),
            team_id: team.id.clone(),
            team_domain: team.name.clone(),
            channel_id: channel.id.clone(),
            channel_name: channel.name.clone(),
            timestamp: post.create_at,
            user_id: user.id.clone(),
            user_name: user.username.clone(),
            post_id: post.id.clone(),
            text: post.message.clone(),
            trigger_word,
            file_ids: post.file_ids.join(","),
        };
        let (body, content_type) = if hook.content_type == CONTENT_TYPE_JSON {
            let encoded = serde_json::to_vec(&payload)
                .map_err(|e| AppError::internal(LOC, "api.marshal_error", e.to_string()))?;
            (Bytes::from(encoded), CONTENT_TYPE_JSON)
        } else {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.extend_pairs(payload.to_form_pairs());
            (Bytes::from(form.finish()), CONTENT_TYPE_FORM)
        };

        let hook = Arc::new(hook);
        for url in &hook.callback_urls {
            let state = state.clone();
            let hook = hook.clone();
            let post = post.clone();
            let channel = channel.clone();
            let body = body.clone();
            let url = url.clone();
            tokio::spawn(async move {
                if let Err(e) = trigger_webhook(&state, &hook, &post, &channel, &url, body, content_type).await {
                    warn!("outgoing webhook {} to {} failed: {}", hook.id, url, e);
                }
            });
        }
    }
    Ok(())
}

async fn trigger_webhook(
    state: &AppStateInner,
    hook: &OutgoingWebhook,
    post: &Post,
    channel: &Channel,
    url: &str,
    body: Bytes,
    content_type: &'static str,
) -> Result<(), AppError> {
    let Some(response) = do_outgoing_webhook_request(state, url, body, content_type).await? else {
        return Ok(());
    };
    if response.text.is_none() && response.attachments.is_empty() {
        return Ok(());
    }

    let root_id = if response.response_type == OUTGOING_HOOK_RESPONSE_TYPE_COMMENT {
        if post.root_id.is_empty() { post.id.clone() } else { post.root_id.clone() }
    } else {
        String::new()
    };

    let mut props = response.props;
    if let Some(name) = display_name_prop(&hook.display_name) {
        props.insert("webhook_display_name".into(), name);
    }
    let text = match response.text {
        Some(text) => slack::process_slack_text(state.store.as_ref(), &text).await,
        None => String::new(),
    };
    let attachments = slack::process_slack_attachments(state.store.as_ref(), response.attachments).await;

    let settings = &state.config.service_settings;
    let mut username = response.username;
    if settings.enable_post_username_override && username.is_empty() {
        username = hook.username.clone();
    }
    let mut icon_url = response.icon_url;
    if settings.enable_post_icon_override && icon_url.is_empty() {
        icon_url = hook.icon_url.clone();
    }

    let reply = create_webhook_post(
        state,
        WebhookPost {
            user_id: hook.creator_id.clone(),
            channel: channel.clone(),
            text,
            override_username: username,
            override_icon_url: icon_url,
            props,
            attachments,
            post_type: response.post_type,
            root_id,
            ..Default::default()
        },
    )
    .await?;
    debug!("outgoing webhook {} replied with post {}", hook.id, reply.id);
    Ok(())
}

/// POST `body` to one callback URL. An unparseable answer is no answer.
async fn do_outgoing_webhook_request(
    state: &AppStateInner,
    url: &str,
    body: Bytes,
    content_type: &'static str,
) -> Result<Option<OutgoingWebhookResponse>, AppError> {
    const LOC: &str = "do_outgoing_webhook_request";
    let resp = state
        .http
        .client()
        .post(url)
        .header(CONTENT_TYPE, content_type)
        .header(ACCEPT, CONTENT_TYPE_JSON)
        .body(body)
        .send()
        .await
        .map_err(|e| AppError::internal(LOC, "api.post.handle_webhook_events_and_forget.event_post.error", e.to_string()))?;

    let body = http_client::read_limited(resp, MAX_INTEGRATION_RESPONSE_SIZE)
        .await
        .map_err(|e| AppError::internal(LOC, "api.post.handle_webhook_events_and_forget.event_post.error", e.to_string()))?;
    Ok(serde_json::from_slice(&body).ok())
}

fn invalid(location: &'static str, field: &'static str) -> AppError {
    AppError::bad_request(location, "model.outgoing_hook.is_valid.app_error", field)
}

fn ensure_enabled(state: &AppStateInner, location: &'static str) -> Result<(), AppError> {
    if state.config.service_settings.enable_outgoing_webhooks {
        Ok(())
    } else {
        Err(AppError::not_implemented(location, "api.outgoing_webhook.disabled.app_error"))
    }
}

/// The hook's channel, when it has one, is an open channel of its team; a
/// hook without a channel needs trigger words; no other hook in the same
/// channel shares both a trigger word and a callback URL with it.
async fn check_outgoing_webhook(state: &AppStateInner, location: &'static str, hook: &OutgoingWebhook) -> Result<(), AppError> {
    hook.validate().map_err(|field| invalid(location, field))?;

    if hook.channel_id.is_empty() {
        if hook.trigger_words.is_empty() {
            return Err(AppError::bad_request(location, "api.webhook.create_outgoing.triggers.app_error", ""));
        }
    } else {
        let channel = state
            .store
            .get_channel(&hook.channel_id)
            .await
            .map_err(|e| AppError::from_store(location, "api.webhook.create_outgoing.channel.app_error", e))?;
        if !channel.is_open() {
            return Err(AppError::forbidden(location, "api.webhook.create_outgoing.not_open.app_error", channel.id));
        }
        if channel.team_id != hook.team_id {
            return Err(AppError::bad_request(location, "api.webhook.create_outgoing.permissions.app_error", channel.id));
        }
    }

    let existing = state
        .store
        .get_team_outgoing_webhooks(&hook.team_id)
        .await
        .map_err(|e| AppError::from_store(location, "api.webhook.create_outgoing.app_error", e))?;
    let words: HashSet<&str> = hook.trigger_words.iter().map(String::as_str).collect();
    let urls: HashSet<&str> = hook.callback_urls.iter().map(String::as_str).collect();
    let clash = existing.iter().filter(|other| other.id != hook.id && other.channel_id == hook.channel_id).any(|other| {
        other.trigger_words.iter().any(|w| words.contains(w.as_str()))
            && other.callback_urls.iter().any(|u| urls.contains(u.as_str()))
    });
    if clash {
        return Err(AppError::bad_request(location, "api.webhook.create_outgoing.intersect.app_error", ""));
    }
    Ok(())
}

pub async fn create_outgoing_webhook(state: &AppStateInner, mut hook: OutgoingWebhook) -> Result<OutgoingWebhook, AppError> {
    const LOC: &str = "create_outgoing_webhook";
    ensure_enabled(state, LOC)?;
    hook.id.clear();
    check_outgoing_webhook(state, LOC, &hook).await?;

    let saved = state
        .store
        .save_outgoing_webhook(hook)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.webhook.create_outgoing.app_error", e))?;
    info!("outgoing webhook {} created in team {}", saved.id, saved.team_id);
    Ok(saved)
}

/// Apply `updated` to `old`. Identity, token, ownership and team never change.
pub async fn update_outgoing_webhook(
    state: &AppStateInner,
    old: &OutgoingWebhook,
    mut updated: OutgoingWebhook,
) -> Result<OutgoingWebhook, AppError> {
    const LOC: &str = "update_outgoing_webhook";
    ensure_enabled(state, LOC)?;
    updated.id = old.id.clone();
    updated.token = old.token.clone();
    updated.creator_id = old.creator_id.clone();
    updated.team_id = old.team_id.clone();
    updated.create_at = old.create_at;
    updated.delete_at = old.delete_at;
    check_outgoing_webhook(state, LOC, &updated).await?;

    state
        .store
        .update_outgoing_webhook(updated)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.webhook.update_outgoing.app_error", e))
}

pub async fn regen_outgoing_webhook_token(
    state: &AppStateInner,
    mut hook: OutgoingWebhook,
) -> Result<OutgoingWebhook, AppError> {
    const LOC: &str = "regen_outgoing_webhook_token";
    ensure_enabled(state, LOC)?;
    hook.token = new_id();
    state
        .store
        .update_outgoing_webhook(hook)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.webhook.regen_outgoing_token.app_error", e))
}

pub async fn delete_outgoing_webhook(state: &AppStateInner, hook_id: &str) -> Result<(), AppError> {
    const LOC: &str = "delete_outgoing_webhook";
    ensure_enabled(state, LOC)?;
    state
        .store
        .delete_outgoing_webhook(hook_id, now_millis())
        .await
        .map_err(|e| AppError::from_store(LOC, "api.webhook.delete_outgoing.app_error", e))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use serde_json::Value;

    use hearth_types::events::EVENT_POSTED;

    use super::*;
    use crate::config::Config;
    use crate::error::ErrorKind;
    use crate::posts;
    use crate::testing::Fixture;

    fn hook(fx: &Fixture, words: &[&str], when: TriggerWhen, url: String) -> OutgoingWebhook {
        OutgoingWebhook {
            team_id: fx.team.id.clone(),
            creator_id: fx.alice.id.clone(),
            trigger_words: words.iter().map(|w| w.to_string()).collect(),
            trigger_when: when,
            callback_urls: vec![url],
            display_name: "deployer".into(),
            content_type: CONTENT_TYPE_JSON.into(),
            ..Default::default()
        }
    }

    fn said(fx: &Fixture, text: &str) -> Post {
        Post {
            user_id: fx.bob.id.clone(),
            channel_id: fx.town.id.clone(),
            message: text.into(),
            ..Default::default()
        }
    }

    fn posted(event: &hearth_types::events::WebSocketEvent) -> Post {
        let raw = event.data.get("post").and_then(Value::as_str).unwrap();
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn comment_replies_thread_under_the_trigger() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/deploy")
                    .header("content-type", "application/json")
                    .body_includes(r#""trigger_word":"deploy""#)
                    .body_includes(r#""text":"deploy now""#);
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"text":"ok","response_type":"comment"}"#);
            })
            .await;

        let fx = Fixture::new().await;
        create_outgoing_webhook(&fx.state, hook(&fx, &["deploy"], TriggerWhen::Exact, server.url("/deploy")))
            .await
            .unwrap();
        let (_conn, mut rx) = fx.connect(&fx.alice).await;

        let original = posts::create_post(&fx.state, said(&fx, "deploy now"), true)
            .await
            .unwrap();
        let first = posted(&*Fixture::next_event_of(&mut rx, EVENT_POSTED).await);
        assert_eq!(first.id, original.id);

        let reply = posted(&*Fixture::next_event_of(&mut rx, EVENT_POSTED).await);
        assert_eq!(reply.message, "ok");
        assert_eq!(reply.root_id, original.id);
        assert_eq!(reply.user_id, fx.alice.id);
        assert_eq!(reply.prop_str("from_webhook"), Some("true"));
        assert_eq!(reply.prop_str("webhook_display_name"), Some("deployer"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn form_payloads_and_silent_answers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/form")
                    .header("content-type", CONTENT_TYPE_FORM)
                    .body_includes("trigger_word=build")
                    .body_includes("text=build+it");
                then.status(200).body("{}");
            })
            .await;

        let fx = Fixture::new().await;
        let form_hook = OutgoingWebhook {
            content_type: CONTENT_TYPE_FORM.into(),
            ..hook(&fx, &["build"], TriggerWhen::StartsWith, server.url("/form"))
        };
        create_outgoing_webhook(&fx.state, form_hook).await.unwrap();

        let original = posts::create_post(&fx.state, said(&fx, "build it"), true)
            .await
            .unwrap();
        for _ in 0..50 {
            if mock.calls_async().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        mock.assert_async().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.store().get_root_posts(&fx.town.id).await.unwrap(), vec![original]);
    }

    #[tokio::test]
    async fn selection_rules() {
        let fx = Fixture::new().await;
        let url = "https://hooks.example/x".to_string();
        let exact = hook(&fx, &["deploy"], TriggerWhen::Exact, url.clone());
        let prefix = hook(&fx, &["dep"], TriggerWhen::StartsWith, url.clone());
        let bound = OutgoingWebhook { channel_id: fx.town.id.clone(), ..hook(&fx, &[], TriggerWhen::Exact, url.clone()) };
        let elsewhere = OutgoingWebhook { channel_id: "other".into(), ..hook(&fx, &["deploy"], TriggerWhen::Exact, url) };
        let hooks = vec![exact, prefix, bound, elsewhere];

        let words: Vec<String> = select_hooks(hooks.clone(), &said(&fx, "deploy now"), &fx.town)
            .into_iter()
            .map(|(_, w)| w)
            .collect();
        assert_eq!(words, vec!["deploy", "dep", ""]);

        let words: Vec<String> = select_hooks(hooks.clone(), &said(&fx, "deployment"), &fx.town)
            .into_iter()
            .map(|(_, w)| w)
            .collect();
        assert_eq!(words, vec!["dep", ""]);

        // nothing fires outside open channels
        assert!(select_hooks(hooks, &said(&fx, "deploy"), &fx.private).is_empty());
    }

    #[tokio::test]
    async fn crud_invariants() {
        let fx = Fixture::new().await;
        let url = "https://hooks.example/x".to_string();

        let private = OutgoingWebhook { channel_id: fx.private.id.clone(), ..hook(&fx, &["a"], TriggerWhen::Exact, url.clone()) };
        let err = create_outgoing_webhook(&fx.state, private).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);

        let bare = hook(&fx, &[], TriggerWhen::Exact, url.clone());
        let err = create_outgoing_webhook(&fx.state, bare).await.unwrap_err();
        assert_eq!(err.id, "api.webhook.create_outgoing.triggers.app_error");

        let first = create_outgoing_webhook(&fx.state, hook(&fx, &["a", "b"], TriggerWhen::Exact, url.clone()))
            .await
            .unwrap();
        let err = create_outgoing_webhook(&fx.state, hook(&fx, &["b"], TriggerWhen::Exact, url.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.id, "api.webhook.create_outgoing.intersect.app_error");
        let other_url = hook(&fx, &["b"], TriggerWhen::Exact, "https://hooks.example/y".into());
        assert!(create_outgoing_webhook(&fx.state, other_url).await.is_ok());

        let updated = update_outgoing_webhook(
            &fx.state,
            &first,
            OutgoingWebhook { token: "forged".into(), description: "ci".into(), ..first.clone() },
        )
        .await
        .unwrap();
        assert_eq!(updated.token, first.token);
        assert_eq!(updated.description, "ci");

        let regen = regen_outgoing_webhook_token(&fx.state, updated).await.unwrap();
        assert_ne!(regen.token, first.token);

        delete_outgoing_webhook(&fx.state, &first.id).await.unwrap();
        assert!(fx.store().get_outgoing_webhook(&first.id).await.is_err());
    }

    #[tokio::test]
    async fn disabled_hooks_do_nothing() {
        let mut config = Config::default();
        config.service_settings.enable_outgoing_webhooks = false;
        let fx = Fixture::with_config(config).await;
        let err = create_outgoing_webhook(&fx.state, hook(&fx, &["a"], TriggerWhen::Exact, "https://h.example".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotImplemented);
        assert!(handle_webhook_events(&fx.state, &said(&fx, "a"), &fx.town).await.is_ok());
    }
}
