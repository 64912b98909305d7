use tracing::{debug, info};

use hearth_types::api::IncomingWebhookRequest;
use hearth_types::models::{Channel, DEFAULT_CHANNEL, IncomingWebhook, Post};
use hearth_types::now_millis;

use super::{WebhookPost, create_webhook_post};
use crate::error::AppError;
use crate::slack;
use crate::state::AppStateInner;

fn ensure_enabled(state: &AppStateInner, location: &'static str) -> Result<(), AppError> {
    if state.config.service_settings.enable_incoming_webhooks {
        Ok(())
    } else {
        Err(AppError::not_implemented(location, "web.incoming_webhook.disabled.app_error"))
    }
}

/// `@user` is a direct channel with the hook's owner, `#name` or `name` a
/// channel of the hook's team, and nothing at all the hook's own channel.
async fn resolve_channel(state: &AppStateInner, hook: &IncomingWebhook, requested: &str) -> Result<Channel, AppError> {
    const LOC: &str = "handle_incoming_webhook";
    let store = state.store.as_ref();

    if requested.is_empty() {
        return store
            .get_channel(&hook.channel_id)
            .await
            .map_err(|e| AppError::from_store(LOC, "web.incoming_webhook.channel.app_error", e));
    }
    if let Some(username) = requested.strip_prefix('@') {
        let user = store
            .get_user_by_username(username)
            .await
            .map_err(|e| AppError::from_store(LOC, "web.incoming_webhook.user.app_error", e))?;
        return store
            .get_or_create_direct_channel(&hook.user_id, &user.id)
            .await
            .map_err(|e| AppError::from_store(LOC, "web.incoming_webhook.channel.app_error", e));
    }
    let name = requested.strip_prefix('#').unwrap_or(requested);
    store
        .get_channel_by_name(&hook.team_id, name)
        .await
        .map_err(|e| AppError::from_store(LOC, "web.incoming_webhook.channel.app_error", e))
}

/// Post an incoming webhook request to its channel.
pub async fn handle_incoming_webhook(
    state: &AppStateInner,
    hook_id: &str,
    req: IncomingWebhookRequest,
) -> Result<Post, AppError> {
    const LOC: &str = "handle_incoming_webhook";
    ensure_enabled(state, LOC)?;
    if req.text.is_empty() && req.attachments.is_empty() {
        return Err(AppError::bad_request(LOC, "web.incoming_webhook.text.app_error", ""));
    }

    let hook = state
        .store
        .get_incoming_webhook(hook_id)
        .await
        .map_err(|e| AppError::bad_request(LOC, "web.incoming_webhook.invalid.app_error", e.to_string()))?;

    let text = slack::process_slack_text(state.store.as_ref(), &req.text).await;
    let attachments = slack::process_slack_attachments(state.store.as_ref(), req.attachments).await;

    let channel = resolve_channel(state, &hook, &req.channel).await?;
    if hook.channel_locked && channel.id != hook.channel_id {
        return Err(AppError::forbidden(
            LOC,
            "web.incoming_webhook.channel_locked.app_error",
            format!("hook {} is locked to its channel", hook.id),
        ));
    }

    let settings = &state.config.service_settings;
    if state.config.licensed && settings.experimental_town_square_is_read_only && channel.name == DEFAULT_CHANNEL {
        return Err(AppError::forbidden(LOC, "api.post.create_post.town_square_read_only", ""));
    }
    if !channel.is_open() && state.store.get_channel_member(&channel.id, &hook.user_id).await.is_err() {
        return Err(AppError::forbidden(
            LOC,
            "web.incoming_webhook.permissions.app_error",
            channel.id.clone(),
        ));
    }

    let override_username = if req.username.is_empty() { hook.username } else { req.username };
    let override_icon_url = if req.icon_url.is_empty() { hook.icon_url } else { req.icon_url };
    debug!("incoming webhook {} posting to {}", hook_id, channel.id);

    create_webhook_post(
        state,
        WebhookPost {
            user_id: hook.user_id,
            channel,
            text,
            override_username,
            override_icon_url,
            override_icon_emoji: req.icon_emoji,
            props: req.props,
            attachments,
            post_type: req.post_type,
            root_id: String::new(),
        },
    )
    .await
}

pub async fn create_incoming_webhook(state: &AppStateInner, hook: IncomingWebhook) -> Result<IncomingWebhook, AppError> {
    const LOC: &str = "create_incoming_webhook";
    ensure_enabled(state, LOC)?;
    let channel = state
        .store
        .get_channel(&hook.channel_id)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.incoming_webhook.channel.app_error", e))?;
    if channel.team_id != hook.team_id {
        return Err(AppError::bad_request(LOC, "api.incoming_webhook.channel.app_error", "channel not in team"));
    }
    let saved = state
        .store
        .save_incoming_webhook(hook)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.incoming_webhook.save.app_error", e))?;
    info!("incoming webhook {} created for channel {}", saved.id, saved.channel_id);
    Ok(saved)
}

pub async fn delete_incoming_webhook(state: &AppStateInner, hook_id: &str) -> Result<(), AppError> {
    const LOC: &str = "delete_incoming_webhook";
    ensure_enabled(state, LOC)?;
    state
        .store
        .delete_incoming_webhook(hook_id, now_millis())
        .await
        .map_err(|e| AppError::from_store(LOC, "api.incoming_webhook.delete.app_error", e))
}
