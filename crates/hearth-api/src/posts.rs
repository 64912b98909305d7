use tracing::{debug, error};

use hearth_types::events::{EVENT_EPHEMERAL_MESSAGE, EVENT_POSTED, WebSocketEvent};
use hearth_types::models::{Channel, POST_MESSAGE_MAX_RUNES, POST_PROPS_MAX_RUNES, Post};
use hearth_types::{new_id, now_millis};

use crate::error::AppError;
use crate::state::{AppState, AppStateInner};
use crate::webhooks;

fn props_runes(post: &Post) -> usize {
    serde_json::to_string(&post.props)
        .map(|s| s.chars().count())
        .unwrap_or(usize::MAX)
}

fn validate(post: &Post) -> Result<(), AppError> {
    const LOC: &str = "create_post";
    if post.channel_id.is_empty() {
        return Err(AppError::bad_request(LOC, "model.post.is_valid.channel_id.app_error", ""));
    }
    if post.message.chars().count() > POST_MESSAGE_MAX_RUNES {
        return Err(AppError::bad_request(LOC, "model.post.is_valid.msg.app_error", ""));
    }
    if props_runes(post) > POST_PROPS_MAX_RUNES {
        return Err(AppError::bad_request(LOC, "model.post.is_valid.props.app_error", ""));
    }
    Ok(())
}

/// Persist a post and announce it on its channel. Never fires outgoing
/// webhooks; [`create_post`] does that for posts that should.
pub async fn save_and_publish(state: &AppStateInner, post: Post) -> Result<(Post, Channel), AppError> {
    const LOC: &str = "create_post";
    validate(&post)?;
    let channel = state
        .store
        .get_channel(&post.channel_id)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.post.create_post.channel.app_error", e))?;
    let post = state
        .store
        .save_post(post)
        .await
        .map_err(|e| AppError::from_store(LOC, "app.post.save.app_error", e))?;

    let sender_name = match post.prop_str("override_username") {
        Some(name) if post.prop_str("from_webhook") == Some("true") => name.to_string(),
        _ => state
            .store
            .get_user(&post.user_id)
            .await
            .map(|u| u.username)
            .unwrap_or_default(),
    };
    let encoded = serde_json::to_string(&post)
        .map_err(|e| AppError::internal(LOC, "api.marshal_error", e.to_string()))?;
    let event = WebSocketEvent::new(EVENT_POSTED, "", &channel.id, "")
        .with_data("post", encoded)
        .with_data("channel_type", channel.channel_type.as_str())
        .with_data("channel_name", channel.name.as_str())
        .with_data("channel_display_name", channel.display_name.as_str())
        .with_data("team_id", channel.team_id.as_str())
        .with_data("sender_name", sender_name);
    state.hub.publish(event).await;
    debug!("post {} created in {}", post.id, channel.id);

    Ok((post, channel))
}

/// Create a channel post; with `trigger_webhooks` the team's outgoing
/// webhooks are matched against it in the background.
pub async fn create_post(state: &AppState, post: Post, trigger_webhooks: bool) -> Result<Post, AppError> {
    let (post, channel) = save_and_publish(state, post).await?;
    if trigger_webhooks {
        let state = state.clone();
        let post = post.clone();
        tokio::spawn(async move {
            if let Err(e) = webhooks::outgoing::handle_webhook_events(&state, &post, &channel).await {
                error!("outgoing webhooks for post {} failed: {}", post.id, e);
            }
        });
    }
    Ok(post)
}

/// Show a post to one user only. Nothing is persisted.
pub async fn send_ephemeral_post(state: &AppStateInner, user_id: &str, mut post: Post) -> Post {
    if post.id.is_empty() {
        post.id = new_id();
    }
    if post.create_at == 0 {
        post.create_at = now_millis();
    }
    post.user_id = user_id.to_string();
    match serde_json::to_string(&post) {
        Ok(encoded) => {
            let event = WebSocketEvent::new(EVENT_EPHEMERAL_MESSAGE, "", &post.channel_id, user_id).with_data("post", encoded);
            state.hub.publish(event).await;
        }
        Err(e) => error!("failed to encode ephemeral post {}: {}", post.id, e),
    }
    post
}

#[cfg(test)]
mod tests {
    use hearth_types::models::POST_MESSAGE_MAX_RUNES;

    use super::*;
    use crate::testing::Fixture;

    #[tokio::test]
    async fn posts_are_saved_and_broadcast() {
        let fx = Fixture::new().await;
        let (conn, mut rx) = fx.connect(&fx.alice).await;

        let post = create_post(
            &fx.state,
            Post {
                user_id: fx.bob.id.clone(),
                channel_id: fx.town.id.clone(),
                message: "hello".into(),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap();
        assert!(!post.id.is_empty());
        assert_eq!(fx.state.store.get_post(&post.id).await.unwrap().message, "hello");

        let event = Fixture::next_event(&mut rx).await;
        assert_eq!(event.event, EVENT_POSTED);
        assert_eq!(event.data["sender_name"], "bob");
        drop(conn);
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected() {
        let fx = Fixture::new().await;
        let err = create_post(
            &fx.state,
            Post {
                user_id: fx.bob.id.clone(),
                channel_id: fx.town.id.clone(),
                message: "x".repeat(POST_MESSAGE_MAX_RUNES + 1),
                ..Default::default()
            },
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.id, "model.post.is_valid.msg.app_error");
    }

    #[tokio::test]
    async fn ephemeral_posts_reach_only_their_user() {
        let fx = Fixture::new().await;
        let (_alice_conn, mut alice_rx) = fx.connect(&fx.alice).await;

        let post = send_ephemeral_post(
            &fx.state,
            &fx.alice.id,
            Post {
                channel_id: fx.town.id.clone(),
                message: "only you".into(),
                ..Default::default()
            },
        )
        .await;
        assert!(fx.state.store.get_post(&post.id).await.is_err());

        let event = Fixture::next_event(&mut alice_rx).await;
        assert_eq!(event.event, EVENT_EPHEMERAL_MESSAGE);
        assert_eq!(event.broadcast.user_id, fx.alice.id);
    }
}
