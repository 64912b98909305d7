//! Incoming, outgoing and command webhooks, and the post path they share.

pub mod command_hook;
pub mod incoming;
pub mod outgoing;
pub mod split;

use hearth_types::models::{
    Channel, DEFAULT_WEBHOOK_USERNAME, POST_MESSAGE_MAX_RUNES, Post, Props, SlackAttachment,
};
use serde_json::Value;

use crate::error::AppError;
use crate::posts;
use crate::slack;
use crate::state::AppStateInner;

pub use split::split_webhook_post;

/// Props a webhook payload may not set directly.
const PROTECTED_PROPS: &[&str] = &["override_icon_url", "override_username", "from_webhook"];

/// Everything needed to post on behalf of a webhook.
#[derive(Debug, Clone, Default)]
pub struct WebhookPost {
    pub user_id: String,
    pub channel: Channel,
    pub text: String,
    pub override_username: String,
    pub override_icon_url: String,
    pub override_icon_emoji: String,
    pub props: Props,
    pub attachments: Vec<SlackAttachment>,
    pub post_type: String,
    pub root_id: String,
}

/// Create a webhook post, split into as many posts as the size limits need.
/// Returns the first of them. Never triggers outgoing webhooks.
pub async fn create_webhook_post(state: &AppStateInner, hook: WebhookPost) -> Result<Post, AppError> {
    const LOC: &str = "create_webhook_post";
    let settings = &state.config.service_settings;

    let mut post = Post {
        user_id: hook.user_id,
        channel_id: hook.channel.id.clone(),
        root_id: hook.root_id,
        message: slack::parse_slack_links_to_markdown(&hook.text),
        post_type: hook.post_type,
        ..Default::default()
    };
    post.add_prop("from_webhook", "true");
    if post.is_system_message() {
        return Err(AppError::bad_request(LOC, "api.context.invalid_param.app_error", "post.type"));
    }

    if settings.enable_post_username_override {
        let username = if hook.override_username.is_empty() {
            DEFAULT_WEBHOOK_USERNAME.to_string()
        } else {
            hook.override_username
        };
        post.add_prop("override_username", username);
    }
    if settings.enable_post_icon_override {
        if !hook.override_icon_url.is_empty() {
            post.add_prop("override_icon_url", hook.override_icon_url);
        }
        if !hook.override_icon_emoji.is_empty() {
            post.add_prop("override_icon_emoji", hook.override_icon_emoji);
        }
    }

    let mut attachments = hook.attachments;
    for (key, value) in hook.props {
        if key == "attachments" {
            if let Ok(from_props) = serde_json::from_value::<Vec<SlackAttachment>>(value) {
                if attachments.is_empty() {
                    attachments = from_props;
                }
            }
        } else if !PROTECTED_PROPS.contains(&key.as_str()) {
            post.props.insert(key, value);
        }
    }
    if !attachments.is_empty() {
        slack::parse_slack_attachment(&mut post, attachments);
    }

    let splits = split_webhook_post(&post, POST_MESSAGE_MAX_RUNES)?;
    let mut first = None;
    for split in splits {
        let (saved, _) = posts::save_and_publish(state, split).await?;
        first.get_or_insert(saved);
    }
    first.ok_or_else(|| AppError::internal(LOC, "web.incoming_webhook.split.app_error", "no posts"))
}

/// Props value of a webhook's display name, when it has one.
pub(crate) fn display_name_prop(name: &str) -> Option<Value> {
    (!name.is_empty()).then(|| Value::String(name.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use hearth_types::events::EVENT_POSTED;

    use super::*;
    use crate::config::Config;
    use crate::error::ErrorKind;
    use crate::testing::Fixture;

    fn hook_post(fx: &Fixture, text: &str) -> WebhookPost {
        WebhookPost {
            user_id: fx.alice.id.clone(),
            channel: fx.town.clone(),
            text: text.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn marks_post_and_applies_overrides() {
        let mut config = Config::default();
        config.service_settings.enable_post_username_override = true;
        config.service_settings.enable_post_icon_override = true;
        let fx = Fixture::with_config(config).await;

        let mut props = Props::new();
        props.insert("from_webhook".into(), json!("false"));
        props.insert("override_username".into(), json!("spoofed"));
        props.insert("card".into(), json!("details"));
        let post = create_webhook_post(
            &fx.state,
            WebhookPost {
                override_icon_url: "https://ci.example/icon.png".into(),
                props,
                ..hook_post(&fx, "build <https://ci.example/1|#1> passed")
            },
        )
        .await
        .unwrap();

        assert_eq!(post.message, "build [#1](https://ci.example/1) passed");
        assert_eq!(post.prop_str("from_webhook"), Some("true"));
        assert_eq!(post.prop_str("override_username"), Some("webhook"));
        assert_eq!(post.prop_str("override_icon_url"), Some("https://ci.example/icon.png"));
        assert_eq!(post.prop_str("card"), Some("details"));
    }

    #[tokio::test]
    async fn overrides_need_config() {
        let fx = Fixture::new().await;
        let post = create_webhook_post(
            &fx.state,
            WebhookPost { override_username: "ci".into(), ..hook_post(&fx, "hi") },
        )
        .await
        .unwrap();
        assert!(post.prop_str("override_username").is_none());
    }

    #[tokio::test]
    async fn system_types_are_rejected() {
        let fx = Fixture::new().await;
        let err = create_webhook_post(
            &fx.state,
            WebhookPost { post_type: "system_add_to_channel".into(), ..hook_post(&fx, "hi") },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn long_text_is_published_as_several_posts() {
        let fx = Fixture::new().await;
        let (_conn, mut rx) = fx.connect(&fx.bob).await;
        let text = "z".repeat(POST_MESSAGE_MAX_RUNES + 5);
        let first = create_webhook_post(&fx.state, hook_post(&fx, &text)).await.unwrap();
        assert_eq!(first.message.chars().count(), POST_MESSAGE_MAX_RUNES);

        Fixture::next_event_of(&mut rx, EVENT_POSTED).await;
        Fixture::next_event_of(&mut rx, EVENT_POSTED).await;
        assert_eq!(fx.store().get_root_posts(&fx.town.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn attachments_become_a_slack_attachment_post() {
        let fx = Fixture::new().await;
        let post = create_webhook_post(
            &fx.state,
            WebhookPost {
                attachments: vec![SlackAttachment { text: "<https://x.example|x>".into(), ..Default::default() }],
                ..hook_post(&fx, "")
            },
        )
        .await
        .unwrap();
        assert_eq!(post.post_type, "slack_attachment");
        assert_eq!(post.attachments()[0].text, "[x](https://x.example)");
    }

    #[test]
    fn display_name_prop_skips_empty() {
        assert!(display_name_prop("").is_none());
        assert_eq!(display_name_prop("ci"), Some(json!("ci")));
    }
}
