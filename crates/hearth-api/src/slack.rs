//! Slack-compatible text handling for command responses and webhook posts.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use hearth_db::Store;
use hearth_types::models::{POST_SLACK_ATTACHMENT, Post, SlackAttachment, stringify_field_values};

static LINK_WITH_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^\n<\|>]+)\|([^\n>]+)>").expect("invalid link regex"));

static USER_ID_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@([a-zA-Z0-9]+)>").expect("invalid user id regex"));

/// `<!channel>`, `<!here>` and `<!all>` become `@channel`, `@here` and `@all`.
pub fn expand_announcement(text: &str) -> String {
    text.replace("<!channel>", "@channel")
        .replace("<!here>", "@here")
        .replace("<!all>", "@all")
}

/// `<url|label>` becomes `[label](url)`.
pub fn parse_slack_links_to_markdown(text: &str) -> String {
    LINK_WITH_TEXT.replace_all(text, "[${2}](${1})").into_owned()
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

/// Replace `<@userid>` with `@username` for every id the store knows.
pub async fn replace_user_ids(store: &dyn Store, text: &str) -> String {
    let ids: Vec<String> = USER_ID_MENTION
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();
    let mut out = text.to_string();
    for id in ids {
        if let Ok(user) = store.get_user(&id).await {
            out = out.replace(&format!("<@{}>", id), &format!("@{}", user.username));
        }
    }
    out
}

pub async fn process_slack_text(store: &dyn Store, text: &str) -> String {
    let text = expand_announcement(text);
    let text = replace_user_ids(store, &text).await;
    decode_entities(&text)
}

/// Run every user-visible attachment string through [`process_slack_text`].
/// Field values end up as strings.
pub async fn process_slack_attachments(store: &dyn Store, mut attachments: Vec<SlackAttachment>) -> Vec<SlackAttachment> {
    stringify_field_values(&mut attachments);
    for attachment in &mut attachments {
        attachment.pretext = process_slack_text(store, &attachment.pretext).await;
        attachment.text = process_slack_text(store, &attachment.text).await;
        attachment.title = process_slack_text(store, &attachment.title).await;
        for field in &mut attachment.fields {
            if let Value::String(value) = &field.value {
                field.value = Value::String(process_slack_text(store, value).await);
            }
        }
    }
    attachments
}

/// Store `attachments` on the post with their links rewritten, marking the
/// post as a Slack attachment post. An empty list removes the prop.
pub fn parse_slack_attachment(post: &mut Post, mut attachments: Vec<SlackAttachment>) {
    if attachments.is_empty() {
        post.props.remove("attachments");
        return;
    }
    post.post_type = POST_SLACK_ATTACHMENT.to_string();
    for attachment in &mut attachments {
        attachment.text = parse_slack_links_to_markdown(&attachment.text);
        attachment.pretext = parse_slack_links_to_markdown(&attachment.pretext);
        for field in &mut attachment.fields {
            if let Value::String(value) = &field.value {
                field.value = Value::String(parse_slack_links_to_markdown(value));
            }
        }
    }
    let value = serde_json::to_value(&attachments).unwrap_or(Value::Null);
    post.add_prop("attachments", value);
}
