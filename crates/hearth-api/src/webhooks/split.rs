use hearth_types::models::{POST_PROPS_MAX_USER_RUNES, Post, Props, SlackAttachment};

use crate::error::AppError;

const LOC: &str = "split_webhook_post";

fn props_len(props: &Props) -> usize {
    serde_json::to_string(props)
        .map(|s| s.chars().count())
        .unwrap_or(usize::MAX)
}

fn too_large() -> AppError {
    AppError::bad_request(
        LOC,
        "web.incoming_webhook.split_props_length.app_error",
        format!("max {} runes", POST_PROPS_MAX_USER_RUNES),
    )
}

fn set_attachments(post: &mut Post, attachments: &[SlackAttachment]) {
    let value = serde_json::to_value(attachments).unwrap_or_default();
    post.add_prop("attachments", value);
}

/// Break a webhook post into posts that each fit `max_post_size` runes of
/// text and the user props budget. Text is cut on rune boundaries; the
/// attachments follow the text, in order, moving to a fresh post when the
/// current one is full and truncating an attachment's text as a last resort.
pub fn split_webhook_post(post: &Post, max_post_size: usize) -> Result<Vec<Post>, AppError> {
    let mut base = post.clone();
    base.message.clear();
    base.props.remove("attachments");
    if props_len(&base.props) > POST_PROPS_MAX_USER_RUNES {
        return Err(too_large());
    }

    let mut splits = Vec::new();
    let mut remaining = post.message.as_str();
    while remaining.chars().count() > max_post_size {
        let cut = remaining
            .char_indices()
            .nth(max_post_size)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let mut split = base.clone();
        split.message = remaining[..cut].to_string();
        splits.push(split);
        remaining = &remaining[cut..];
    }
    let mut last = base.clone();
    last.message = remaining.to_string();
    splits.push(last);

    // attachments currently placed on the last split
    let mut current: Vec<SlackAttachment> = Vec::new();
    for mut attachment in post.attachments() {
        current.push(attachment.clone());
        let Some(last) = splits.last_mut() else {
            break;
        };
        set_attachments(last, &current);
        if props_len(&last.props) <= POST_PROPS_MAX_USER_RUNES {
            continue;
        }

        if current.len() > 1 {
            current.pop();
            set_attachments(last, &current);
            current = vec![attachment.clone()];
            let mut fresh = base.clone();
            set_attachments(&mut fresh, &current);
            let fits = props_len(&fresh.props) <= POST_PROPS_MAX_USER_RUNES;
            splits.push(fresh);
            if fits {
                continue;
            }
        }

        let Some(last) = splits.last_mut() else {
            break;
        };
        loop {
            let excess = props_len(&last.props).saturating_sub(POST_PROPS_MAX_USER_RUNES);
            if excess == 0 {
                break;
            }
            let text_len = attachment.text.chars().count();
            if text_len == 0 || text_len < excess {
                return Err(too_large());
            }
            attachment.text = attachment.text.chars().take(text_len - excess).collect();
            if let Some(slot) = current.last_mut() {
                *slot = attachment.clone();
            }
            set_attachments(last, &current);
        }
    }

    Ok(splits)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    fn attachment(text_len: usize, tag: &str) -> SlackAttachment {
        SlackAttachment {
            title: tag.to_string(),
            text: "a".repeat(text_len),
            ..Default::default()
        }
    }

    fn with_attachments(message: &str, attachments: &[SlackAttachment]) -> Post {
        let mut post = Post { message: message.to_string(), ..Default::default() };
        post.add_prop("attachments", serde_json::to_value(attachments).unwrap());
        post
    }

    fn assert_bounds(splits: &[Post], max: usize) {
        for split in splits {
            assert!(split.message.chars().count() <= max);
            assert!(props_len(&split.props) <= POST_PROPS_MAX_USER_RUNES);
        }
    }

    #[test]
    fn short_posts_are_untouched() {
        let mut post = Post { message: "hello".into(), ..Default::default() };
        post.add_prop("from_webhook", "true");
        let splits = split_webhook_post(&post, 16383).unwrap();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].message, "hello");
        assert_eq!(splits[0].prop_str("from_webhook"), Some("true"));
    }

    #[test]
    fn text_splits_on_rune_boundaries() {
        let message = "é".repeat(25);
        let post = Post { message: message.clone(), ..Default::default() };
        let splits = split_webhook_post(&post, 10).unwrap();
        assert_eq!(splits.len(), 3);
        assert_eq!(splits[0].message.chars().count(), 10);
        assert_eq!(splits[2].message.chars().count(), 5);
        let joined: String = splits.iter().map(|p| p.message.as_str()).collect();
        assert_eq!(joined, message);
    }

    #[test]
    fn oversized_base_props_fail() {
        let mut post = Post::default();
        post.add_prop("blob", "x".repeat(POST_PROPS_MAX_USER_RUNES + 1));
        let err = split_webhook_post(&post, 16383).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert_eq!(err.id, "web.incoming_webhook.split_props_length.app_error");
    }

    #[test]
    fn large_text_with_attachments() {
        // ~120 KB of text, three attachments of ~20 KB each
        let message = "m".repeat(120 * 1024);
        let attachments: Vec<_> = ["one", "two", "three"].iter().map(|t| attachment(20 * 1024, t)).collect();
        let splits = split_webhook_post(&with_attachments(&message, &attachments), 16383).unwrap();
        assert!(splits.len() >= 2);
        assert_bounds(&splits, 16383);

        let titles: Vec<String> = splits
            .iter()
            .flat_map(|p| p.attachments())
            .map(|a| a.title)
            .collect();
        assert_eq!(titles, vec!["one", "two", "three"]);
        // attachments ride on the last text split
        assert_eq!(splits.last().unwrap().attachments().len(), 3);
    }

    #[test]
    fn attachments_overflow_into_new_posts() {
        let attachments: Vec<_> = (0..3).map(|i| attachment(POST_PROPS_MAX_USER_RUNES / 2, &i.to_string())).collect();
        let splits = split_webhook_post(&with_attachments("hi", &attachments), 16383).unwrap();
        assert_eq!(splits.len(), 3);
        assert_bounds(&splits, 16383);
        assert_eq!(splits[0].message, "hi");
        assert!(splits[1].message.is_empty());
        let titles: Vec<String> = splits.iter().flat_map(|p| p.attachments()).map(|a| a.title).collect();
        assert_eq!(titles, vec!["0", "1", "2"]);
    }

    #[test]
    fn a_single_huge_attachment_is_truncated() {
        let splits = split_webhook_post(&with_attachments("", &[attachment(POST_PROPS_MAX_USER_RUNES + 10, "big")]), 16383)
            .unwrap();
        assert_eq!(splits.len(), 1);
        assert_bounds(&splits, 16383);
        let text_len = splits[0].attachments()[0].text.len();
        assert!(text_len < POST_PROPS_MAX_USER_RUNES);
        assert!(text_len > POST_PROPS_MAX_USER_RUNES - 200);
    }

    #[test]
    fn attachment_that_cannot_fit_even_empty_fails() {
        let mut huge = attachment(0, "t");
        huge.pretext = "p".repeat(POST_PROPS_MAX_USER_RUNES + 1);
        let err = split_webhook_post(&with_attachments("", &[huge]), 16383).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn other_props_are_kept_on_every_split() {
        let mut post = Post { message: "x".repeat(30), ..Default::default() };
        post.add_prop("webhook_display_name", json!("ci"));
        let splits = split_webhook_post(&post, 10).unwrap();
        assert!(splits.iter().all(|p| p.prop_str("webhook_display_name") == Some("ci")));
    }
}
