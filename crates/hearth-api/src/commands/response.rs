use tracing::warn;

use hearth_types::models::{Command, CommandArgs, CommandResponse, Post, ResponseType, SlackAttachment};

use super::PostSource;
use crate::error::{AppError, ErrorKind};
use crate::posts;
use crate::slack;
use crate::state::AppState;

/// Turn a command's response and each of its extra responses into posts.
/// Every post is attempted; if any fails the last failure is returned.
pub async fn handle_command_response(
    state: &AppState,
    command: &Command,
    args: &CommandArgs,
    response: CommandResponse,
    source: PostSource,
) -> Result<CommandResponse, AppError> {
    const LOC: &str = "handle_command_response";
    let mut last_err = None;

    if let Err(e) = handle_command_response_post(state, command, args, &response, source).await {
        warn!("/{}: response post failed: {}", command.trigger, e);
        last_err = Some(e);
    }
    // Each extra response is checked against its own channel_id; they may
    // target different channels than the primary one.
    for extra in &response.extra_responses {
        if let Err(e) = handle_command_response_post(state, command, args, extra, source).await {
            warn!("/{}: extra response post failed: {}", command.trigger, e);
            last_err = Some(e);
        }
    }

    match last_err {
        Some(e) => Err(e.wrap(ErrorKind::Internal, LOC, "api.command.execute_command.create_post_failed.app_error")),
        None => Ok(response),
    }
}

/// Build and create the post for one response.
pub async fn handle_command_response_post(
    state: &AppState,
    command: &Command,
    args: &CommandArgs,
    response: &CommandResponse,
    source: PostSource,
) -> Result<Post, AppError> {
    const LOC: &str = "handle_command_response_post";
    let settings = &state.config.service_settings;

    let mut post = Post {
        channel_id: args.channel_id.clone(),
        root_id: args.root_id.clone(),
        parent_id: args.parent_id.clone(),
        user_id: args.user_id.clone(),
        post_type: response.post_type.clone(),
        props: response.props.clone(),
        ..Default::default()
    };

    if !response.channel_id.is_empty() {
        state
            .store
            .get_channel_member(&response.channel_id, &args.user_id)
            .await
            .map_err(|e| AppError::forbidden(LOC, "api.command.command_post.forbidden.app_error", e.to_string()))?;
        post.channel_id = response.channel_id.clone();
    }

    let mut from_webhook = source.is_bot();
    if settings.enable_post_username_override {
        if !command.username.is_empty() {
            post.add_prop("override_username", command.username.as_str());
            from_webhook = true;
        } else if !response.username.is_empty() {
            post.add_prop("override_username", response.username.as_str());
            from_webhook = true;
        }
    }
    if settings.enable_post_icon_override {
        if !command.icon_url.is_empty() {
            post.add_prop("override_icon_url", command.icon_url.as_str());
            from_webhook = true;
        } else if !response.icon_url.is_empty() {
            post.add_prop("override_icon_url", response.icon_url.as_str());
            from_webhook = true;
        } else {
            post.add_prop("override_icon_url", "");
        }
    }
    if from_webhook {
        post.add_prop("from_webhook", "true");
    }

    let attachments = if response.skip_slack_parsing {
        post.message = response.text.clone();
        response.attachments.clone()
    } else {
        post.message = slack::process_slack_text(state.store.as_ref(), &response.text).await;
        slack::process_slack_attachments(state.store.as_ref(), response.attachments.clone()).await
    };

    create_command_post(state, post, response.response_type, attachments, response.skip_slack_parsing).await
}

/// In-channel responses become normal posts (outgoing webhooks fire);
/// anything else with content goes to the invoking user only.
pub async fn create_command_post(
    state: &AppState,
    mut post: Post,
    response_type: ResponseType,
    attachments: Vec<SlackAttachment>,
    skip_slack_parsing: bool,
) -> Result<Post, AppError> {
    const LOC: &str = "create_command_post";
    if post.is_system_message() {
        return Err(AppError::bad_request(LOC, "api.context.invalid_param.app_error", "post.type"));
    }

    let has_attachments = !attachments.is_empty();
    slack::parse_slack_attachment(&mut post, attachments);
    if !skip_slack_parsing {
        post.message = slack::parse_slack_links_to_markdown(&post.message);
    }

    match response_type {
        ResponseType::InChannel => posts::create_post(state, post, true).await,
        _ if !post.message.is_empty() || has_attachments => {
            post.parent_id.clear();
            let user_id = post.user_id.clone();
            Ok(posts::send_ephemeral_post(state, &user_id, post).await)
        }
        _ => Ok(post),
    }
}
