use async_trait::async_trait;
use tracing::{error, info};

use hearth_types::events::{EVENT_USER_UPDATED, WebSocketEvent};
use hearth_types::models::{Command, CommandArgs, CommandResponse, CustomStatus, USER_PROP_CUSTOM_STATUS};

use super::registry::CommandProvider;
use crate::state::AppStateInner;

const CUSTOM_STATUS_TEXT_MAX_RUNES: usize = 100;
const DEFAULT_CUSTOM_STATUS_EMOJI: &str = "speech_balloon";

fn builtin_command(trigger: &str, desc: &str, hint: &str, name: &str) -> Command {
    Command {
        trigger: trigger.to_string(),
        auto_complete: true,
        auto_complete_desc: desc.to_string(),
        auto_complete_hint: hint.to_string(),
        display_name: name.to_string(),
        ..Default::default()
    }
}

pub struct EchoProvider;

#[async_trait]
impl CommandProvider for EchoProvider {
    fn trigger(&self) -> &'static str {
        "echo"
    }

    fn command(&self, _locale: &str) -> Command {
        builtin_command("echo", "Echo back text from your account", "\"message\"", "echo")
    }

    async fn do_command(&self, _state: &AppStateInner, _args: &CommandArgs, message: &str) -> CommandResponse {
        let message = message.trim();
        if message.is_empty() {
            return CommandResponse::ephemeral("A message must be provided with the /echo command.");
        }
        let message = message
            .strip_prefix('"')
            .and_then(|m| m.strip_suffix('"'))
            .unwrap_or(message);
        CommandResponse::ephemeral(message)
    }
}

pub struct MeProvider;

#[async_trait]
impl CommandProvider for MeProvider {
    fn trigger(&self) -> &'static str {
        "me"
    }

    fn command(&self, _locale: &str) -> Command {
        builtin_command("me", "Do an action", "[message]", "me")
    }

    async fn do_command(&self, _state: &AppStateInner, _args: &CommandArgs, message: &str) -> CommandResponse {
        CommandResponse::in_channel(format!("*{}*", message))
    }
}

pub struct ShrugProvider;

#[async_trait]
impl CommandProvider for ShrugProvider {
    fn trigger(&self) -> &'static str {
        "shrug"
    }

    fn command(&self, _locale: &str) -> Command {
        builtin_command("shrug", "Adds ¯\\_(ツ)_/¯ to your message", "[message]", "shrug")
    }

    async fn do_command(&self, _state: &AppStateInner, _args: &CommandArgs, message: &str) -> CommandResponse {
        let shrug = r"¯\\\_(ツ)\_/¯";
        let text = if message.is_empty() {
            shrug.to_string()
        } else {
            format!("{} {}", message, shrug)
        };
        CommandResponse::in_channel(text)
    }
}

/// `/status [:emoji:] text` or `/status clear`.
pub struct StatusProvider;

/// Split `:emoji: rest` into its parts. Without a leading emoji the
/// default one is used.
fn parse_custom_status(message: &str) -> CustomStatus {
    let message = message.trim();
    let (emoji, text) = match message.strip_prefix(':').and_then(|rest| rest.split_once(':')) {
        Some((emoji, rest)) if !emoji.is_empty() && !emoji.contains(char::is_whitespace) => (emoji, rest.trim()),
        _ => (DEFAULT_CUSTOM_STATUS_EMOJI, message),
    };
    CustomStatus {
        emoji: emoji.to_string(),
        text: text.chars().take(CUSTOM_STATUS_TEXT_MAX_RUNES).collect(),
    }
}

#[async_trait]
impl CommandProvider for StatusProvider {
    fn trigger(&self) -> &'static str {
        "status"
    }

    fn command(&self, _locale: &str) -> Command {
        builtin_command("status", "Set or clear your custom status", "[:emoji:] [text] | clear", "status")
    }

    async fn do_command(&self, state: &AppStateInner, args: &CommandArgs, message: &str) -> CommandResponse {
        let mut user = match state.store.get_user(&args.user_id).await {
            Ok(user) => user,
            Err(e) => {
                error!("status command: user {} lookup failed: {}", args.user_id, e);
                return CommandResponse::ephemeral("Unable to update your status.");
            }
        };

        let reply = if message.trim().eq_ignore_ascii_case("clear") {
            user.props.remove(USER_PROP_CUSTOM_STATUS);
            "Your status was cleared.".to_string()
        } else {
            let status = parse_custom_status(message);
            match serde_json::to_string(&status) {
                Ok(encoded) => {
                    user.props.insert(USER_PROP_CUSTOM_STATUS.to_string(), encoded);
                }
                Err(e) => {
                    error!("status command: encode failed: {}", e);
                    return CommandResponse::ephemeral("Unable to update your status.");
                }
            }
            format!("Your status is set to \":{}: {}\".", status.emoji, status.text)
        };

        let user = match state.store.save_user(user).await {
            Ok(user) => user,
            Err(e) => {
                error!("status command: saving user {} failed: {}", args.user_id, e);
                return CommandResponse::ephemeral("Unable to update your status.");
            }
        };
        match serde_json::to_value(&user) {
            Ok(value) => {
                let event = WebSocketEvent::new(EVENT_USER_UPDATED, "", "", "").with_data("user", value);
                state.hub.publish(event).await;
            }
            Err(e) => error!("status command: encode user failed: {}", e),
        }
        info!("user {} updated their custom status", user.id);
        CommandResponse::ephemeral(reply)
    }
}
