use tracing::{debug, info};

use hearth_db::StoreError;
use hearth_types::models::{
    COMMAND_WEBHOOK_LIFETIME_MS, COMMAND_WEBHOOK_MAX_USES, CommandArgs, CommandResponse, CommandWebhook,
};
use hearth_types::now_millis;

use crate::commands::{PostSource, handle_command_response};
use crate::error::AppError;
use crate::state::{AppState, AppStateInner};

pub async fn create_command_webhook(state: &AppStateInner, hook: CommandWebhook) -> Result<CommandWebhook, AppError> {
    state
        .store
        .save_command_webhook(hook)
        .await
        .map_err(|e| AppError::from_store("create_command_webhook", "app.command_webhook.save.app_error", e))
}

/// Post a delayed answer to the command that issued `hook_id`. Each hook is
/// good for a limited number of uses within its lifetime.
pub async fn handle_command_webhook(
    state: &AppState,
    hook_id: &str,
    response: CommandResponse,
) -> Result<(), AppError> {
    const LOC: &str = "handle_command_webhook";
    let hook = state
        .store
        .get_command_webhook(hook_id)
        .await
        .map_err(|e| AppError::not_found(LOC, "app.command_webhook.get.missing", e.to_string()))?;
    if hook.is_expired(now_millis()) {
        return Err(AppError::not_found(LOC, "app.command_webhook.get.missing", hook_id.to_string()));
    }

    let command = state
        .store
        .get_command(&hook.command_id)
        .await
        .map_err(|e| AppError::bad_request(LOC, "web.command_webhook.command.app_error", e.to_string()))?;

    state
        .store
        .try_use_command_webhook(hook_id, COMMAND_WEBHOOK_MAX_USES)
        .await
        .map_err(|e| match e {
            StoreError::InvalidInput { .. } => {
                AppError::bad_request(LOC, "app.command_webhook.try_use.invalid", e.to_string())
            }
            other => AppError::internal(LOC, "app.command_webhook.try_use.app_error", other.to_string()),
        })?;
    debug!("command webhook {} used for /{}", hook_id, command.trigger);

    let args = CommandArgs {
        user_id: hook.user_id,
        channel_id: hook.channel_id,
        team_id: command.team_id.clone(),
        root_id: hook.root_id,
        parent_id: hook.parent_id,
        ..Default::default()
    };
    handle_command_response(state, &command, &args, response, PostSource::Custom).await?;
    Ok(())
}

/// Drop command webhooks past their lifetime. Returns how many went.
pub async fn cleanup_command_webhooks(state: &AppStateInner) -> Result<usize, AppError> {
    let removed = state
        .store
        .cleanup_command_webhooks(now_millis() - COMMAND_WEBHOOK_LIFETIME_MS)
        .await
        .map_err(|e| AppError::from_store("cleanup_command_webhooks", "app.command_webhook.cleanup.app_error", e))?;
    if removed > 0 {
        info!("removed {} expired command webhooks", removed);
    }
    Ok(removed)
}
