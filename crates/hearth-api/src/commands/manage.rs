use std::collections::HashSet;

use tracing::info;

use hearth_types::models::Command;
use hearth_types::{new_id, now_millis};

use crate::error::AppError;
use crate::state::AppStateInner;

fn ensure_enabled(state: &AppStateInner, location: &'static str) -> Result<(), AppError> {
    if state.config.service_settings.enable_commands {
        Ok(())
    } else {
        Err(AppError::not_implemented(location, "api.command.disabled.app_error"))
    }
}

fn invalid(location: &'static str, field: &'static str) -> AppError {
    AppError::bad_request(location, "model.command.is_valid.app_error", field)
}

/// The trigger is free in `team_id` (ignoring `except_id`) and not a built-in.
async fn ensure_trigger_free(
    state: &AppStateInner,
    location: &'static str,
    team_id: &str,
    trigger: &str,
    except_id: &str,
) -> Result<(), AppError> {
    let existing = state
        .store
        .get_team_commands(team_id)
        .await
        .map_err(|e| AppError::from_store(location, "api.command.list_team_commands.app_error", e))?;
    let taken = existing
        .iter()
        .any(|c| c.id != except_id && c.trigger == trigger)
        || state.commands.contains(trigger);
    if taken {
        return Err(AppError::bad_request(
            location,
            "api.command.duplicate_trigger.app_error",
            trigger.to_string(),
        ));
    }
    Ok(())
}

pub async fn create_command(state: &AppStateInner, mut command: Command) -> Result<Command, AppError> {
    const LOC: &str = "create_command";
    ensure_enabled(state, LOC)?;
    if !command.id.is_empty() {
        return Err(invalid(LOC, "id"));
    }
    command.trigger = command.trigger.to_lowercase();
    command.validate().map_err(|field| invalid(LOC, field))?;
    ensure_trigger_free(state, LOC, &command.team_id, &command.trigger, "").await?;

    let saved = state
        .store
        .save_command(command)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.save.app_error", e))?;
    info!("command /{} created in team {}", saved.trigger, saved.team_id);
    Ok(saved)
}

/// Apply `updated` to `old`. Identity, ownership and plugin binding never change.
pub async fn update_command(state: &AppStateInner, old: &Command, mut updated: Command) -> Result<Command, AppError> {
    const LOC: &str = "update_command";
    ensure_enabled(state, LOC)?;

    updated.id = old.id.clone();
    updated.token = old.token.clone();
    updated.creator_id = old.creator_id.clone();
    updated.team_id = old.team_id.clone();
    updated.create_at = old.create_at;
    updated.delete_at = old.delete_at;
    updated.plugin_id = old.plugin_id.clone();
    updated.trigger = updated.trigger.to_lowercase();
    updated.validate().map_err(|field| invalid(LOC, field))?;
    ensure_trigger_free(state, LOC, &updated.team_id, &updated.trigger, &updated.id).await?;

    state
        .store
        .update_command(updated)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.update.app_error", e))
}

pub async fn move_command(state: &AppStateInner, team_id: &str, mut command: Command) -> Result<Command, AppError> {
    const LOC: &str = "move_command";
    ensure_enabled(state, LOC)?;
    let team = state
        .store
        .get_team(team_id)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.move_command.team.app_error", e))?;
    ensure_trigger_free(state, LOC, &team.id, &command.trigger, &command.id).await?;
    command.team_id = team.id;

    state
        .store
        .update_command(command)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.update.app_error", e))
}

pub async fn regen_command_token(state: &AppStateInner, mut command: Command) -> Result<Command, AppError> {
    const LOC: &str = "regen_command_token";
    ensure_enabled(state, LOC)?;
    command.token = new_id();
    state
        .store
        .update_command(command)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.regen.app_error", e))
}

pub async fn delete_command(state: &AppStateInner, command_id: &str) -> Result<(), AppError> {
    const LOC: &str = "delete_command";
    ensure_enabled(state, LOC)?;
    state
        .store
        .delete_command(command_id, now_millis())
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.delete.app_error", e))
}

pub async fn list_team_commands(state: &AppStateInner, team_id: &str) -> Result<Vec<Command>, AppError> {
    const LOC: &str = "list_team_commands";
    ensure_enabled(state, LOC)?;
    state
        .store
        .get_team_commands(team_id)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.list_team_commands.app_error", e))
}

fn push_unseen(out: &mut Vec<Command>, seen: &mut HashSet<String>, mut command: Command) {
    if seen.insert(command.trigger.clone()) {
        command.sanitize();
        out.push(command);
    }
}

/// Commands offered in the autocomplete list: plugins, then the team's
/// custom commands, then built-ins. The first source to claim a trigger wins.
pub async fn list_autocomplete_commands(
    state: &AppStateInner,
    team_id: &str,
    locale: &str,
) -> Result<Vec<Command>, AppError> {
    const LOC: &str = "list_autocomplete_commands";
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for command in state.plugins.plugin_commands(team_id) {
        if command.auto_complete {
            push_unseen(&mut out, &mut seen, command);
        }
    }
    if state.config.service_settings.enable_commands {
        let custom = state
            .store
            .get_team_commands(team_id)
            .await
            .map_err(|e| AppError::from_store(LOC, "api.command.list_team_commands.app_error", e))?;
        for command in custom.into_iter().filter(|c| c.auto_complete) {
            push_unseen(&mut out, &mut seen, command);
        }
    }
    for provider in state.commands.providers() {
        let command = provider.command(locale);
        if command.auto_complete {
            push_unseen(&mut out, &mut seen, command);
        }
    }
    Ok(out)
}

/// Every command a member of `team_id` can run: built-ins, then plugins,
/// then the team's custom commands.
pub async fn list_all_commands(state: &AppStateInner, team_id: &str, locale: &str) -> Result<Vec<Command>, AppError> {
    const LOC: &str = "list_all_commands";
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for provider in state.commands.providers() {
        let command = provider.command(locale);
        if command.auto_complete {
            push_unseen(&mut out, &mut seen, command);
        }
    }
    for command in state.plugins.plugin_commands(team_id) {
        push_unseen(&mut out, &mut seen, command);
    }
    if state.config.service_settings.enable_commands {
        let custom = state
            .store
            .get_team_commands(team_id)
            .await
            .map_err(|e| AppError::from_store(LOC, "api.command.list_team_commands.app_error", e))?;
        for command in custom {
            push_unseen(&mut out, &mut seen, command);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorKind;
    use crate::testing::Fixture;

    fn jira(fx: &Fixture) -> Command {
        Command {
            team_id: fx.team.id.clone(),
            trigger: "Jira".into(),
            url: "https://jira.example/hook".into(),
            creator_id: fx.alice.id.clone(),
            auto_complete: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_lowercases_and_rejects_duplicates() {
        let fx = Fixture::new().await;
        let created = create_command(&fx.state, jira(&fx)).await.unwrap();
        assert_eq!(created.trigger, "jira");
        assert!(!created.token.is_empty());

        let dup = create_command(&fx.state, jira(&fx)).await.unwrap_err();
        assert_eq!(dup.id, "api.command.duplicate_trigger.app_error");

        let builtin = create_command(&fx.state, Command { trigger: "echo".into(), ..jira(&fx) })
            .await
            .unwrap_err();
        assert_eq!(builtin.kind, ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn create_validates() {
        let fx = Fixture::new().await;
        let err = create_command(&fx.state, Command { url: "ftp://x".into(), ..jira(&fx) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert_eq!(err.detail, "url");
    }

    #[tokio::test]
    async fn disabled_commands_are_not_implemented() {
        let mut config = Config::default();
        config.service_settings.enable_commands = false;
        let fx = Fixture::with_config(config).await;
        let err = create_command(&fx.state, jira(&fx)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotImplemented);
    }

    #[tokio::test]
    async fn update_keeps_identity() {
        let fx = Fixture::new().await;
        let created = create_command(&fx.state, jira(&fx)).await.unwrap();
        let other = create_command(&fx.state, Command { trigger: "wiki".into(), ..jira(&fx) })
            .await
            .unwrap();

        let updated = update_command(
            &fx.state,
            &created,
            Command {
                token: "forged".into(),
                creator_id: "someone".into(),
                description: "issues".into(),
                ..created.clone()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.token, created.token);
        assert_eq!(updated.creator_id, created.creator_id);
        assert_eq!(updated.description, "issues");

        let clash = update_command(&fx.state, &other, Command { trigger: "JIRA".into(), ..other.clone() })
            .await
            .unwrap_err();
        assert_eq!(clash.id, "api.command.duplicate_trigger.app_error");
    }

    #[tokio::test]
    async fn regen_move_and_delete() {
        let fx = Fixture::new().await;
        let created = create_command(&fx.state, jira(&fx)).await.unwrap();
        let regen = regen_command_token(&fx.state, created.clone()).await.unwrap();
        assert_ne!(regen.token, created.token);

        let team = fx
            .store()
            .save_team(hearth_types::models::Team { name: "ops".into(), ..Default::default() })
            .await
            .unwrap();
        let moved = move_command(&fx.state, &team.id, regen).await.unwrap();
        assert_eq!(moved.team_id, team.id);
        assert!(list_team_commands(&fx.state, &fx.team.id).await.unwrap().is_empty());

        delete_command(&fx.state, &moved.id).await.unwrap();
        assert!(list_team_commands(&fx.state, &team.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listings_dedupe_and_sanitize() {
        let fx = Fixture::new().await;
        create_command(&fx.state, jira(&fx)).await.unwrap();
        fx.state
            .plugins
            .register_command(
                "com.example.jira",
                Command { trigger: "jira".into(), auto_complete: true, description: "plugin".into(), ..Default::default() },
            )
            .unwrap();

        let auto = list_autocomplete_commands(&fx.state, &fx.team.id, "en").await.unwrap();
        let jira_entries: Vec<&Command> = auto.iter().filter(|c| c.trigger == "jira").collect();
        assert_eq!(jira_entries.len(), 1);
        assert_eq!(jira_entries[0].description, "plugin");
        assert!(auto.iter().any(|c| c.trigger == "echo"));
        assert!(auto.iter().all(|c| c.token.is_empty() && c.url.is_empty()));

        let all = list_all_commands(&fx.state, &fx.team.id, "en").await.unwrap();
        assert_eq!(all[0].trigger, "echo");
        assert_eq!(all.iter().filter(|c| c.trigger == "jira").count(), 1);
    }
}
