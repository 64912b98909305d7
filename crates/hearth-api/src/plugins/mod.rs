//! Narrow view of the plugin runtime: lifecycle, HTTP delegation, public
//! files and plugin-registered slash commands.

pub mod http;
pub mod public;
pub mod runtime;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use hearth_types::models::{Command, CommandArgs, CommandResponse};
use hearth_types::new_id;

use crate::config::PluginSettings;
use crate::error::AppError;

pub use runtime::LocalRuntime;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    NotFound(String),
    #[error("plugin {0} has no signature")]
    Unsigned(String),
    #[error("invalid plugin id: {0}")]
    InvalidId(String),
    #[error("bad manifest for {id}: {reason}")]
    Manifest { id: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PluginError {
    fn into_app_error(self, location: &'static str) -> AppError {
        match self {
            PluginError::NotFound(_) => AppError::not_found(location, "app.plugin.not_installed.app_error", self.to_string()),
            PluginError::Unsigned(_) => AppError::bad_request(location, "app.plugin.signature_missing.app_error", self.to_string()),
            PluginError::InvalidId(_) | PluginError::Manifest { .. } => {
                AppError::bad_request(location, "app.plugin.manifest.app_error", self.to_string())
            }
            PluginError::Io(_) => AppError::internal(location, "app.plugin.filesystem.app_error", self.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestWebapp {
    pub bundle_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub webapp: Option<ManifestWebapp>,
}

/// An installed plugin and where it lives on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginInfo {
    pub manifest: PluginManifest,
    pub path: PathBuf,
    pub active: bool,
}

/// Request metadata handed to plugin hooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginContext {
    pub request_id: String,
    pub session_id: String,
    pub ip_address: String,
    pub accept_language: String,
    pub user_agent: String,
}

/// Server-side entry points of one running plugin.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    async fn serve_http(&self, ctx: PluginContext, req: Request<Body>) -> Response;

    async fn execute_command(&self, ctx: PluginContext, args: &CommandArgs) -> Result<CommandResponse, AppError>;
}

/// Lifecycle of locally unpacked plugins.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    async fn available(&self) -> Result<Vec<PluginInfo>, PluginError>;
    async fn activate(&self, id: &str) -> Result<(), PluginError>;
    /// Returns whether the plugin was running.
    async fn deactivate(&self, id: &str) -> bool;
    async fn remove(&self, id: &str) -> Result<(), PluginError>;
    async fn unpack_webapp_bundle(&self, id: &str) -> Result<PluginManifest, PluginError>;
    fn is_active(&self, id: &str) -> bool;
    fn hooks_for_plugin(&self, id: &str) -> Option<Arc<dyn PluginHooks>>;
    fn plugin_dir(&self) -> PathBuf;
}

#[derive(Debug, Clone)]
struct PluginCommand {
    plugin_id: String,
    command: Command,
}

pub struct PluginFacade {
    settings: PluginSettings,
    runtime: Option<Arc<dyn PluginRuntime>>,
    commands: RwLock<Vec<PluginCommand>>,
}

impl PluginFacade {
    pub fn new(settings: PluginSettings, runtime: Option<Arc<dyn PluginRuntime>>) -> Self {
        Self {
            settings,
            runtime,
            commands: RwLock::new(Vec::new()),
        }
    }

    fn runtime(&self, location: &'static str) -> Result<&Arc<dyn PluginRuntime>, AppError> {
        match &self.runtime {
            Some(rt) if self.settings.enable => Ok(rt),
            _ => Err(AppError::not_implemented(location, "app.plugin.disabled.app_error")),
        }
    }

    pub fn hooks_for_plugin(&self, id: &str) -> Result<Arc<dyn PluginHooks>, AppError> {
        const LOC: &str = "hooks_for_plugin";
        self.runtime(LOC)?
            .hooks_for_plugin(id)
            .ok_or_else(|| AppError::not_found(LOC, "app.plugin.not_found.app_error", id.to_string()))
    }

    pub async fn available(&self) -> Result<Vec<PluginInfo>, AppError> {
        const LOC: &str = "available_plugins";
        self.runtime(LOC)?.available().await.map_err(|e| e.into_app_error(LOC))
    }

    pub async fn activate(&self, id: &str) -> Result<(), AppError> {
        const LOC: &str = "activate_plugin";
        self.runtime(LOC)?.activate(id).await.map_err(|e| e.into_app_error(LOC))?;
        info!("plugin {} activated", id);
        Ok(())
    }

    /// Stops the plugin and drops every command it registered.
    pub async fn deactivate(&self, id: &str) -> Result<bool, AppError> {
        let was_active = self.runtime("deactivate_plugin")?.deactivate(id).await;
        self.commands.write().retain(|pc| pc.plugin_id != id);
        if was_active {
            info!("plugin {} deactivated", id);
        }
        Ok(was_active)
    }

    pub async fn remove_plugin(&self, id: &str) -> Result<(), AppError> {
        const LOC: &str = "remove_plugin";
        let rt = self.runtime(LOC)?;
        rt.deactivate(id).await;
        self.commands.write().retain(|pc| pc.plugin_id != id);
        rt.remove(id).await.map_err(|e| e.into_app_error(LOC))
    }

    pub async fn unpack_webapp_bundle(&self, id: &str) -> Result<PluginManifest, AppError> {
        const LOC: &str = "unpack_webapp_bundle";
        self.runtime(LOC)?
            .unpack_webapp_bundle(id)
            .await
            .map_err(|e| e.into_app_error(LOC))
    }

    /// Root of an active plugin's public static files.
    pub fn public_files_path(&self, id: &str) -> Result<PathBuf, AppError> {
        const LOC: &str = "public_files_path";
        let rt = self.runtime(LOC)?;
        if !rt.is_active(id) {
            return Err(AppError::not_found(LOC, "app.plugin.not_found.app_error", id.to_string()));
        }
        Ok(rt.plugin_dir().join(id).join("public"))
    }

    /// Register a slash command on behalf of a plugin. A plugin may replace
    /// its own trigger but not another plugin's within an overlapping team.
    pub fn register_command(&self, plugin_id: &str, mut command: Command) -> Result<(), AppError> {
        const LOC: &str = "register_plugin_command";
        command.trigger = command.trigger.trim_start_matches('/').to_lowercase();
        if command.trigger.is_empty() || command.trigger.contains(char::is_whitespace) {
            return Err(AppError::bad_request(LOC, "model.command.is_valid.trigger.app_error", ""));
        }
        command.plugin_id = plugin_id.to_string();

        let mut commands = self.commands.write();
        for pc in commands.iter_mut() {
            let overlaps = pc.command.team_id.is_empty()
                || command.team_id.is_empty()
                || pc.command.team_id == command.team_id;
            if overlaps && pc.command.trigger == command.trigger {
                if pc.plugin_id != plugin_id {
                    return Err(AppError::bad_request(
                        LOC,
                        "plugin.api.register_command.duplicate.app_error",
                        format!("trigger {} owned by {}", command.trigger, pc.plugin_id),
                    ));
                }
                pc.command = command;
                return Ok(());
            }
        }
        commands.push(PluginCommand {
            plugin_id: plugin_id.to_string(),
            command,
        });
        Ok(())
    }

    pub fn unregister_command(&self, team_id: &str, trigger: &str) {
        let trigger = trigger.to_lowercase();
        self.commands
            .write()
            .retain(|pc| !(pc.command.team_id == team_id && pc.command.trigger == trigger));
    }

    /// Commands registered for `team_id` or for every team.
    pub fn plugin_commands(&self, team_id: &str) -> Vec<Command> {
        self.commands
            .read()
            .iter()
            .filter(|pc| pc.command.team_id.is_empty() || pc.command.team_id == team_id)
            .map(|pc| pc.command.clone())
            .collect()
    }

    /// Run the plugin command matching the invocation's trigger, if any.
    pub async fn try_execute_command(&self, args: &CommandArgs) -> Result<Option<(Command, CommandResponse)>, AppError> {
        const LOC: &str = "execute_plugin_command";
        let trigger = args
            .command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_lowercase();

        let matched = self
            .commands
            .read()
            .iter()
            .find(|pc| {
                (pc.command.team_id.is_empty() || pc.command.team_id == args.team_id)
                    && pc.command.trigger == trigger
            })
            .cloned();
        let Some(pc) = matched else {
            return Ok(None);
        };

        let hooks = self.hooks_for_plugin(&pc.plugin_id).map_err(|e| {
            warn!("plugin {} owns /{} but is not running", pc.plugin_id, trigger);
            AppError::internal(LOC, "model.plugin_command.error.app_error", e.to_string())
        })?;
        let ctx = PluginContext {
            request_id: new_id(),
            ..Default::default()
        };
        let response = hooks.execute_command(ctx, args).await?;
        Ok(Some((pc.command, response)))
    }
}
