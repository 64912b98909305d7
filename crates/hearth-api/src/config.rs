use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {key}: {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceSettings {
    #[serde(rename = "SiteURL")]
    pub site_url: String,
    pub enable_commands: bool,
    pub enable_incoming_webhooks: bool,
    pub enable_outgoing_webhooks: bool,
    pub enable_post_username_override: bool,
    pub enable_post_icon_override: bool,
    #[serde(rename = "ExperimentalStrictCSRFEnforcement")]
    pub experimental_strict_csrf_enforcement: bool,
    pub experimental_town_square_is_read_only: bool,
    pub enable_insecure_outgoing_connections: bool,
    pub websocket_pong_wait_seconds: u64,
    /// Seconds of inactivity before an online user is marked away.
    pub user_status_away_timeout: u64,
    pub outgoing_integration_requests_timeout: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            site_url: "http://localhost:8065".into(),
            enable_commands: true,
            enable_incoming_webhooks: true,
            enable_outgoing_webhooks: true,
            enable_post_username_override: false,
            enable_post_icon_override: false,
            experimental_strict_csrf_enforcement: false,
            experimental_town_square_is_read_only: false,
            enable_insecure_outgoing_connections: false,
            websocket_pong_wait_seconds: 60,
            user_status_away_timeout: 300,
            outgoing_integration_requests_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PluginSettings {
    pub enable: bool,
    pub enable_remote_marketplace: bool,
    pub require_plugin_signature: bool,
    pub directory: PathBuf,
    pub client_directory: PathBuf,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            enable: true,
            enable_remote_marketplace: false,
            require_plugin_signature: false,
            directory: PathBuf::from("./plugins"),
            client_directory: PathBuf::from("./client/plugins"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileSettings {
    pub directory: PathBuf,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExportSettings {
    pub directory: PathBuf,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./export"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TeamSettings {
    pub enable_custom_user_statuses: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FeatureFlags {
    pub custom_user_statuses: bool,
}

/// Process configuration. Deserializes from the JSON layout
/// (`ServiceSettings.SiteURL`, ...) or loads from `HEARTH_*` variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub service_settings: ServiceSettings,
    pub plugin_settings: PluginSettings,
    pub file_settings: FileSettings,
    pub export_settings: ExportSettings,
    pub team_settings: TeamSettings,
    pub feature_flags: FeatureFlags,
    /// Whether a license is installed; gates licensed-only restrictions.
    #[serde(skip)]
    pub licensed: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Lookup(&lookup);
        let mut cfg = Config::default();

        let s = &mut cfg.service_settings;
        env.set_string("HEARTH_SITE_URL", &mut s.site_url);
        env.set("HEARTH_ENABLE_COMMANDS", &mut s.enable_commands)?;
        env.set("HEARTH_ENABLE_INCOMING_WEBHOOKS", &mut s.enable_incoming_webhooks)?;
        env.set("HEARTH_ENABLE_OUTGOING_WEBHOOKS", &mut s.enable_outgoing_webhooks)?;
        env.set("HEARTH_ENABLE_POST_USERNAME_OVERRIDE", &mut s.enable_post_username_override)?;
        env.set("HEARTH_ENABLE_POST_ICON_OVERRIDE", &mut s.enable_post_icon_override)?;
        env.set("HEARTH_STRICT_CSRF_ENFORCEMENT", &mut s.experimental_strict_csrf_enforcement)?;
        env.set("HEARTH_TOWN_SQUARE_IS_READ_ONLY", &mut s.experimental_town_square_is_read_only)?;
        env.set("HEARTH_ENABLE_INSECURE_OUTGOING_CONNECTIONS", &mut s.enable_insecure_outgoing_connections)?;
        env.set("HEARTH_WEBSOCKET_PONG_WAIT_SECONDS", &mut s.websocket_pong_wait_seconds)?;
        env.set("HEARTH_USER_STATUS_AWAY_TIMEOUT", &mut s.user_status_away_timeout)?;
        env.set("HEARTH_OUTGOING_REQUESTS_TIMEOUT", &mut s.outgoing_integration_requests_timeout)?;

        let p = &mut cfg.plugin_settings;
        env.set("HEARTH_PLUGINS_ENABLE", &mut p.enable)?;
        env.set("HEARTH_PLUGINS_ENABLE_REMOTE_MARKETPLACE", &mut p.enable_remote_marketplace)?;
        env.set("HEARTH_PLUGINS_REQUIRE_SIGNATURE", &mut p.require_plugin_signature)?;
        env.set("HEARTH_PLUGINS_DIRECTORY", &mut p.directory)?;
        env.set("HEARTH_PLUGINS_CLIENT_DIRECTORY", &mut p.client_directory)?;

        env.set("HEARTH_FILES_DIRECTORY", &mut cfg.file_settings.directory)?;
        env.set("HEARTH_EXPORT_DIRECTORY", &mut cfg.export_settings.directory)?;
        env.set("HEARTH_ENABLE_CUSTOM_USER_STATUSES", &mut cfg.team_settings.enable_custom_user_statuses)?;
        env.set("HEARTH_FEATURE_CUSTOM_USER_STATUSES", &mut cfg.feature_flags.custom_user_statuses)?;
        env.set("HEARTH_LICENSED", &mut cfg.licensed)?;

        Ok(cfg)
    }

    /// Path component of the site URL without a trailing slash, e.g. `/chat`.
    pub fn subpath(&self) -> String {
        url::Url::parse(&self.service_settings.site_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default()
    }

    pub fn custom_statuses_enabled(&self) -> bool {
        self.team_settings.enable_custom_user_statuses && self.feature_flags.custom_user_statuses
    }
}

struct Lookup<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn set<T: FromStr>(&self, key: &'static str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(raw) = (self.0)(key) {
            *slot = raw.trim().parse().map_err(|_| ConfigError { key, value: raw })?;
        }
        Ok(())
    }

    fn set_string(&self, key: &'static str, slot: &mut String) {
        if let Some(raw) = (self.0)(key) {
            *slot = raw;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, Config::default());
        assert!(cfg.service_settings.enable_commands);
        assert_eq!(cfg.service_settings.websocket_pong_wait_seconds, 60);
    }

    #[test]
    fn env_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("HEARTH_SITE_URL", "https://chat.example/team/"),
            ("HEARTH_ENABLE_COMMANDS", "false"),
            ("HEARTH_PLUGINS_DIRECTORY", "/srv/plugins"),
            ("HEARTH_USER_STATUS_AWAY_TIMEOUT", "60"),
        ]))
        .unwrap();
        assert!(!cfg.service_settings.enable_commands);
        assert_eq!(cfg.plugin_settings.directory, PathBuf::from("/srv/plugins"));
        assert_eq!(cfg.service_settings.user_status_away_timeout, 60);
        assert_eq!(cfg.subpath(), "/team");
    }

    #[test]
    fn bad_values_are_reported() {
        let err = Config::from_lookup(lookup(&[("HEARTH_ENABLE_COMMANDS", "yes please")])).unwrap_err();
        assert_eq!(err.key, "HEARTH_ENABLE_COMMANDS");
    }

    #[test]
    fn deserializes_json_layout() {
        let cfg: Config = serde_json::from_str(
            r#"{"ServiceSettings":{"SiteURL":"https://x.example","EnablePostIconOverride":true},
                "TeamSettings":{"EnableCustomUserStatuses":true},
                "FeatureFlags":{"CustomUserStatuses":true}}"#,
        )
        .unwrap();
        assert_eq!(cfg.service_settings.site_url, "https://x.example");
        assert!(cfg.service_settings.enable_post_icon_override);
        assert!(cfg.service_settings.enable_commands);
        assert!(cfg.custom_statuses_enabled());
        assert_eq!(cfg.subpath(), "");
    }
}
