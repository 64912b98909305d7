use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use hearth_types::models::{Command, CommandArgs, CommandResponse};

use super::builtin::{EchoProvider, MeProvider, ShrugProvider, StatusProvider};
use crate::config::Config;
use crate::state::AppStateInner;

/// A slash command built into the server.
#[async_trait]
pub trait CommandProvider: Send + Sync {
    fn trigger(&self) -> &'static str;

    /// Autocomplete metadata shown to a user with the given locale.
    fn command(&self, locale: &str) -> Command;

    async fn do_command(&self, state: &AppStateInner, args: &CommandArgs, message: &str) -> CommandResponse;
}

/// Built-in providers keyed by trigger. Built once at startup and handed
/// to the command engine through the app state.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    providers: BTreeMap<&'static str, Arc<dyn CommandProvider>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock providers; `/status` only when custom statuses are on.
    pub fn with_builtins(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoProvider));
        registry.register(Arc::new(MeProvider));
        registry.register(Arc::new(ShrugProvider));
        if config.custom_statuses_enabled() {
            registry.register(Arc::new(StatusProvider));
        }
        registry
    }

    /// Later registrations replace earlier ones with the same trigger.
    pub fn register(&mut self, provider: Arc<dyn CommandProvider>) {
        self.providers.insert(provider.trigger(), provider);
    }

    pub fn get(&self, trigger: &str) -> Option<Arc<dyn CommandProvider>> {
        self.providers.get(trigger).cloned()
    }

    pub fn contains(&self, trigger: &str) -> bool {
        self.providers.contains_key(trigger)
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn CommandProvider>> {
        self.providers.values()
    }
}
