use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use hearth_types::models::{
    Channel, ChannelMember, Command, CommandWebhook, Emoji, FileInfo, IncomingWebhook,
    OutgoingWebhook, Post, Reaction, Status, Team, TeamMember, User,
};

/// Process-local store. Records live only as long as the process.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub users: HashMap<String, User>,
    pub statuses: HashMap<String, Status>,
    pub teams: HashMap<String, Team>,
    /// (team_id, user_id)
    pub team_members: HashMap<(String, String), TeamMember>,
    pub channels: HashMap<String, Channel>,
    /// (channel_id, user_id)
    pub channel_members: HashMap<(String, String), ChannelMember>,
    pub posts: HashMap<String, Post>,
    pub reactions: Vec<Reaction>,
    pub file_infos: HashMap<String, FileInfo>,
    pub emoji: HashMap<String, Emoji>,
    pub commands: HashMap<String, Command>,
    pub incoming_webhooks: HashMap<String, IncomingWebhook>,
    pub outgoing_webhooks: HashMap<String, OutgoingWebhook>,
    pub command_webhooks: HashMap<String, CommandWebhook>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("In-memory store initialised");
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    pub(crate) fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&Tables) -> T,
    {
        let tables = self.tables.read();
        f(&tables)
    }

    pub(crate) fn write<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut Tables) -> T,
    {
        let mut tables = self.tables.write();
        f(&mut tables)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
