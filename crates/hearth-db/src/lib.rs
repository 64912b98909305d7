pub mod memory;
pub mod queries;

use std::collections::HashSet;

use async_trait::async_trait;

use hearth_types::models::{
    Channel, ChannelMember, Command, CommandWebhook, Emoji, FileInfo, IncomingWebhook,
    OutgoingWebhook, Post, Reaction, Status, Team, TeamMember, User,
};

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid {entity}: {reason}")]
    InvalidInput { entity: &'static str, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(entity: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            entity,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Repository facade consumed by the gateway and api crates.
///
/// Every call resolves to a value, [`StoreError::NotFound`],
/// [`StoreError::InvalidInput`], or an opaque [`StoreError::Other`].
#[async_trait]
pub trait Store: Send + Sync {
    // -- Users --

    async fn save_user(&self, user: User) -> StoreResult<User>;
    async fn get_user(&self, id: &str) -> StoreResult<User>;
    async fn get_user_by_username(&self, username: &str) -> StoreResult<User>;
    async fn get_all_users(&self) -> StoreResult<Vec<User>>;
    /// Whether `viewer_id` shares a team or channel with `subject_id`.
    async fn user_can_see(&self, viewer_id: &str, subject_id: &str) -> StoreResult<bool>;

    // -- Statuses --

    async fn get_status(&self, user_id: &str) -> StoreResult<Status>;
    async fn get_statuses(&self, user_ids: &[String]) -> StoreResult<Vec<Status>>;
    async fn save_status(&self, status: Status) -> StoreResult<()>;

    // -- Teams --

    async fn save_team(&self, team: Team) -> StoreResult<Team>;
    async fn get_team(&self, id: &str) -> StoreResult<Team>;
    async fn get_all_teams(&self) -> StoreResult<Vec<Team>>;
    async fn save_team_member(&self, member: TeamMember) -> StoreResult<()>;
    async fn get_team_member(&self, team_id: &str, user_id: &str) -> StoreResult<TeamMember>;
    async fn get_team_members_for_user(&self, user_id: &str) -> StoreResult<Vec<TeamMember>>;

    // -- Channels --

    async fn save_channel(&self, channel: Channel) -> StoreResult<Channel>;
    async fn get_channel(&self, id: &str) -> StoreResult<Channel>;
    async fn get_channel_by_name(&self, team_id: &str, name: &str) -> StoreResult<Channel>;
    async fn get_all_channels(&self) -> StoreResult<Vec<Channel>>;
    async fn get_or_create_direct_channel(&self, user_a: &str, user_b: &str) -> StoreResult<Channel>;
    async fn save_channel_member(&self, member: ChannelMember) -> StoreResult<()>;
    async fn get_channel_member(&self, channel_id: &str, user_id: &str) -> StoreResult<ChannelMember>;
    async fn get_channel_members(&self, channel_id: &str) -> StoreResult<Vec<ChannelMember>>;
    async fn get_channel_members_for_user(&self, user_id: &str) -> StoreResult<Vec<ChannelMember>>;
    /// Ids of every live channel the user belongs to.
    async fn get_all_channel_ids_for_user(&self, user_id: &str) -> StoreResult<HashSet<String>>;

    // -- Posts --

    async fn save_post(&self, post: Post) -> StoreResult<Post>;
    async fn get_post(&self, id: &str) -> StoreResult<Post>;
    /// Root posts of a channel, oldest first.
    async fn get_root_posts(&self, channel_id: &str) -> StoreResult<Vec<Post>>;
    /// Replies to a root post, oldest first.
    async fn get_post_replies(&self, root_id: &str) -> StoreResult<Vec<Post>>;

    // -- Reactions, files, emoji --

    async fn save_reaction(&self, reaction: Reaction) -> StoreResult<()>;
    async fn get_reactions(&self, post_id: &str) -> StoreResult<Vec<Reaction>>;
    async fn save_file_info(&self, info: FileInfo) -> StoreResult<FileInfo>;
    async fn get_file_infos(&self, post_id: &str) -> StoreResult<Vec<FileInfo>>;
    async fn save_emoji(&self, emoji: Emoji) -> StoreResult<Emoji>;
    async fn get_all_emoji(&self) -> StoreResult<Vec<Emoji>>;

    // -- Commands --

    async fn save_command(&self, command: Command) -> StoreResult<Command>;
    async fn update_command(&self, command: Command) -> StoreResult<Command>;
    async fn get_command(&self, id: &str) -> StoreResult<Command>;
    /// Live (not deleted) commands of a team.
    async fn get_team_commands(&self, team_id: &str) -> StoreResult<Vec<Command>>;
    async fn delete_command(&self, id: &str, delete_at: i64) -> StoreResult<()>;

    // -- Webhooks --

    async fn save_incoming_webhook(&self, hook: IncomingWebhook) -> StoreResult<IncomingWebhook>;
    async fn get_incoming_webhook(&self, id: &str) -> StoreResult<IncomingWebhook>;
    async fn delete_incoming_webhook(&self, id: &str, delete_at: i64) -> StoreResult<()>;

    async fn save_outgoing_webhook(&self, hook: OutgoingWebhook) -> StoreResult<OutgoingWebhook>;
    async fn update_outgoing_webhook(&self, hook: OutgoingWebhook) -> StoreResult<OutgoingWebhook>;
    async fn get_outgoing_webhook(&self, id: &str) -> StoreResult<OutgoingWebhook>;
    async fn get_team_outgoing_webhooks(&self, team_id: &str) -> StoreResult<Vec<OutgoingWebhook>>;
    async fn delete_outgoing_webhook(&self, id: &str, delete_at: i64) -> StoreResult<()>;

    async fn save_command_webhook(&self, hook: CommandWebhook) -> StoreResult<CommandWebhook>;
    async fn get_command_webhook(&self, id: &str) -> StoreResult<CommandWebhook>;
    /// Bump the use count unless it already reached `limit`.
    async fn try_use_command_webhook(&self, id: &str, limit: i32) -> StoreResult<()>;
    /// Drop hooks created before `older_than`; returns how many were removed.
    async fn cleanup_command_webhooks(&self, older_than: i64) -> StoreResult<usize>;
}
