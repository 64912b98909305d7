use std::collections::HashSet;

use async_trait::async_trait;

use hearth_types::models::{
    Channel, ChannelMember, ChannelType, Command, CommandWebhook, Emoji, FileInfo,
    IncomingWebhook, OutgoingWebhook, Post, Reaction, Status, Team, TeamMember, User,
};
use hearth_types::{new_id, now_millis};

use crate::memory::MemoryStore;
use crate::{Store, StoreError, StoreResult};

fn assign_id(id: &mut String) {
    if id.is_empty() {
        *id = new_id();
    }
}

fn stamp(create_at: &mut i64) {
    if *create_at == 0 {
        *create_at = now_millis();
    }
}

#[async_trait]
impl Store for MemoryStore {
    // -- Users --

    async fn save_user(&self, mut user: User) -> StoreResult<User> {
        assign_id(&mut user.id);
        stamp(&mut user.create_at);
        user.username = user.username.to_lowercase();
        self.write(|t| {
            let taken = t
                .users
                .values()
                .any(|u| u.username == user.username && u.id != user.id);
            if taken {
                return Err(StoreError::invalid("user", "username exists"));
            }
            t.users.insert(user.id.clone(), user.clone());
            Ok(user)
        })
    }

    async fn get_user(&self, id: &str) -> StoreResult<User> {
        self.read(|t| t.users.get(id).cloned())
            .ok_or_else(|| StoreError::not_found("user", id))
    }

    async fn get_user_by_username(&self, username: &str) -> StoreResult<User> {
        let wanted = username.to_lowercase();
        self.read(|t| t.users.values().find(|u| u.username == wanted).cloned())
            .ok_or_else(|| StoreError::not_found("user", username))
    }

    async fn get_all_users(&self) -> StoreResult<Vec<User>> {
        let mut users: Vec<User> = self.read(|t| t.users.values().cloned().collect());
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn user_can_see(&self, viewer_id: &str, subject_id: &str) -> StoreResult<bool> {
        if viewer_id == subject_id {
            return Ok(true);
        }
        Ok(self.read(|t| {
            let viewer_channels: HashSet<&str> = t
                .channel_members
                .keys()
                .filter(|(_, u)| u == viewer_id)
                .map(|(c, _)| c.as_str())
                .collect();
            t.channel_members
                .keys()
                .any(|(c, u)| u == subject_id && viewer_channels.contains(c.as_str()))
        }))
    }

    // -- Statuses --

    async fn get_status(&self, user_id: &str) -> StoreResult<Status> {
        self.read(|t| t.statuses.get(user_id).cloned())
            .ok_or_else(|| StoreError::not_found("status", user_id))
    }

    async fn get_statuses(&self, user_ids: &[String]) -> StoreResult<Vec<Status>> {
        Ok(self.read(|t| {
            user_ids
                .iter()
                .filter_map(|id| t.statuses.get(id).cloned())
                .collect()
        }))
    }

    async fn save_status(&self, status: Status) -> StoreResult<()> {
        self.write(|t| t.statuses.insert(status.user_id.clone(), status));
        Ok(())
    }

    // -- Teams --

    async fn save_team(&self, mut team: Team) -> StoreResult<Team> {
        assign_id(&mut team.id);
        stamp(&mut team.create_at);
        self.write(|t| t.teams.insert(team.id.clone(), team.clone()));
        Ok(team)
    }

    async fn get_team(&self, id: &str) -> StoreResult<Team> {
        self.read(|t| t.teams.get(id).cloned())
            .ok_or_else(|| StoreError::not_found("team", id))
    }

    async fn get_all_teams(&self) -> StoreResult<Vec<Team>> {
        let mut teams: Vec<Team> = self.read(|t| t.teams.values().cloned().collect());
        teams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(teams)
    }

    async fn save_team_member(&self, member: TeamMember) -> StoreResult<()> {
        let key = (member.team_id.clone(), member.user_id.clone());
        self.write(|t| t.team_members.insert(key, member));
        Ok(())
    }

    async fn get_team_member(&self, team_id: &str, user_id: &str) -> StoreResult<TeamMember> {
        let key = (team_id.to_string(), user_id.to_string());
        self.read(|t| t.team_members.get(&key).cloned())
            .ok_or_else(|| StoreError::not_found("team_member", format!("{}:{}", team_id, user_id)))
    }

    async fn get_team_members_for_user(&self, user_id: &str) -> StoreResult<Vec<TeamMember>> {
        let mut members: Vec<TeamMember> = self.read(|t| {
            t.team_members
                .values()
                .filter(|m| m.user_id == user_id)
                .cloned()
                .collect()
        });
        members.sort_by(|a, b| a.team_id.cmp(&b.team_id));
        Ok(members)
    }

    // -- Channels --

    async fn save_channel(&self, mut channel: Channel) -> StoreResult<Channel> {
        assign_id(&mut channel.id);
        stamp(&mut channel.create_at);
        self.write(|t| {
            let clash = t.channels.values().any(|c| {
                c.id != channel.id
                    && c.team_id == channel.team_id
                    && c.name == channel.name
                    && c.delete_at == 0
            });
            if clash {
                return Err(StoreError::invalid("channel", "name exists in team"));
            }
            t.channels.insert(channel.id.clone(), channel.clone());
            Ok(channel)
        })
    }

    async fn get_channel(&self, id: &str) -> StoreResult<Channel> {
        self.read(|t| t.channels.get(id).cloned())
            .ok_or_else(|| StoreError::not_found("channel", id))
    }

    async fn get_channel_by_name(&self, team_id: &str, name: &str) -> StoreResult<Channel> {
        self.read(|t| {
            t.channels
                .values()
                .find(|c| c.team_id == team_id && c.name == name && c.delete_at == 0)
                .cloned()
        })
        .ok_or_else(|| StoreError::not_found("channel", name))
    }

    async fn get_all_channels(&self) -> StoreResult<Vec<Channel>> {
        let mut channels: Vec<Channel> = self.read(|t| t.channels.values().cloned().collect());
        channels.sort_by(|a, b| (&a.team_id, &a.name).cmp(&(&b.team_id, &b.name)));
        Ok(channels)
    }

    async fn get_or_create_direct_channel(&self, user_a: &str, user_b: &str) -> StoreResult<Channel> {
        let name = Channel::direct_channel_name(user_a, user_b);
        self.write(|t| {
            if let Some(existing) = t
                .channels
                .values()
                .find(|c| c.channel_type == ChannelType::Direct && c.name == name)
            {
                return Ok(existing.clone());
            }
            for id in [user_a, user_b] {
                if !t.users.contains_key(id) {
                    return Err(StoreError::not_found("user", id));
                }
            }
            let channel = Channel {
                id: new_id(),
                create_at: now_millis(),
                channel_type: ChannelType::Direct,
                name,
                ..Default::default()
            };
            for user_id in [user_a, user_b] {
                t.channel_members.insert(
                    (channel.id.clone(), user_id.to_string()),
                    ChannelMember {
                        channel_id: channel.id.clone(),
                        user_id: user_id.to_string(),
                        roles: "channel_user".into(),
                        ..Default::default()
                    },
                );
            }
            t.channels.insert(channel.id.clone(), channel.clone());
            Ok(channel)
        })
    }

    async fn save_channel_member(&self, member: ChannelMember) -> StoreResult<()> {
        let key = (member.channel_id.clone(), member.user_id.clone());
        self.write(|t| t.channel_members.insert(key, member));
        Ok(())
    }

    async fn get_channel_member(&self, channel_id: &str, user_id: &str) -> StoreResult<ChannelMember> {
        let key = (channel_id.to_string(), user_id.to_string());
        self.read(|t| t.channel_members.get(&key).cloned())
            .ok_or_else(|| {
                StoreError::not_found("channel_member", format!("{}:{}", channel_id, user_id))
            })
    }

    async fn get_channel_members(&self, channel_id: &str) -> StoreResult<Vec<ChannelMember>> {
        let mut members: Vec<ChannelMember> = self.read(|t| {
            t.channel_members
                .values()
                .filter(|m| m.channel_id == channel_id)
                .cloned()
                .collect()
        });
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(members)
    }

    async fn get_channel_members_for_user(&self, user_id: &str) -> StoreResult<Vec<ChannelMember>> {
        let mut members: Vec<ChannelMember> = self.read(|t| {
            t.channel_members
                .values()
                .filter(|m| m.user_id == user_id)
                .cloned()
                .collect()
        });
        members.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        Ok(members)
    }

    async fn get_all_channel_ids_for_user(&self, user_id: &str) -> StoreResult<HashSet<String>> {
        Ok(self.read(|t| {
            t.channel_members
                .keys()
                .filter(|(channel_id, u)| {
                    u == user_id
                        && t.channels
                            .get(channel_id)
                            .is_some_and(|c| c.delete_at == 0)
                })
                .map(|(channel_id, _)| channel_id.clone())
                .collect()
        }))
    }

    // -- Posts --

    async fn save_post(&self, mut post: Post) -> StoreResult<Post> {
        assign_id(&mut post.id);
        stamp(&mut post.create_at);
        if post.update_at == 0 {
            post.update_at = post.create_at;
        }
        self.write(|t| {
            if !t.channels.contains_key(&post.channel_id) {
                return Err(StoreError::invalid("post", "unknown channel"));
            }
            t.posts.insert(post.id.clone(), post.clone());
            Ok(post)
        })
    }

    async fn get_post(&self, id: &str) -> StoreResult<Post> {
        self.read(|t| t.posts.get(id).cloned())
            .ok_or_else(|| StoreError::not_found("post", id))
    }

    async fn get_root_posts(&self, channel_id: &str) -> StoreResult<Vec<Post>> {
        let mut posts: Vec<Post> = self.read(|t| {
            t.posts
                .values()
                .filter(|p| p.channel_id == channel_id && p.root_id.is_empty() && p.delete_at == 0)
                .cloned()
                .collect()
        });
        posts.sort_by_key(|p| p.create_at);
        Ok(posts)
    }

    async fn get_post_replies(&self, root_id: &str) -> StoreResult<Vec<Post>> {
        let mut posts: Vec<Post> = self.read(|t| {
            t.posts
                .values()
                .filter(|p| p.root_id == root_id && p.delete_at == 0)
                .cloned()
                .collect()
        });
        posts.sort_by_key(|p| p.create_at);
        Ok(posts)
    }

    // -- Reactions, files, emoji --

    async fn save_reaction(&self, mut reaction: Reaction) -> StoreResult<()> {
        stamp(&mut reaction.create_at);
        self.write(|t| {
            if let Some(post) = t.posts.get_mut(&reaction.post_id) {
                post.has_reactions = true;
            }
            t.reactions.push(reaction);
        });
        Ok(())
    }

    async fn get_reactions(&self, post_id: &str) -> StoreResult<Vec<Reaction>> {
        Ok(self.read(|t| {
            t.reactions
                .iter()
                .filter(|r| r.post_id == post_id)
                .cloned()
                .collect()
        }))
    }

    async fn save_file_info(&self, mut info: FileInfo) -> StoreResult<FileInfo> {
        assign_id(&mut info.id);
        self.write(|t| t.file_infos.insert(info.id.clone(), info.clone()));
        Ok(info)
    }

    async fn get_file_infos(&self, post_id: &str) -> StoreResult<Vec<FileInfo>> {
        let mut infos: Vec<FileInfo> = self.read(|t| {
            t.file_infos
                .values()
                .filter(|f| f.post_id == post_id)
                .cloned()
                .collect()
        });
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(infos)
    }

    async fn save_emoji(&self, mut emoji: Emoji) -> StoreResult<Emoji> {
        assign_id(&mut emoji.id);
        stamp(&mut emoji.create_at);
        self.write(|t| t.emoji.insert(emoji.id.clone(), emoji.clone()));
        Ok(emoji)
    }

    async fn get_all_emoji(&self) -> StoreResult<Vec<Emoji>> {
        let mut emoji: Vec<Emoji> = self.read(|t| {
            t.emoji
                .values()
                .filter(|e| e.delete_at == 0)
                .cloned()
                .collect()
        });
        emoji.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(emoji)
    }

    // -- Commands --

    async fn save_command(&self, mut command: Command) -> StoreResult<Command> {
        if !command.id.is_empty() {
            return Err(StoreError::invalid("command", "id must be empty on save"));
        }
        assign_id(&mut command.id);
        stamp(&mut command.create_at);
        command.update_at = command.create_at;
        if command.token.is_empty() {
            command.token = new_id();
        }
        self.write(|t| t.commands.insert(command.id.clone(), command.clone()));
        Ok(command)
    }

    async fn update_command(&self, mut command: Command) -> StoreResult<Command> {
        command.update_at = now_millis();
        self.write(|t| match t.commands.get_mut(&command.id) {
            Some(slot) => {
                *slot = command.clone();
                Ok(command)
            }
            None => Err(StoreError::not_found("command", command.id.clone())),
        })
    }

    async fn get_command(&self, id: &str) -> StoreResult<Command> {
        self.read(|t| t.commands.get(id).filter(|c| !c.is_deleted()).cloned())
            .ok_or_else(|| StoreError::not_found("command", id))
    }

    async fn get_team_commands(&self, team_id: &str) -> StoreResult<Vec<Command>> {
        let mut commands: Vec<Command> = self.read(|t| {
            t.commands
                .values()
                .filter(|c| c.team_id == team_id && !c.is_deleted())
                .cloned()
                .collect()
        });
        commands.sort_by(|a, b| a.trigger.cmp(&b.trigger));
        Ok(commands)
    }

    async fn delete_command(&self, id: &str, delete_at: i64) -> StoreResult<()> {
        self.write(|t| match t.commands.get_mut(id) {
            Some(c) if !c.is_deleted() => {
                c.delete_at = delete_at;
                c.update_at = delete_at;
                Ok(())
            }
            _ => Err(StoreError::not_found("command", id)),
        })
    }

    // -- Webhooks --

    async fn save_incoming_webhook(&self, mut hook: IncomingWebhook) -> StoreResult<IncomingWebhook> {
        assign_id(&mut hook.id);
        stamp(&mut hook.create_at);
        hook.update_at = hook.create_at;
        self.write(|t| t.incoming_webhooks.insert(hook.id.clone(), hook.clone()));
        Ok(hook)
    }

    async fn get_incoming_webhook(&self, id: &str) -> StoreResult<IncomingWebhook> {
        self.read(|t| t.incoming_webhooks.get(id).filter(|h| h.delete_at == 0).cloned())
            .ok_or_else(|| StoreError::not_found("incoming_webhook", id))
    }

    async fn delete_incoming_webhook(&self, id: &str, delete_at: i64) -> StoreResult<()> {
        self.write(|t| match t.incoming_webhooks.get_mut(id) {
            Some(h) if h.delete_at == 0 => {
                h.delete_at = delete_at;
                Ok(())
            }
            _ => Err(StoreError::not_found("incoming_webhook", id)),
        })
    }

    async fn save_outgoing_webhook(&self, mut hook: OutgoingWebhook) -> StoreResult<OutgoingWebhook> {
        assign_id(&mut hook.id);
        stamp(&mut hook.create_at);
        hook.update_at = hook.create_at;
        if hook.token.is_empty() {
            hook.token = new_id();
        }
        self.write(|t| t.outgoing_webhooks.insert(hook.id.clone(), hook.clone()));
        Ok(hook)
    }

    async fn update_outgoing_webhook(&self, mut hook: OutgoingWebhook) -> StoreResult<OutgoingWebhook> {
        hook.update_at = now_millis();
        self.write(|t| match t.outgoing_webhooks.get_mut(&hook.id) {
            Some(slot) if slot.delete_at == 0 => {
                *slot = hook.clone();
                Ok(hook)
            }
            _ => Err(StoreError::not_found("outgoing_webhook", hook.id.clone())),
        })
    }

    async fn get_outgoing_webhook(&self, id: &str) -> StoreResult<OutgoingWebhook> {
        self.read(|t| t.outgoing_webhooks.get(id).filter(|h| h.delete_at == 0).cloned())
            .ok_or_else(|| StoreError::not_found("outgoing_webhook", id))
    }

    async fn get_team_outgoing_webhooks(&self, team_id: &str) -> StoreResult<Vec<OutgoingWebhook>> {
        let mut hooks: Vec<OutgoingWebhook> = self.read(|t| {
            t.outgoing_webhooks
                .values()
                .filter(|h| h.team_id == team_id && h.delete_at == 0)
                .cloned()
                .collect()
        });
        hooks.sort_by_key(|h| h.create_at);
        Ok(hooks)
    }

    async fn delete_outgoing_webhook(&self, id: &str, delete_at: i64) -> StoreResult<()> {
        self.write(|t| match t.outgoing_webhooks.get_mut(id) {
            Some(h) if h.delete_at == 0 => {
                h.delete_at = delete_at;
                Ok(())
            }
            _ => Err(StoreError::not_found("outgoing_webhook", id)),
        })
    }

    async fn save_command_webhook(&self, mut hook: CommandWebhook) -> StoreResult<CommandWebhook> {
        assign_id(&mut hook.id);
        stamp(&mut hook.create_at);
        if hook.command_id.is_empty() || hook.user_id.is_empty() || hook.channel_id.is_empty() {
            return Err(StoreError::invalid("command_webhook", "missing command, user or channel"));
        }
        self.write(|t| t.command_webhooks.insert(hook.id.clone(), hook.clone()));
        Ok(hook)
    }

    async fn get_command_webhook(&self, id: &str) -> StoreResult<CommandWebhook> {
        self.read(|t| t.command_webhooks.get(id).cloned())
            .ok_or_else(|| StoreError::not_found("command_webhook", id))
    }

    async fn try_use_command_webhook(&self, id: &str, limit: i32) -> StoreResult<()> {
        self.write(|t| match t.command_webhooks.get_mut(id) {
            Some(hook) if hook.use_count < limit => {
                hook.use_count += 1;
                Ok(())
            }
            Some(_) => Err(StoreError::invalid("command_webhook", "use limit reached")),
            None => Err(StoreError::not_found("command_webhook", id)),
        })
    }

    async fn cleanup_command_webhooks(&self, older_than: i64) -> StoreResult<usize> {
        Ok(self.write(|t| {
            let before = t.command_webhooks.len();
            t.command_webhooks.retain(|_, h| h.create_at >= older_than);
            before - t.command_webhooks.len()
        }))
    }
}
