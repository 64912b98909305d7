//! Bulk export as newline-delimited JSON, optionally packed into a zip
//! archive together with post attachments and custom emoji images.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use hearth_db::{Store, StoreError};
use hearth_types::models::{Channel, ChannelType, Post, Props, Team};

pub const EXPORT_VERSION: u32 = 1;
pub const ARCHIVE_IMPORT_FILE: &str = "import.jsonl";
const ATTACHMENTS_DIR: &str = "data";
const EMOJI_DIR: &str = "exported_emoji";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("export task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    pub include_attachments: bool,
    pub create_archive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: usize,
    pub files: usize,
    pub missing_files: usize,
}

#[derive(Debug, Serialize)]
pub struct TeamRecord {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub team_type: String,
    pub description: String,
    pub allow_open_invite: bool,
}

#[derive(Debug, Serialize)]
pub struct ChannelRecord {
    pub team: String,
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub header: String,
    pub purpose: String,
}

#[derive(Debug, Serialize)]
pub struct UserChannelRecord {
    pub name: String,
    pub roles: String,
    pub notify_props: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct UserTeamRecord {
    pub name: String,
    pub roles: String,
    pub channels: Vec<UserChannelRecord>,
}

#[derive(Debug, Serialize)]
pub struct UserRecord {
    pub username: String,
    pub email: String,
    pub nickname: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
    pub roles: String,
    pub locale: String,
    pub teams: Vec<UserTeamRecord>,
}

#[derive(Debug, Serialize)]
pub struct ReactionRecord {
    pub user: String,
    pub emoji_name: String,
    pub create_at: i64,
}

#[derive(Debug, Serialize)]
pub struct AttachmentRecord {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ReplyRecord {
    pub user: String,
    pub message: String,
    pub props: Props,
    pub create_at: i64,
    pub reactions: Vec<ReactionRecord>,
    pub attachments: Vec<AttachmentRecord>,
}

#[derive(Debug, Serialize)]
pub struct PostRecord {
    pub team: String,
    pub channel: String,
    pub user: String,
    pub message: String,
    pub props: Props,
    pub create_at: i64,
    pub replies: Vec<ReplyRecord>,
    pub reactions: Vec<ReactionRecord>,
    pub attachments: Vec<AttachmentRecord>,
}

#[derive(Debug, Serialize)]
pub struct DirectChannelRecord {
    pub members: Vec<String>,
    pub header: String,
}

#[derive(Debug, Serialize)]
pub struct DirectPostRecord {
    pub channel_members: Vec<String>,
    pub user: String,
    pub message: String,
    pub props: Props,
    pub create_at: i64,
    pub replies: Vec<ReplyRecord>,
    pub reactions: Vec<ReactionRecord>,
    pub attachments: Vec<AttachmentRecord>,
}

#[derive(Debug, Serialize)]
pub struct EmojiRecord {
    pub name: String,
    pub image: String,
}

/// One line of the export stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportLine {
    Version { version: u32 },
    Team { team: TeamRecord },
    Channel { channel: ChannelRecord },
    User { user: UserRecord },
    Post { post: PostRecord },
    DirectChannel { direct_channel: DirectChannelRecord },
    DirectPost { direct_post: DirectPostRecord },
    Emoji { emoji: EmojiRecord },
}

/// A file to ship with the export: where it is now and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub source: PathBuf,
    pub dest: String,
}

/// Everything read from the store, ready to be written out.
#[derive(Debug, Default)]
pub struct Export {
    pub lines: Vec<ExportLine>,
    pub files: Vec<ExportFile>,
}

pub struct BulkExporter<'a> {
    store: &'a dyn Store,
    file_dir: PathBuf,
}

impl<'a> BulkExporter<'a> {
    /// `file_dir` is the root attachments and emoji images are read from.
    pub fn new(store: &'a dyn Store, file_dir: impl Into<PathBuf>) -> Self {
        Self { store, file_dir: file_dir.into() }
    }

    /// Read the whole store into export lines in import order.
    pub async fn collect(&self, opts: ExportOptions) -> Result<Export, ExportError> {
        let mut export = Export::default();
        export.lines.push(ExportLine::Version { version: EXPORT_VERSION });

        let teams: HashMap<String, Team> = self
            .store
            .get_all_teams()
            .await?
            .into_iter()
            .filter(|t| t.delete_at == 0)
            .map(|t| (t.id.clone(), t))
            .collect();
        let mut team_list: Vec<&Team> = teams.values().collect();
        team_list.sort_by(|a, b| a.name.cmp(&b.name));
        for team in team_list {
            export.lines.push(ExportLine::Team {
                team: TeamRecord {
                    name: team.name.clone(),
                    display_name: team.display_name.clone(),
                    team_type: team.team_type.clone(),
                    description: team.description.clone(),
                    allow_open_invite: team.allow_open_invite,
                },
            });
        }

        let channels: Vec<Channel> = self
            .store
            .get_all_channels()
            .await?
            .into_iter()
            .filter(|c| c.delete_at == 0)
            .collect();
        let (team_channels, direct_channels): (Vec<&Channel>, Vec<&Channel>) = channels
            .iter()
            .partition(|c| matches!(c.channel_type, ChannelType::Open | ChannelType::Private));
        let channels_by_id: HashMap<&str, &Channel> = channels.iter().map(|c| (c.id.as_str(), c)).collect();
        let team_name = |team_id: &str| teams.get(team_id).map(|t| t.name.clone()).unwrap_or_default();

        for channel in team_channels.iter().filter(|c| teams.contains_key(&c.team_id)) {
            export.lines.push(ExportLine::Channel {
                channel: ChannelRecord {
                    team: team_name(&channel.team_id),
                    name: channel.name.clone(),
                    display_name: channel.display_name.clone(),
                    channel_type: channel.channel_type,
                    header: channel.header.clone(),
                    purpose: channel.purpose.clone(),
                },
            });
        }

        let users = self.store.get_all_users().await?;
        let usernames: HashMap<String, String> = users.iter().map(|u| (u.id.clone(), u.username.clone())).collect();
        for user in users.iter().filter(|u| u.delete_at == 0) {
            let mut team_records = Vec::new();
            let memberships = self.store.get_channel_members_for_user(&user.id).await?;
            for member in self.store.get_team_members_for_user(&user.id).await? {
                let Some(team) = teams.get(&member.team_id) else {
                    continue;
                };
                let channels = memberships
                    .iter()
                    .filter_map(|m| {
                        let channel = channels_by_id.get(m.channel_id.as_str())?;
                        (channel.team_id == team.id).then(|| UserChannelRecord {
                            name: channel.name.clone(),
                            roles: m.roles.clone(),
                            notify_props: m.notify_props.clone(),
                        })
                    })
                    .collect();
                team_records.push(UserTeamRecord {
                    name: team.name.clone(),
                    roles: member.roles,
                    channels,
                });
            }
            export.lines.push(ExportLine::User {
                user: UserRecord {
                    username: user.username.clone(),
                    email: user.email.clone(),
                    nickname: user.nickname.clone(),
                    first_name: user.first_name.clone(),
                    last_name: user.last_name.clone(),
                    position: user.position.clone(),
                    roles: user.roles.clone(),
                    locale: user.locale.clone(),
                    teams: team_records,
                },
            });
        }
        let username = |id: &str| usernames.get(id).cloned().unwrap_or_default();

        for channel in team_channels.iter().filter(|c| teams.contains_key(&c.team_id)) {
            for root in self.store.get_root_posts(&channel.id).await? {
                let thread = self.thread(&root, opts, &username, &mut export.files).await?;
                export.lines.push(ExportLine::Post {
                    post: PostRecord {
                        team: team_name(&channel.team_id),
                        channel: channel.name.clone(),
                        user: username(&root.user_id),
                        message: root.message,
                        props: root.props,
                        create_at: root.create_at,
                        replies: thread.replies,
                        reactions: thread.reactions,
                        attachments: thread.attachments,
                    },
                });
            }
        }

        let mut direct_members: HashMap<&str, Vec<String>> = HashMap::new();
        for channel in &direct_channels {
            let mut members: Vec<String> = self
                .store
                .get_channel_members(&channel.id)
                .await?
                .iter()
                .map(|m| username(&m.user_id))
                .collect();
            members.sort();
            export.lines.push(ExportLine::DirectChannel {
                direct_channel: DirectChannelRecord {
                    members: members.clone(),
                    header: channel.header.clone(),
                },
            });
            direct_members.insert(channel.id.as_str(), members);
        }
        for channel in &direct_channels {
            let members = direct_members.get(channel.id.as_str()).cloned().unwrap_or_default();
            for root in self.store.get_root_posts(&channel.id).await? {
                let thread = self.thread(&root, opts, &username, &mut export.files).await?;
                export.lines.push(ExportLine::DirectPost {
                    direct_post: DirectPostRecord {
                        channel_members: members.clone(),
                        user: username(&root.user_id),
                        message: root.message,
                        props: root.props,
                        create_at: root.create_at,
                        replies: thread.replies,
                        reactions: thread.reactions,
                        attachments: thread.attachments,
                    },
                });
            }
        }

        for emoji in self.store.get_all_emoji().await? {
            let dest = format!("{}/{}/image", EMOJI_DIR, emoji.id);
            export.files.push(ExportFile {
                source: self.file_dir.join("emoji").join(&emoji.id).join("image"),
                dest: dest.clone(),
            });
            export.lines.push(ExportLine::Emoji {
                emoji: EmojiRecord { name: emoji.name, image: dest },
            });
        }

        Ok(export)
    }

    async fn reactions(&self, post_id: &str, username: &impl Fn(&str) -> String) -> Result<Vec<ReactionRecord>, ExportError> {
        Ok(self
            .store
            .get_reactions(post_id)
            .await?
            .into_iter()
            .map(|r| ReactionRecord {
                user: username(&r.user_id),
                emoji_name: r.emoji_name,
                create_at: r.create_at,
            })
            .collect())
    }

    /// Attachments belonging to exactly this post.
    async fn attachments(
        &self,
        post_id: &str,
        opts: ExportOptions,
        files: &mut Vec<ExportFile>,
    ) -> Result<Vec<AttachmentRecord>, ExportError> {
        if !opts.include_attachments {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for info in self.store.get_file_infos(post_id).await? {
            files.push(ExportFile {
                source: self.file_dir.join(&info.path),
                dest: format!("{}/{}", ATTACHMENTS_DIR, info.path),
            });
            out.push(AttachmentRecord { path: info.path });
        }
        Ok(out)
    }

    async fn thread(
        &self,
        root: &Post,
        opts: ExportOptions,
        username: &impl Fn(&str) -> String,
        files: &mut Vec<ExportFile>,
    ) -> Result<Thread, ExportError> {
        let mut replies = Vec::new();
        for reply in self.store.get_post_replies(&root.id).await? {
            replies.push(ReplyRecord {
                user: username(&reply.user_id),
                reactions: self.reactions(&reply.id, username).await?,
                attachments: self.attachments(&reply.id, opts, files).await?,
                message: reply.message,
                props: reply.props,
                create_at: reply.create_at,
            });
        }
        Ok(Thread {
            replies,
            reactions: self.reactions(&root.id, username).await?,
            attachments: self.attachments(&root.id, opts, files).await?,
        })
    }
}

struct Thread {
    replies: Vec<ReplyRecord>,
    reactions: Vec<ReactionRecord>,
    attachments: Vec<AttachmentRecord>,
}

/// Write one JSON object per line.
pub fn write_lines<W: Write>(lines: &[ExportLine], writer: W) -> Result<usize, ExportError> {
    let mut writer = BufWriter::new(writer);
    for line in lines {
        serde_json::to_writer(&mut writer, line)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(lines.len())
}

/// Records to `writer`, files copied below `out_dir`. Missing source files
/// are logged and skipped.
pub fn write_export<W: Write>(export: &Export, writer: W, out_dir: &Path) -> Result<ExportSummary, ExportError> {
    let mut summary = ExportSummary {
        records: write_lines(&export.lines, writer)?,
        ..Default::default()
    };
    for file in &export.files {
        if !file.source.is_file() {
            warn!("export: missing file {}", file.source.display());
            summary.missing_files += 1;
            continue;
        }
        let dest = out_dir.join(&file.dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file.source, &dest)?;
        summary.files += 1;
    }
    info!("export: {} records, {} files", summary.records, summary.files);
    Ok(summary)
}

/// Records as `import.jsonl` plus every file, stored uncompressed, in one zip.
pub fn write_archive<W: Write + Seek>(export: &Export, writer: W) -> Result<ExportSummary, ExportError> {
    let mut zip = ZipWriter::new(writer);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file(ARCHIVE_IMPORT_FILE, SimpleFileOptions::default())?;
    let mut summary = ExportSummary {
        records: write_lines(&export.lines, &mut zip)?,
        ..Default::default()
    };
    for file in &export.files {
        let mut source = match File::open(&file.source) {
            Ok(f) => f,
            Err(e) => {
                warn!("export: missing file {}: {}", file.source.display(), e);
                summary.missing_files += 1;
                continue;
            }
        };
        zip.start_file(file.dest.as_str(), stored)?;
        io::copy(&mut source, &mut zip)?;
        summary.files += 1;
    }
    zip.finish()?;
    info!("export archive: {} records, {} files", summary.records, summary.files);
    Ok(summary)
}

/// Collect and write an export under `out_dir`: `<name>.zip` when archiving,
/// otherwise `<name>.jsonl` plus the copied files. Only collection runs on
/// the async runtime; file writes go to the blocking pool.
pub async fn run_export(
    store: &dyn Store,
    file_dir: &Path,
    out_dir: &Path,
    name: &str,
    opts: ExportOptions,
) -> Result<(PathBuf, ExportSummary), ExportError> {
    let export = BulkExporter::new(store, file_dir).collect(opts).await?;
    let out_dir = out_dir.to_path_buf();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || write_to_dir(&export, &out_dir, &name, opts.create_archive)).await?
}

fn write_to_dir(
    export: &Export,
    out_dir: &Path,
    name: &str,
    create_archive: bool,
) -> Result<(PathBuf, ExportSummary), ExportError> {
    fs::create_dir_all(out_dir)?;
    if create_archive {
        let path = out_dir.join(format!("{}.zip", name));
        let summary = write_archive(export, File::create(&path)?)?;
        Ok((path, summary))
    } else {
        let path = out_dir.join(format!("{}.jsonl", name));
        let summary = write_export(export, File::create(&path)?, out_dir)?;
        Ok((path, summary))
    }
}
