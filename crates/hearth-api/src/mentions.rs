//! `@user` and `~channel` resolution for custom command payloads.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::mpsc;
use tracing::debug;

use hearth_db::Store;

static AT_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\B@([[:alnum:]][[:alnum:]\.\-_:]*)").expect("invalid mention regex"));

static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\B~([a-zA-Z0-9\-_]+)").expect("invalid channel mention regex"));

/// Mentioned name -> id.
pub type MentionMap = HashMap<String, String>;

fn is_trailing_punctuation(c: char) -> bool {
    matches!(c, '.' | '-' | '_' | ':')
}

fn candidates(re: &Regex, message: &str) -> BTreeSet<String> {
    re.captures_iter(message)
        .map(|c| c[1].to_lowercase())
        .collect()
}

/// Users mentioned as `@name` who belong to `team_id`. A name that does not
/// resolve is retried with trailing punctuation removed one char at a time.
pub async fn user_mentions(store: Arc<dyn Store>, message: &str, team_id: &str) -> MentionMap {
    let names = candidates(&AT_MENTION, message);
    if names.is_empty() {
        return MentionMap::new();
    }

    let (tx, mut rx) = mpsc::channel(names.len());
    for name in names {
        let tx = tx.clone();
        let store = store.clone();
        let team_id = team_id.to_string();
        tokio::spawn(async move {
            let mut candidate = name.as_str();
            loop {
                if let Ok(user) = store.get_user_by_username(candidate).await {
                    if store.get_team_member(&team_id, &user.id).await.is_ok() {
                        let _ = tx.send((candidate.to_string(), user.id)).await;
                    }
                    return;
                }
                match candidate.strip_suffix(is_trailing_punctuation) {
                    Some(shorter) if !shorter.is_empty() => candidate = shorter,
                    _ => return,
                }
            }
        });
    }
    drop(tx);

    let mut found = MentionMap::new();
    while let Some((name, id)) = rx.recv().await {
        found.insert(name, id);
    }
    debug!("resolved {} user mentions", found.len());
    found
}

/// Open channels of `team_id` mentioned as `~name`.
pub async fn channel_mentions(store: Arc<dyn Store>, message: &str, team_id: &str) -> MentionMap {
    let names = candidates(&CHANNEL_MENTION, message);
    if names.is_empty() {
        return MentionMap::new();
    }

    let (tx, mut rx) = mpsc::channel(names.len());
    for name in names {
        let tx = tx.clone();
        let store = store.clone();
        let team_id = team_id.to_string();
        tokio::spawn(async move {
            if let Ok(channel) = store.get_channel_by_name(&team_id, &name).await {
                if channel.is_open() {
                    let _ = tx.send((name, channel.id)).await;
                }
            }
        });
    }
    drop(tx);

    let mut found = MentionMap::new();
    while let Some((name, id)) = rx.recv().await {
        found.insert(name, id);
    }
    found
}

/// Paired `<prefix>_mentions` / `<prefix>_mentions_ids` form values, in a
/// stable order so each name lines up with its id.
pub fn mention_form_pairs(prefix: &str, mentions: &MentionMap) -> Vec<(String, String)> {
    let mut entries: Vec<(&String, &String)> = mentions.iter().collect();
    entries.sort();
    let mut pairs = Vec::with_capacity(entries.len() * 2);
    for (name, id) in entries {
        pairs.push((format!("{}_mentions", prefix), name.clone()));
        pairs.push((format!("{}_mentions_ids", prefix), id.clone()));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use hearth_types::models::User;

    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn candidate_extraction() {
        let names = candidates(&AT_MENTION, "hi @Alice and @bob. also me@example.com");
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["alice", "bob."]);

        let channels = candidates(&CHANNEL_MENTION, "see ~town-square and a~b");
        assert_eq!(channels.into_iter().collect::<Vec<_>>(), vec!["town-square"]);
    }

    #[tokio::test]
    async fn users_resolve_with_punctuation_trimmed() {
        let fx = Fixture::new().await;
        let found = user_mentions(fx.state.store.clone(), "ping @alice: and @bob.. and @nobody", &fx.team.id).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found["alice"], fx.alice.id);
        assert_eq!(found["bob"], fx.bob.id);
    }

    #[tokio::test]
    async fn users_outside_the_team_are_dropped() {
        let fx = Fixture::new().await;
        fx.store()
            .save_user(User { username: "carol".into(), ..Default::default() })
            .await
            .unwrap();
        let found = user_mentions(fx.state.store.clone(), "@carol @alice", &fx.team.id).await;
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[tokio::test]
    async fn only_open_channels_resolve() {
        let fx = Fixture::new().await;
        let found = channel_mentions(fx.state.store.clone(), "~town-square ~secret ~missing", &fx.team.id).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found["town-square"], fx.town.id);
    }

    #[test]
    fn form_pairs_line_up() {
        let mut map = MentionMap::new();
        map.insert("bob".into(), "b1".into());
        map.insert("alice".into(), "a1".into());
        let pairs = mention_form_pairs("user", &map);
        assert_eq!(
            pairs,
            vec![
                ("user_mentions".to_string(), "alice".to_string()),
                ("user_mentions_ids".to_string(), "a1".to_string()),
                ("user_mentions".to_string(), "bob".to_string()),
                ("user_mentions_ids".to_string(), "b1".to_string()),
            ]
        );
    }
}
