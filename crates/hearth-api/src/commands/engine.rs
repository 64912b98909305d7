use tracing::{debug, info};

use hearth_types::models::{CommandArgs, CommandResponse, CommandWebhook};

use super::outbound::do_command_request;
use super::response::handle_command_response;
use super::PostSource;
use crate::error::AppError;
use crate::mentions::{self, mention_form_pairs};
use crate::state::AppState;
use crate::webhooks::command_hook::create_command_webhook;

const LOC: &str = "execute_command";

/// Split `/trigger rest` at the first whitespace. The trigger comes back
/// lowercased without its slash.
fn parse_command(text: &str) -> Result<(String, &str), AppError> {
    let text = text.trim_start();
    let (trigger, message) = match text.split_once(char::is_whitespace) {
        Some((trigger, message)) => (trigger, message),
        None => (text, ""),
    };
    let trigger = trigger.to_lowercase();
    match trigger.strip_prefix('/') {
        Some(name) if !name.is_empty() => Ok((name.to_string(), message)),
        _ => Err(AppError::bad_request(LOC, "api.command.execute_command.format.app_error", trigger)),
    }
}

/// Run a slash command. Plugins win over the team's custom commands, which
/// win over built-ins.
pub async fn execute_command(state: &AppState, mut args: CommandArgs) -> Result<CommandResponse, AppError> {
    let (trigger, message) = parse_command(&args.command)?;
    let message = message.to_string();
    if args.site_url.is_empty() {
        args.site_url = state.config.service_settings.site_url.clone();
    }

    let (client_trigger_id, trigger_id) = state.trigger_ids.generate_trigger_id(&args.user_id);
    args.trigger_id = trigger_id;

    if let Some((command, mut response)) = state.plugins.try_execute_command(&args).await? {
        debug!("/{} handled by plugin {}", trigger, command.plugin_id);
        response.trigger_id = client_trigger_id;
        return handle_command_response(state, &command, &args, response, PostSource::Plugin).await;
    }

    if state.config.service_settings.enable_commands {
        if let Some(response) = try_execute_custom_command(state, &args, &trigger, &message).await? {
            return Ok(response);
        }
    }

    if let Some(provider) = state.commands.get(&trigger) {
        let command = provider.command(&args.locale);
        let response = provider.do_command(state, &args, &message).await;
        return handle_command_response(state, &command, &args, response, PostSource::BuiltIn).await;
    }

    Err(AppError::not_found(LOC, "api.command.execute_command.not_found.app_error", trigger))
}

async fn try_execute_custom_command(
    state: &AppState,
    args: &CommandArgs,
    trigger: &str,
    message: &str,
) -> Result<Option<CommandResponse>, AppError> {
    let store = state.store.as_ref();
    let (channel, team, user) = tokio::join!(
        store.get_channel(&args.channel_id),
        store.get_team(&args.team_id),
        store.get_user(&args.user_id),
    );
    let channel = channel.map_err(|e| AppError::from_store(LOC, "api.command.execute_command.channel.app_error", e))?;
    let team = team.map_err(|e| AppError::from_store(LOC, "api.command.execute_command.team.app_error", e))?;
    let user = user.map_err(|e| AppError::from_store(LOC, "api.command.execute_command.user.app_error", e))?;

    let team_commands = store
        .get_team_commands(&args.team_id)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.execute_command.commands.app_error", e))?;
    let Some(command) = team_commands
        .into_iter()
        .find(|c| !c.is_deleted() && c.trigger == trigger)
    else {
        return Ok(None);
    };

    let (user_mentions, channel_mentions) = tokio::join!(
        mentions::user_mentions(state.store.clone(), message, &args.team_id),
        mentions::channel_mentions(state.store.clone(), message, &args.team_id),
    );

    let hook = create_command_webhook(
        state,
        CommandWebhook {
            command_id: command.id.clone(),
            user_id: args.user_id.clone(),
            channel_id: args.channel_id.clone(),
            root_id: args.root_id.clone(),
            parent_id: args.parent_id.clone(),
            ..Default::default()
        },
    )
    .await?;

    let mut form: Vec<(String, String)> = vec![
        ("token".into(), command.token.clone()),
        ("team_id".into(), team.id),
        ("team_domain".into(), team.name),
        ("channel_id".into(), channel.id),
        ("channel_name".into(), channel.name),
        ("user_id".into(), user.id),
        ("user_name".into(), user.username),
        ("command".into(), format!("/{}", trigger)),
        ("text".into(), message.to_string()),
        ("trigger_id".into(), args.trigger_id.clone()),
    ];
    form.extend(mention_form_pairs("user", &user_mentions));
    form.extend(mention_form_pairs("channel", &channel_mentions));
    form.push((
        "response_url".into(),
        format!("{}/hooks/commands/{}", args.site_url.trim_end_matches('/'), hook.id),
    ));

    info!("executing custom command /{} for team {}", trigger, args.team_id);
    let response = do_command_request(&state.http, &command, &form).await?;
    handle_command_response(state, &command, args, response, PostSource::Custom)
        .await
        .map(Some)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use httpmock::prelude::*;

    use hearth_types::events::{EVENT_EPHEMERAL_MESSAGE, EVENT_POSTED};
    use hearth_types::models::{Command, Post, ResponseType};

    use super::*;
    use crate::commands::{CommandProvider, CommandRegistry};
    use crate::config::Config;
    use crate::error::ErrorKind;
    use crate::plugins::testing::RecordingHooks;
    use crate::plugins::{LocalRuntime, PluginRuntime};
    use crate::state::AppStateInner;
    use crate::testing::Fixture;

    struct HelloProvider;

    #[async_trait]
    impl CommandProvider for HelloProvider {
        fn trigger(&self) -> &'static str {
            "hello"
        }

        fn command(&self, _locale: &str) -> Command {
            Command { trigger: "hello".into(), ..Default::default() }
        }

        async fn do_command(&self, _state: &AppStateInner, _args: &CommandArgs, message: &str) -> CommandResponse {
            CommandResponse::ephemeral(format!("Hi, {}", message))
        }
    }

    async fn fixture_with_hello(config: Config, runtime: Option<Arc<dyn PluginRuntime>>) -> Fixture {
        let mut registry = CommandRegistry::with_builtins(&config);
        registry.register(Arc::new(HelloProvider));
        Fixture::build(config, registry, runtime).await
    }

    fn args(fx: &Fixture, command: &str) -> CommandArgs {
        CommandArgs {
            command: command.into(),
            user_id: fx.alice.id.clone(),
            channel_id: fx.town.id.clone(),
            team_id: fx.team.id.clone(),
            ..Default::default()
        }
    }

    fn decode(event: &hearth_types::events::WebSocketEvent) -> Post {
        serde_json::from_str(event.data["post"].as_str().unwrap()).unwrap()
    }

    async fn save_custom(fx: &Fixture, trigger: &str, url: String) -> Command {
        fx.store()
            .save_command(Command {
                team_id: fx.team.id.clone(),
                trigger: trigger.into(),
                url,
                username: "jira-bot".into(),
                creator_id: fx.alice.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[test]
    fn parsing() {
        assert_eq!(parse_command("/Hello  world").unwrap(), ("hello".to_string(), " world"));
        assert_eq!(parse_command("/me").unwrap(), ("me".to_string(), ""));
        assert_eq!(parse_command("hello").unwrap_err().kind, ErrorKind::BadRequest);
        assert_eq!(parse_command("/").unwrap_err().kind, ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn builtin_reply_is_ephemeral() {
        let fx = fixture_with_hello(Config::default(), None).await;
        let (_conn, mut rx) = fx.connect(&fx.alice).await;

        let resp = execute_command(&fx.state, args(&fx, "/hello world")).await.unwrap();
        assert_eq!(resp.text, "Hi, world");
        assert_eq!(resp.response_type, ResponseType::Ephemeral);

        let event = Fixture::next_event(&mut rx).await;
        assert_eq!(event.event, EVENT_EPHEMERAL_MESSAGE);
        assert_eq!(event.broadcast.user_id, fx.alice.id);
        let post = decode(&event);
        assert_eq!(post.message, "Hi, world");
        assert_eq!(post.post_type, "");
        assert!(post.prop_str("from_webhook").is_none());
    }

    #[tokio::test]
    async fn unknown_trigger_is_not_found() {
        let fx = Fixture::new().await;
        let err = execute_command(&fx.state, args(&fx, "/nope")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.id, "api.command.execute_command.not_found.app_error");
    }

    #[tokio::test]
    async fn custom_command_round_trip() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("authorization", "Token jira-token")
                    .body_includes("command=%2Fjira")
                    .body_includes("text=create+bug")
                    .body_includes("team_domain=core")
                    .body_includes("user_name=alice")
                    .body_includes("user_mentions=bob")
                    .body_includes("response_url=");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"response_type":"in_channel","text":"created"}"#);
            })
            .await;

        let mut config = Config::default();
        config.service_settings.enable_post_username_override = true;
        let fx = Fixture::with_config(config).await;
        fx.store()
            .save_command(Command {
                team_id: fx.team.id.clone(),
                trigger: "jira".into(),
                url: server.url("/hook"),
                token: "jira-token".into(),
                username: "jira-bot".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let (_conn, mut rx) = fx.connect(&fx.bob).await;

        let resp = execute_command(&fx.state, args(&fx, "/jira create bug for @bob")).await.unwrap();
        mock.assert_async().await;
        assert_eq!(resp.text, "created");

        let post = decode(&*Fixture::next_event_of(&mut rx, EVENT_POSTED).await);
        assert_eq!(post.message, "created");
        assert_eq!(post.channel_id, fx.town.id);
        assert_eq!(post.prop_str("from_webhook"), Some("true"));
        assert_eq!(post.prop_str("override_username"), Some("jira-bot"));
    }

    #[tokio::test]
    async fn custom_beats_builtin_and_plugin_beats_custom() {
        let server = MockServer::start_async().await;
        let custom = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(200).header("content-type", "text/plain").body("from custom");
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.plugin_settings.directory = dir.path().to_path_buf();
        let runtime = Arc::new(LocalRuntime::new(&config.plugin_settings));
        runtime.register_hooks(
            "com.example.hello",
            Arc::new(RecordingHooks { response: CommandResponse::ephemeral("from plugin"), ..Default::default() }),
        );
        runtime.mark_active("com.example.hello");
        let fx = fixture_with_hello(config, Some(runtime)).await;

        // built-in only
        let resp = execute_command(&fx.state, args(&fx, "/hello there")).await.unwrap();
        assert_eq!(resp.text, "Hi, there");

        // a custom command with the same trigger takes over
        save_custom(&fx, "hello", server.url("/hook")).await;
        let resp = execute_command(&fx.state, args(&fx, "/hello there")).await.unwrap();
        assert_eq!(resp.text, "from custom");
        custom.assert_async().await;

        // and a plugin command takes over from both
        fx.state
            .plugins
            .register_command("com.example.hello", Command { trigger: "hello".into(), ..Default::default() })
            .unwrap();
        let resp = execute_command(&fx.state, args(&fx, "/hello there")).await.unwrap();
        assert_eq!(resp.text, "from plugin");
        assert!(!resp.trigger_id.is_empty());
        custom.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn disabled_commands_fall_through_to_builtins() {
        let server = MockServer::start_async().await;
        let custom = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(200).body("from custom");
            })
            .await;

        let mut config = Config::default();
        config.service_settings.enable_commands = false;
        let fx = fixture_with_hello(config, None).await;
        save_custom(&fx, "hello", server.url("/hook")).await;

        let resp = execute_command(&fx.state, args(&fx, "/hello x")).await.unwrap();
        assert_eq!(resp.text, "Hi, x");
        custom.assert_calls_async(0).await;
    }

    #[tokio::test]
    async fn custom_command_creates_a_response_url() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hook").body_includes("response_url=http%3A%2F%2Flocalhost%3A8065%2Fhooks%2Fcommands%2F");
                then.status(200).body("ok");
            })
            .await;

        let fx = Fixture::new().await;
        save_custom(&fx, "jira", server.url("/hook")).await;
        let resp = execute_command(&fx.state, args(&fx, "/jira")).await.unwrap();
        assert_eq!(resp.text, "ok");
    }
}
