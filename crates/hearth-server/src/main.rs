use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use hearth_api::commands::CommandRegistry;
use hearth_api::plugins::{LocalRuntime, PluginFacade, PluginRuntime};
use hearth_api::webhooks::command_hook;
use hearth_api::{AppState, AppStateInner, Config};
use hearth_db::{MemoryStore, Store};
use hearth_gateway::{JwtSessionGate, PumpMode, SessionGrant};
use hearth_types::models::{SYSTEM_ADMIN_ROLE, User};

/// How often expired command webhooks are swept.
const COMMAND_WEBHOOK_SWEEP: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=debug,hearth_api=debug,hearth_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let jwt_secret = std::env::var("HEARTH_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let session_hours: i64 = std::env::var("HEARTH_SESSION_HOURS")
        .unwrap_or_else(|_| "720".into())
        .parse()?;
    let host = std::env::var("HEARTH_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("HEARTH_PORT")
        .unwrap_or_else(|_| "8065".into())
        .parse()?;
    let mode = match std::env::var("HEARTH_PUMP_MODE") {
        Ok(raw) => raw.parse::<PumpMode>().map_err(anyhow::Error::msg)?,
        Err(_) => PumpMode::detect(),
    };

    let store = Arc::new(MemoryStore::new());
    let gate = Arc::new(JwtSessionGate::new(&jwt_secret, chrono::Duration::hours(session_hours)));
    if let Ok(username) = std::env::var("HEARTH_BOOTSTRAP_ADMIN") {
        bootstrap_admin(&store, &gate, &username).await?;
    }
    let commands = CommandRegistry::with_builtins(&config);
    let runtime: Option<Arc<dyn PluginRuntime>> = if config.plugin_settings.enable {
        Some(Arc::new(LocalRuntime::new(&config.plugin_settings)))
    } else {
        None
    };
    let plugins = PluginFacade::new(config.plugin_settings.clone(), runtime);

    let state = AppStateInner::new(config, store, gate, commands, plugins, mode)?;
    tokio::spawn(sweep_command_webhooks(state.clone()));

    let app = hearth_api::handlers::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Hearth server listening on {} ({:?} websocket readers)", addr, mode);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Create a system admin and log a session token for it, so a fresh
/// in-memory instance can be driven over HTTP.
async fn bootstrap_admin(store: &MemoryStore, gate: &JwtSessionGate, username: &str) -> anyhow::Result<()> {
    let user = store
        .save_user(User {
            username: username.to_string(),
            roles: format!("system_user {}", SYSTEM_ADMIN_ROLE),
            locale: "en".into(),
            ..Default::default()
        })
        .await?;
    let (token, _) = gate.issue(SessionGrant {
        user_id: user.id.clone(),
        roles: vec!["system_user".into(), SYSTEM_ADMIN_ROLE.into()],
        ..Default::default()
    })?;
    info!("bootstrap admin {} ({}) token: {}", username, user.id, token);
    Ok(())
}

async fn sweep_command_webhooks(state: AppState) {
    let mut ticker = tokio::time::interval(COMMAND_WEBHOOK_SWEEP);
    loop {
        ticker.tick().await;
        match command_hook::cleanup_command_webhooks(&state).await {
            Ok(0) => {}
            Ok(n) => info!("removed {} expired command webhooks", n),
            Err(e) => warn!("command webhook cleanup failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
