use std::collections::HashMap;

use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, Request, State, WebSocketUpgrade},
    http::{HeaderMap, Method, Uri, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use hearth_gateway::connection;
use hearth_types::api::{ExecuteCommandRequest, IncomingWebhookRequest};
use hearth_types::models::{CommandArgs, CommandResponse, Session};
use hearth_types::now_millis;

use crate::commands;
use crate::error::AppError;
use crate::export::{self, ExportOptions};
use crate::middleware::require_session;
use crate::plugins::http::{extract_token, serve_plugin_request};
use crate::plugins::public::serve_public_file;
use crate::state::AppState;
use crate::webhooks::{command_hook, incoming};

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Every route of the integration core.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v4/commands/execute", post(execute_command))
        .route("/api/v4/exports", post(create_export))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .merge(protected)
        .route("/hooks/commands/{hook_id}", post(command_webhook))
        .route("/hooks/{hook_id}", post(incoming_webhook))
        .route("/plugins/{plugin_id}", any(plugin_request))
        .route("/plugins/{plugin_id}/{*path}", any(plugin_request))
        .route("/api/v4/websocket", get(websocket))
        .with_state(state)
}

async fn execute_command(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<ExecuteCommandRequest>,
) -> Result<Json<CommandResponse>, AppError> {
    const LOC: &str = "execute_command";
    if req.channel_id.is_empty() {
        return Err(AppError::bad_request(LOC, "api.context.invalid_param.app_error", "channel_id"));
    }

    let channel = state
        .store
        .get_channel(&req.channel_id)
        .await
        .map_err(|e| AppError::from_store(LOC, "api.command.execute_command.channel.app_error", e))?;
    // direct and group channels have no team; the client says which one it is in
    let team_id = if channel.team_id.is_empty() { req.team_id } else { channel.team_id.clone() };

    let allowed = if channel.is_open() {
        state.store.get_team_member(&team_id, &session.user_id).await.is_ok()
    } else {
        state.store.get_channel_member(&channel.id, &session.user_id).await.is_ok()
    };
    if !allowed {
        return Err(AppError::forbidden(LOC, "api.context.permissions.app_error", channel.id));
    }

    let locale = state
        .store
        .get_user(&session.user_id)
        .await
        .map(|u| u.locale)
        .unwrap_or_default();
    let args = CommandArgs {
        command: req.command,
        channel_id: channel.id,
        team_id,
        user_id: session.user_id,
        root_id: req.root_id,
        parent_id: req.parent_id,
        site_url: state.config.service_settings.site_url.clone(),
        locale,
        ..Default::default()
    };
    let response = commands::execute_command(&state, args).await?;
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExportQuery {
    include_attachments: bool,
    create_archive: bool,
}

#[derive(Debug, Serialize)]
struct ExportResult {
    path: String,
    records: usize,
    files: usize,
    missing_files: usize,
}

/// Write a bulk export into the configured export directory. Admins only.
async fn create_export(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<ExportResult>, AppError> {
    const LOC: &str = "create_export";
    if !session.is_system_admin() {
        return Err(AppError::forbidden(LOC, "api.context.permissions.app_error", session.user_id));
    }
    let opts = ExportOptions {
        include_attachments: query.include_attachments,
        create_archive: query.create_archive,
    };
    let name = format!("{}_export", now_millis());
    let (path, summary) = export::run_export(
        state.store.as_ref(),
        &state.config.file_settings.directory,
        &state.config.export_settings.directory,
        &name,
        opts,
    )
    .await
    .map_err(|e| {
        error!("export {} failed: {}", name, e);
        AppError::internal(LOC, "app.export.run.app_error", e.to_string())
    })?;
    info!("export written to {}", path.display());

    Ok(Json(ExportResult {
        path: path.display().to_string(),
        records: summary.records,
        files: summary.files,
        missing_files: summary.missing_files,
    }))
}

async fn incoming_webhook(
    State(state): State<AppState>,
    Path(hook_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, AppError> {
    let req = IncomingWebhookRequest::parse(content_type(&headers), &body).ok_or_else(|| {
        AppError::bad_request("incoming_webhook", "web.incoming_webhook.parse.app_error", hook_id.clone())
    })?;
    incoming::handle_incoming_webhook(&state, &hook_id, req).await?;
    Ok("ok")
}

async fn command_webhook(
    State(state): State<AppState>,
    Path(hook_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, AppError> {
    let response = CommandResponse::from_http_body(content_type(&headers), &body).ok_or_else(|| {
        AppError::bad_request("command_webhook", "web.command_webhook.parse.app_error", hook_id.clone())
    })?;
    command_hook::handle_command_webhook(&state, &hook_id, response).await?;
    Ok("ok")
}

/// `GET /plugins/<id>/public/...` is a static file; anything else goes to
/// the plugin itself.
async fn plugin_request(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request<Body>,
) -> Response {
    let plugin_id = params.get("plugin_id").cloned().unwrap_or_default();
    let is_public = params.get("path").is_some_and(|p| p.starts_with("public/"));
    if is_public && req.method() == Method::GET {
        return serve_public_file(&state, &plugin_id, req).await;
    }
    serve_plugin_request(&state, &plugin_id, req).await
}

async fn websocket(State(state): State<AppState>, headers: HeaderMap, uri: Uri, ws: WebSocketUpgrade) -> Response {
    let token = extract_token(&headers, &uri).map(|source| source.token().to_string());
    let locale = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split([',', ';', '-']).next())
        .filter(|l| !l.is_empty())
        .unwrap_or("en")
        .to_string();
    debug!("websocket upgrade, token present: {}", token.is_some());

    let ctx = state.conn.clone();
    ws.max_message_size(ctx.config.max_message_size)
        .on_upgrade(move |socket| connection::handle_socket(socket, ctx, locale, token))
        .into_response()
}
