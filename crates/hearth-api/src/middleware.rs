use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use hearth_types::models::Session;

use crate::error::AppError;
use crate::plugins::http::{HEADER_CSRF_TOKEN, HEADER_REQUESTED_WITH, HEADER_REQUESTED_WITH_XML, TokenSource, extract_token};
use crate::state::{AppState, AppStateInner};

/// Whether `sent` proves the request came from our own client. A bare
/// `X-Requested-With: XMLHttpRequest` is still accepted unless strict
/// enforcement is on.
pub(crate) fn csrf_passes(state: &AppStateInner, headers: &HeaderMap, session: &Session, sent: &str) -> bool {
    if !session.csrf_token.is_empty() && sent == session.csrf_token {
        return true;
    }
    let xhr = headers.get(HEADER_REQUESTED_WITH).and_then(|v| v.to_str().ok()) == Some(HEADER_REQUESTED_WITH_XML);
    if !xhr {
        return false;
    }
    warn!(
        session_id = %session.id,
        user_id = %session.user_id,
        "CSRF check failed; send a CSRF header or form field instead of X-Requested-With"
    );
    !state.config.service_settings.experimental_strict_csrf_enforcement
}

/// Resolve the caller's session and put it in the request extensions.
/// Cookie sessions must also pass the CSRF check on anything but GET.
pub async fn require_session(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, AppError> {
    const LOC: &str = "require_session";
    let source = extract_token(req.headers(), req.uri())
        .ok_or_else(|| AppError::unauthorized(LOC, "api.context.session_expired.app_error", "no token"))?;
    let session = state
        .gate
        .session(source.token())
        .await
        .map_err(|e| AppError::unauthorized(LOC, "api.context.session_expired.app_error", e.to_string()))?;

    if matches!(source, TokenSource::Cookie(_)) && req.method() != Method::GET {
        let sent = req
            .headers()
            .get(HEADER_CSRF_TOKEN)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !csrf_passes(&state, req.headers(), &session, sent) {
            debug!("{} {}: csrf check failed for session {}", req.method(), req.uri().path(), session.id);
            return Err(AppError::unauthorized(LOC, "api.context.session_expired.app_error", "csrf"));
        }
    }

    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}
