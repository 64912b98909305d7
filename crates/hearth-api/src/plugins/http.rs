use std::net::SocketAddr;

use axum::body::{Body, HttpBody};
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use tracing::{debug, warn};

use hearth_types::api::form_urlencoded_value;
use hearth_types::models::Session;
use hearth_types::new_id;

use super::PluginContext;
use crate::middleware::csrf_passes;
use crate::state::AppStateInner;

pub const HEADER_USER_ID: &str = "Mattermost-User-Id";
pub const HEADER_PLUGIN_ID: &str = "Mattermost-Plugin-ID";
pub const HEADER_CSRF_TOKEN: &str = "X-CSRF-Token";
pub const HEADER_REQUESTED_WITH: &str = "X-Requested-With";
pub const HEADER_REQUESTED_WITH_XML: &str = "XMLHttpRequest";

pub const SESSION_COOKIE_TOKEN: &str = "MMAUTHTOKEN";
pub const SESSION_COOKIE_USER: &str = "MMUSERID";
pub const SESSION_COOKIE_CSRF: &str = "MMCSRF";

/// Upper bound on a body buffered to look for a `csrf` form field.
const MAX_CSRF_BODY: usize = 16 * 1024 * 1024;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Where a request's session token came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Header(String),
    Cookie(String),
    Query(String),
}

impl TokenSource {
    pub fn token(&self) -> &str {
        match self {
            Self::Header(t) | Self::Cookie(t) | Self::Query(t) => t,
        }
    }
}

/// `Authorization: Bearer|Token <t>`, then the session cookie, then `?access_token=`.
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<TokenSource> {
    if let Some(auth) = header_str(headers, header::AUTHORIZATION.as_str()) {
        if auth.len() > 7 && auth[..7].eq_ignore_ascii_case("bearer ") {
            return Some(TokenSource::Header(auth[7..].trim().to_string()));
        }
        if auth.len() > 6 && auth[..6].eq_ignore_ascii_case("token ") {
            return Some(TokenSource::Header(auth[6..].trim().to_string()));
        }
    }
    if let Some(cookie) = CookieJar::from_headers(headers).get(SESSION_COOKIE_TOKEN) {
        if !cookie.value().is_empty() {
            return Some(TokenSource::Cookie(cookie.value().to_string()));
        }
    }
    let query = uri.query()?;
    form_urlencoded_value(query.as_bytes(), "access_token")
        .filter(|t| !t.is_empty())
        .map(TokenSource::Query)
}

fn client_ip(parts: &Parts) -> String {
    if let Some(forwarded) = header_str(&parts.headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_string();
        }
    }
    if let Some(real) = header_str(&parts.headers, "x-real-ip") {
        return real.trim().to_string();
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_default()
}

fn declared_length(parts: &Parts, body: &Body) -> u64 {
    let header = header_str(&parts.headers, header::CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok());
    header.unwrap_or(0).max(body.size_hint().lower())
}

/// Cookie-authenticated writes must prove they came from our client. The
/// body may be consumed looking for a `csrf` field, so a replacement is
/// returned. A body that is too large or unreadable rejects the request.
async fn check_csrf(
    state: &AppStateInner,
    parts: &Parts,
    body: Body,
    session: &Session,
) -> Result<(bool, Body), StatusCode> {
    let (sent, body) = match header_str(&parts.headers, HEADER_CSRF_TOKEN) {
        Some(token) => (token.to_string(), body),
        None => {
            if declared_length(parts, &body) > MAX_CSRF_BODY as u64 {
                return Err(StatusCode::PAYLOAD_TOO_LARGE);
            }
            let bytes = axum::body::to_bytes(body, MAX_CSRF_BODY).await.map_err(|e| {
                warn!("could not buffer plugin request body: {}", e);
                StatusCode::BAD_REQUEST
            })?;
            let is_form = header_str(&parts.headers, header::CONTENT_TYPE.as_str())
                .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
            let sent = if is_form {
                form_urlencoded_value(&bytes, "csrf").unwrap_or_default()
            } else {
                String::new()
            };
            (sent, Body::from(bytes))
        }
    };

    Ok((csrf_passes(state, &parts.headers, session, &sent), body))
}

/// Remove session cookies, keeping every other cookie for the plugin.
fn strip_session_cookies(headers: &mut HeaderMap) {
    let kept: Vec<String> = CookieJar::from_headers(headers)
        .iter()
        .filter(|c| !matches!(c.name(), SESSION_COOKIE_TOKEN | SESSION_COOKIE_USER | SESSION_COOKIE_CSRF))
        .map(|c| format!("{}={}", c.name(), c.value()))
        .collect();
    headers.remove(header::COOKIE);
    if !kept.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
            headers.insert(header::COOKIE, value);
        }
    }
}

/// Strip the site subpath and `/plugins/<id>` from `path`.
pub fn trim_plugin_prefix<'a>(path: &'a str, subpath: &str, plugin_id: &str) -> &'a str {
    let path = match path.strip_prefix(subpath) {
        Some(rest) if !subpath.is_empty() && rest.starts_with('/') => rest,
        _ => path,
    };
    let prefix = format!("/plugins/{}", plugin_id);
    match path.strip_prefix(prefix.as_str()) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    }
}

fn rewrite_uri(uri: &Uri, subpath: &str, plugin_id: &str) -> Uri {
    let path = trim_plugin_prefix(uri.path(), subpath, plugin_id);
    let path = if path.is_empty() { "/" } else { path };
    let query: String = match uri.query() {
        Some(q) => url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(url::form_urlencoded::parse(q.as_bytes()).filter(|(k, _)| k != "access_token"))
            .finish(),
        None => String::new(),
    };
    let target = if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query)
    };
    target.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

/// Hand an HTTP request to a plugin's `serve_http`, authenticating it on
/// the way and stripping anything the plugin must not see.
pub async fn serve_plugin_request(state: &AppStateInner, plugin_id: &str, req: Request<Body>) -> Response {
    let Ok(hooks) = state.plugins.hooks_for_plugin(plugin_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let (mut parts, mut body) = req.into_parts();
    let mut ctx = PluginContext {
        request_id: new_id(),
        ip_address: client_ip(&parts),
        accept_language: header_str(&parts.headers, header::ACCEPT_LANGUAGE.as_str())
            .unwrap_or_default()
            .to_string(),
        user_agent: header_str(&parts.headers, header::USER_AGENT.as_str())
            .unwrap_or_default()
            .to_string(),
        session_id: String::new(),
    };

    // only inter-plugin calls may carry these
    parts.headers.remove(HEADER_PLUGIN_ID);
    parts.headers.remove(HEADER_USER_ID);

    if let Some(source) = extract_token(&parts.headers, &parts.uri) {
        match state.gate.session(source.token()).await {
            Ok(session) => {
                let mut verified = true;
                if matches!(source, TokenSource::Cookie(_)) && parts.method != Method::GET {
                    let (passed, rebuffered) = match check_csrf(state, &parts, body, &session).await {
                        Ok(checked) => checked,
                        Err(status) => return status.into_response(),
                    };
                    body = rebuffered;
                    verified = passed;
                    if !passed {
                        debug!("plugin request for {} dropped its session: csrf mismatch", plugin_id);
                    }
                }
                if verified {
                    if let Ok(value) = HeaderValue::from_str(&session.user_id) {
                        parts.headers.insert(HEADER_USER_ID, value);
                    }
                    ctx.session_id = session.id;
                }
            }
            Err(e) => debug!("plugin request for {} has an invalid session: {}", plugin_id, e),
        }
    }

    strip_session_cookies(&mut parts.headers);
    parts.headers.remove(header::AUTHORIZATION);
    parts.headers.remove(header::REFERER);
    parts.uri = rewrite_uri(&parts.uri, &state.config.subpath(), plugin_id);

    hooks.serve_http(ctx, Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hearth_gateway::SessionGrant;

    use super::*;
    use crate::commands::CommandRegistry;
    use crate::config::Config;
    use crate::plugins::LocalRuntime;
    use crate::plugins::testing::RecordingHooks;
    use crate::testing::Fixture;

    const PLUGIN: &str = "com.example.jira";

    async fn with_plugin() -> (Fixture, Arc<RecordingHooks>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.plugin_settings.directory = dir.path().to_path_buf();
        let runtime = Arc::new(LocalRuntime::new(&config.plugin_settings));
        let hooks = Arc::new(RecordingHooks::default());
        runtime.register_hooks(PLUGIN, hooks.clone());
        runtime.mark_active(PLUGIN);
        let registry = CommandRegistry::with_builtins(&config);
        let fx = Fixture::build(config, registry, Some(runtime)).await;
        (fx, hooks, dir)
    }

    fn cookie_post(fx: &Fixture, body: Body) -> Request<Body> {
        let (token, _) = fx
            .gate
            .issue(SessionGrant { user_id: fx.alice.id.clone(), ..Default::default() })
            .unwrap();
        Request::post(format!("/plugins/{}/api/save", PLUGIN))
            .header(header::COOKIE, format!("{}={}", SESSION_COOKIE_TOKEN, token))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(HEADER_REQUESTED_WITH, HEADER_REQUESTED_WITH_XML)
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn form_body_survives_the_csrf_check() {
        let (fx, hooks, _dir) = with_plugin().await;
        let resp = serve_plugin_request(&fx.state, PLUGIN, cookie_post(&fx, Body::from("issue=42"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"issue=42");

        let seen = hooks.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].2.get("mattermost-user-id"), Some(&fx.alice.id));
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected_not_emptied() {
        let (fx, hooks, _dir) = with_plugin().await;
        let big = vec![b'a'; MAX_CSRF_BODY + 1];
        let resp = serve_plugin_request(&fx.state, PLUGIN, cookie_post(&fx, Body::from(big))).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let mut declared = cookie_post(&fx, Body::from("x"));
        declared
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(MAX_CSRF_BODY as u64 + 1));
        let resp = serve_plugin_request(&fx.state, PLUGIN, declared).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        assert!(hooks.seen.lock().is_empty());
    }

    #[test]
    fn token_sources_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("MMAUTHTOKEN=cookie-token; other=1"));
        let uri: Uri = "/x?access_token=query-token".parse().unwrap();
        assert_eq!(extract_token(&headers, &uri), Some(TokenSource::Cookie("cookie-token".into())));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("BEARER header-token"));
        assert_eq!(extract_token(&headers, &uri), Some(TokenSource::Header("header-token".into())));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("token t2"));
        assert_eq!(extract_token(&headers, &uri), Some(TokenSource::Header("t2".into())));

        assert_eq!(
            extract_token(&HeaderMap::new(), &uri),
            Some(TokenSource::Query("query-token".into()))
        );
        assert_eq!(extract_token(&HeaderMap::new(), &"/x".parse().unwrap()), None);
    }

    #[test]
    fn prefix_trimming() {
        assert_eq!(trim_plugin_prefix("/plugins/jira/api/v1", "", "jira"), "/api/v1");
        assert_eq!(trim_plugin_prefix("/chat/plugins/jira/api", "/chat", "jira"), "/api");
        assert_eq!(trim_plugin_prefix("/plugins/jira", "", "jira"), "");
        assert_eq!(trim_plugin_prefix("/plugins/jirafoo/x", "", "jira"), "/plugins/jirafoo/x");
    }

    #[test]
    fn access_token_is_removed_from_query() {
        let uri: Uri = "/plugins/jira/hook?a=1&access_token=secret&b=2".parse().unwrap();
        let out = rewrite_uri(&uri, "", "jira");
        assert_eq!(out.path(), "/hook");
        assert_eq!(out.query(), Some("a=1&b=2"));
    }

    #[test]
    fn session_cookies_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("MMAUTHTOKEN=t; theme=dark; MMCSRF=c; MMUSERID=u"),
        );
        strip_session_cookies(&mut headers);
        assert_eq!(headers.get(header::COOKIE).unwrap(), "theme=dark");

        let mut only_session = HeaderMap::new();
        only_session.insert(header::COOKIE, HeaderValue::from_static("MMAUTHTOKEN=t"));
        strip_session_cookies(&mut only_session);
        assert!(only_session.get(header::COOKIE).is_none());
    }
}
