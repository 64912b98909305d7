use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::debug;

use crate::state::AppStateInner;

/// Lexically clean a slash-separated path: collapse `//`, drop `.`, resolve
/// `..` against earlier segments. Rooted paths never climb above `/`.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|s| *s != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            s => out.push(s),
        }
    }
    let joined = out.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// The part of `path` below `/plugins/<id>/public/`, after cleaning.
pub fn public_relative_path(path: &str, subpath: &str, plugin_id: &str) -> Option<String> {
    if path.ends_with('/') {
        return None;
    }
    let cleaned = clean_path(path);
    let local = format!("/plugins/{}/public/", plugin_id);
    let with_subpath = format!("{}{}", subpath, local);
    let relative = cleaned
        .strip_prefix(with_subpath.as_str())
        .or_else(|| cleaned.strip_prefix(local.as_str()))?;
    if relative.is_empty() {
        return None;
    }
    Some(relative.to_string())
}

/// Serve `/plugins/<id>/public/<relative>` from the plugin's public directory.
pub async fn serve_public_file(state: &AppStateInner, plugin_id: &str, req: Request<Body>) -> Response {
    let Some(relative) = public_relative_path(req.uri().path(), &state.config.subpath(), plugin_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let root = match state.plugins.public_files_path(plugin_id) {
        Ok(root) => root,
        Err(e) => {
            debug!("public file for {} refused: {}", plugin_id, e);
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    match ServeFile::new(root.join(relative)).oneshot(req).await {
        Ok(resp) => resp.map(Body::new),
        Err(never) => match never {},
    }
}
