//! Admin route handlers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::Uri;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use chrono::{DateTime, Local};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::fs;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info};

use recproxy_core::ClientAddress;

use crate::error::{AdminError, Result};
use crate::models::{ClearResponse, ListingEntry};
use crate::state::AdminState;

/// Token that turns any admin request into a clear.
pub const CLEAR_TOKEN: &str = "clear";

/// Characters escaped in listing links.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Fallback handler: clear, directory listing or file download.
pub async fn browse(
    State(state): State<AdminState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Result<Response> {
    let client = ClientAddress::from(peer);
    let uri = request.uri().clone();

    if is_clear_request(&uri) {
        return clear_client(&state, &client).await.map(IntoResponse::into_response);
    }

    let relative = decode_path(uri.path())?;
    let path = state.root().join(&relative);
    debug!(client = %client, path = %path.display(), "browse");

    let meta = match fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AdminError::NotFound(uri.path().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    if !meta.is_dir() {
        return serve_file(&path, request).await;
    }

    if !uri.path().ends_with('/') {
        return Ok(Redirect::permanent(&format!("{}/", uri.path())).into_response());
    }

    let entries = read_listing(&path).await?;
    let title = format!("/{}", relative.to_string_lossy());
    Ok(Html(render_listing(&title, &entries)).into_response())
}

fn is_clear_request(uri: &Uri) -> bool {
    uri.path().contains(CLEAR_TOKEN) || uri.query().is_some_and(|q| q.contains(CLEAR_TOKEN))
}

/// Removes everything recorded for `client`.
async fn clear_client(state: &AdminState, client: &ClientAddress) -> Result<Json<ClearResponse>> {
    let dir = state.client_dir(client);
    let cleared = match fs::remove_dir_all(&dir).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    info!(client = %client, cleared, "cleared client captures");
    Ok(Json(ClearResponse {
        client: client.to_string(),
        cleared,
    }))
}

/// Decodes a request path into a path relative to the capture root.
fn decode_path(raw: &str) -> Result<PathBuf> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| AdminError::BadRequest("path is not valid UTF-8".to_string()))?;

    let mut relative = PathBuf::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(AdminError::BadRequest(format!(
                    "path escapes the capture root: {raw}"
                )))
            }
            s if s.contains(['\\', '\0']) => {
                return Err(AdminError::BadRequest(format!("invalid path segment: {raw}")))
            }
            s => relative.push(s),
        }
    }
    Ok(relative)
}

async fn serve_file(path: &Path, request: Request) -> Result<Response> {
    let response = match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    Ok(response.map(Body::new))
}

async fn read_listing(dir: &Path) -> Result<Vec<ListingEntry>> {
    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;

    while let Some(entry) = read_dir.next_entry().await? {
        // Entries can vanish while a clear runs.
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        entries.push(ListingEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: (!meta.is_dir()).then(|| meta.len()),
            modified: meta.modified().ok().map(DateTime::<Local>::from),
        });
    }

    entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(entries)
}

fn render_listing(title: &str, entries: &[ListingEntry]) -> String {
    let title = escape_html(title);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Index of {title}</title></head>\n\
         <body>\n<h1>Index of {title}</h1>\n<table>\n\
         <tr><th>Name</th><th>Size</th><th>Modified</th></tr>\n"
    );

    if title != "/" {
        html.push_str("<tr><td><a href=\"../\">../</a></td><td></td><td></td></tr>\n");
    }

    for entry in entries {
        let suffix = if entry.is_dir { "/" } else { "" };
        let href = utf8_percent_encode(&entry.name, SEGMENT).to_string();
        let size = entry.size.map(|s| s.to_string()).unwrap_or_default();
        let modified = entry
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        html.push_str(&format!(
            "<tr><td><a href=\"{href}{suffix}\">{}{suffix}</a></td><td>{size}</td><td>{modified}</td></tr>\n",
            escape_html(&entry.name)
        ));
    }

    html.push_str("</table>\n</body>\n</html>\n");
    html
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
