//! Mapping of proxied URLs to capture files.
//!
//! Every captured response lands at
//!
//! ```text
//! {root}/{client}/{scheme}/{host}/{port}/{path...}/{basename}.{timestamp}
//! ```
//!
//! The timestamp has millisecond resolution and is always kept whole, so two
//! captures of the same URL by the same client at different instants never
//! share a file. Mapping is pure: the caller supplies the timestamp.

use std::fmt::Display;
use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};

use crate::target::{ClientAddress, Scheme, TargetUrl};

/// File name used when the request path has no file component.
pub const DEFAULT_FILE_NAME: &str = "no-name.txt";

/// `strftime` pattern of the capture timestamp (`YYYY-MM-DDTHH-mm-ss-SSS`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3f";

/// Length of a formatted capture timestamp.
pub const TIMESTAMP_LEN: usize = 23;

/// Longest file name produced, timestamp suffix included.
///
/// Stays under the 256-character ceiling and within the usual `NAME_MAX`.
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Longest basename kept before `.{timestamp}` is appended.
pub const MAX_BASENAME_LEN: usize = MAX_FILE_NAME_LEN - 1 - TIMESTAMP_LEN;

/// Formats a capture timestamp.
pub fn format_timestamp<Tz>(timestamp: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Maps a request to the file its response is captured in.
///
/// `root` should be absolute; the result is lexically normalized and always
/// stays inside `{root}/{client}`.
pub fn map_to_path<Tz>(
    root: &Path,
    scheme: &str,
    host: &str,
    port: Option<u16>,
    path: Option<&str>,
    client: &ClientAddress,
    timestamp: &DateTime<Tz>,
) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let scheme = scheme.trim_end_matches(':');
    let port = port.unwrap_or_else(|| {
        Scheme::parse(scheme)
            .map(|s| s.default_port())
            .unwrap_or(80)
    });

    let path = path.filter(|p| !p.is_empty()).unwrap_or("/");
    let mut segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect();
    if path.ends_with('/') || segments.is_empty() {
        segments.push(DEFAULT_FILE_NAME);
    }
    let basename = segments.pop().unwrap_or(DEFAULT_FILE_NAME);

    let mut full = root.to_path_buf();
    full.push(sanitize_segment(client.as_str()));
    full.push(sanitize_segment(scheme));
    full.push(sanitize_segment(host));
    full.push(port.to_string());
    for segment in segments {
        full.push(truncate_to_boundary(segment, MAX_FILE_NAME_LEN));
    }

    if basename.len() > MAX_BASENAME_LEN {
        tracing::debug!(path, "file name too long, truncating");
    }
    let basename = truncate_to_boundary(basename, MAX_BASENAME_LEN);
    full.push(format!("{}.{}", basename, format_timestamp(timestamp)));

    normalize(&full)
}

/// Lexically normalizes a path: drops `.` and empty segments and resolves
/// `..` against the preceding segment. Never touches the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(segment) => out.push(segment),
        }
    }
    out
}

fn sanitize_segment(segment: &str) -> String {
    match segment {
        "" | "." | ".." => "_".to_string(),
        s => s.replace(['/', '\\'], "_"),
    }
}

fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A computed capture location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    /// Absolute path of the capture file.
    pub path: PathBuf,
    /// Same path relative to the capture root, as written to the access log.
    pub relative: PathBuf,
}

/// Maps targets under a fixed capture root.
#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
}

impl PathMapper {
    /// Creates a mapper rooted at `root`, made absolute against the current
    /// directory when relative.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = normalize(&std::path::absolute(root.as_ref())?);
        Ok(Self { root })
    }

    /// Returns the capture root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the subtree owned by one client.
    pub fn client_dir(&self, client: &ClientAddress) -> PathBuf {
        self.root.join(sanitize_segment(client.as_str()))
    }

    /// Maps a request target for `client` captured at `timestamp`.
    pub fn map(
        &self,
        target: &TargetUrl,
        client: &ClientAddress,
        timestamp: &DateTime<Local>,
    ) -> CaptureTarget {
        let path = map_to_path(
            &self.root,
            target.scheme().as_str(),
            target.host(),
            target.port(),
            Some(target.path()),
            client,
            timestamp,
        );
        let relative = path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.clone());

        CaptureTarget { path, relative }
    }
}
