//! Request targets and client identities.
//!
//! A forward proxy receives absolute-form request targets
//! (`GET http://host:port/path?query HTTP/1.1`). [`TargetUrl`] keeps the parts
//! the proxy needs to reach the origin and to place the capture on disk.
//! [`ClientAddress`] is the per-client isolation key.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use http::Uri;

/// Scheme of a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plaintext HTTP.
    Http,
    /// HTTP over TLS, originated by the proxy.
    Https,
}

impl Scheme {
    /// Parses a scheme, ignoring case and a trailing `:` (`http:` -> `http`).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim_end_matches(':');
        if s.eq_ignore_ascii_case("http") {
            Some(Self::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Some(Self::Https)
        } else {
            None
        }
    }

    /// Returns the lowercase scheme name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Returns the well-known port for this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of a forward-proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    path: String,
    query: Option<String>,
}

impl TargetUrl {
    /// Builds a target from an absolute-form request URI.
    ///
    /// Returns `None` for origin-form (`/path`) or authority-form
    /// (`host:port`) targets and for schemes other than http/https.
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let scheme = Scheme::parse(uri.scheme_str()?)?;
        let host = uri.host().filter(|h| !h.is_empty())?.to_string();
        let path = match uri.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        Some(Self {
            scheme,
            host,
            port: uri.port_u16(),
            path,
            query: uri.query().map(str::to_string),
        })
    }

    /// Returns the scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Returns the host as it appeared in the URI (IPv6 keeps its brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the host in the form accepted by socket and TLS APIs.
    pub fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Returns the explicit port, if the request carried one.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns the port to connect to.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// Returns the path component, always starting with `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the query string without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the origin-form request target (`/path?query`) sent upstream.
    pub fn origin_form(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        f.write_str(&self.origin_form())
    }
}

/// Source address of a proxy client, used as its isolation key.
///
/// Only the IP is kept, so every connection from one host shares a subtree.
/// IPv4-mapped IPv6 addresses are folded to plain IPv4.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientAddress(String);

impl ClientAddress {
    /// Creates a client address from an IP.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_canonical().to_string())
    }

    /// Returns the address as used in directory names.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<IpAddr> for ClientAddress {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

impl From<SocketAddr> for ClientAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
    }
}

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
