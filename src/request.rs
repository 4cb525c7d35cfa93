//! Request line parsing
//!
//! Splits the first line of a client request into method and target and
//! derives the keys the proxy uses for blocking and caching decisions.
//!
//! ```text
//! GET http://example.com/a.html HTTP/1.0
//! CONNECT example.com:443 HTTP/1.1
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;

/// Request line parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty request line")]
    Empty,

    #[error("Request line has no target: {0}")]
    MissingTarget(String),

    #[error("Invalid CONNECT authority '{authority}': {reason}")]
    InvalidAuthority { authority: String, reason: String },
}

/// Normalized key used for both blocklist and cache lookups.
///
/// Targets without a scheme are prefixed with `http://`. When the result parses
/// as a URL the parsed form is used, so `HTTP://Example.com` and
/// `http://example.com/` produce the same key. Parsing drops the default
/// port, so `example.com:80` and `example.com` are one key as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalUrl(String);

impl CanonicalUrl {
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim();
        let prefixed = if has_scheme(raw) {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        match Url::parse(&prefixed) {
            Ok(url) => Self(url.to_string()),
            Err(_) => Self(prefixed),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hostname component, if the key is a well-formed URL
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.0)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    /// Path component without query or fragment
    pub fn path(&self) -> String {
        match Url::parse(&self.0) {
            Ok(url) => url.path().to_string(),
            Err(_) => self
                .0
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CanonicalUrl {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Checks for an RFC 3986 scheme followed by `://`
fn has_scheme(raw: &str) -> bool {
    match raw.find("://") {
        Some(0) | None => false,
        Some(idx) => {
            let scheme = &raw[..idx];
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
    }
}

/// Parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// Method as sent by the client (GET, CONNECT, ...)
    pub method: String,

    /// Raw request target, absolute-form URL or `host:port` for CONNECT
    pub target: String,

    /// Protocol version if present (HTTP/1.0, HTTP/1.1)
    pub version: Option<String>,
}

impl RequestLine {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Key used for blocklist and cache lookups
    pub fn canonical_url(&self) -> CanonicalUrl {
        CanonicalUrl::new(&self.target)
    }

    /// Tunnel destination, parsed from the raw target rather than the key
    pub fn connect_target(&self) -> Result<ConnectTarget, ParseError> {
        parse_authority(&self.target)
    }
}

/// Parse `METHOD target [VERSION]`
///
/// Anything short of a method/target pair is rejected so the caller can close
/// the connection without answering.
pub fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();

    let method = parts.next().ok_or(ParseError::Empty)?;
    let target = parts
        .next()
        .ok_or_else(|| ParseError::MissingTarget(line.to_string()))?;
    let version = parts.next().map(str::to_string);

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version,
    })
}

/// CONNECT destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse and validate a CONNECT authority (`host:port`)
pub fn parse_authority(authority: &str) -> Result<ConnectTarget, ParseError> {
    let invalid = |reason: &str| ParseError::InvalidAuthority {
        authority: authority.to_string(),
        reason: reason.to_string(),
    };

    // Split by last colon to handle IPv6 addresses like [::1]:443
    let (host, port_str) = authority
        .rsplit_once(':')
        .ok_or_else(|| invalid("authority must be in host:port format"))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid("host cannot be empty"));
    }

    let port: u16 = port_str
        .parse()
        .map_err(|_| invalid("port must be a number between 1 and 65535"))?;
    if port == 0 {
        return Err(invalid("port must be between 1 and 65535"));
    }

    Ok(ConnectTarget {
        host: host.to_string(),
        port,
    })
}
