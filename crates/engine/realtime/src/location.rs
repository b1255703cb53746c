//! Endpoint handling for stream-backed sockets.

use crate::error::{NetworkError, NetworkResult};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Parsed target endpoint of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    url: Url,
}

impl Location {
    /// Parse an absolute URL. The URL must name a host.
    pub fn parse(url: &str) -> NetworkResult<Self> {
        let parsed =
            Url::parse(url).map_err(|e| NetworkError::Config(format!("invalid url {url}: {e}")))?;
        if parsed.host_str().is_none() {
            return Err(NetworkError::Config(format!(
                "invalid url {url}: missing host"
            )));
        }
        Ok(Self { url: parsed })
    }

    /// URL scheme, e.g. `https`.
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Host as written in the URL; IPv6 addresses keep their brackets.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Explicit port, `None` when the scheme default applies.
    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Path without the query.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Query string without the leading `?`, if any.
    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// Everything before the query, without a trailing slash.
    pub fn base(&self) -> String {
        let mut base = self.url.clone();
        base.set_query(None);
        base.set_fragment(None);
        base.as_str().trim_end_matches('/').to_string()
    }

    /// `?query`, or an empty string.
    pub fn query_string(&self) -> String {
        self.url
            .query()
            .map(|query| format!("?{query}"))
            .unwrap_or_default()
    }

    /// Point at another host, keeping scheme, port and path.
    pub fn replace_host(&mut self, hostname: &str) -> NetworkResult<()> {
        self.url
            .set_host(Some(hostname))
            .map_err(|e| NetworkError::Config(format!("invalid host {hostname}: {e}")))
    }
}

impl FromStr for Location {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base(), self.query_string())
    }
}

/// Append cache-busting `t` (millis) and `n` (counter) parameters.
pub fn unique_url(url: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let separator = if url.contains('?') { '&' } else { '?' };
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!(
        "{url}{separator}t={millis}&n={}",
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
