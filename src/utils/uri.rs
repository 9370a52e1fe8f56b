//! URI parsing and query-string helpers.
//!
//! Wraps the `url` crate behind the narrow surface the transports and the
//! configuration layer need: scheme/host/port/path plus a flat string-keyed
//! query map.

use std::collections::BTreeMap;

use url::form_urlencoded;
use url::Url;

use crate::error::{ProtocolError, Result};

/// The components of a parsed target URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    /// Whether the scheme implies TLS (`https` or `wss`).
    pub secure: bool,
    pub hostname: String,
    pub port: u16,
    /// Path component, `/` when absent.
    pub path: String,
    /// Query parameters, later keys overriding earlier duplicates.
    pub query: BTreeMap<String, String>,
}

impl ParsedUri {
    /// Parse an absolute URI. A scheme-less input is treated as `https://`.
    ///
    /// Accepted schemes are `http`, `https`, `ws` and `wss`; default ports
    /// are filled in from the scheme when the URI does not carry one.
    pub fn parse(uri: &str) -> Result<Self> {
        let normalized = if uri.contains("://") {
            uri.to_string()
        } else {
            format!("https://{uri}")
        };

        let parsed =
            Url::parse(&normalized).map_err(|e| ProtocolError::InvalidUri(e.to_string()))?;

        let secure = match parsed.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => {
                return Err(ProtocolError::InvalidUri(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };

        let hostname = parsed
            .host_str()
            .ok_or_else(|| ProtocolError::InvalidUri("missing host".to_string()))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();

        let port = parsed
            .port()
            .unwrap_or(if secure { 443 } else { 80 });

        let path = if parsed.path().is_empty() {
            "/".to_string()
        } else {
            parsed.path().to_string()
        };

        let query = parsed
            .query()
            .map(decode_query)
            .unwrap_or_default();

        Ok(Self {
            secure,
            hostname,
            port,
            path,
            query,
        })
    }

    /// Stable identifier for connection pooling: `scheme://host:port`.
    pub fn id(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };
        format!("{scheme}://{host}:{}", self.port)
    }
}

/// Encode a flat string-keyed map as an `application/x-www-form-urlencoded`
/// query string.
pub fn encode_query(query: &BTreeMap<String, String>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in query {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Decode a query string into a flat map.
pub fn decode_query(query: &str) -> BTreeMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
