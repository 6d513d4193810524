//! Connection strings and the port configuration derived from them.
//!
//! A connection string has the form `scheme://authority[/path][?k=v&k=v]`.
//! The scheme selects a port factory; the query is a flat key/value map each
//! transport reads its own settings from. Accessors report malformed values
//! with an error naming the offending key.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use url::{Host, ParseError, Url};

use crate::error::{ConfigError, Result};

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_MS: u64 = 5000;

/// Parsed `scheme://authority[/path][?query]` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionString {
    raw: String,
    scheme: String,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    query: BTreeMap<String, String>,
}

/// Port text of the authority in `rest` (the part after `://`), used to
/// report an out-of-range port.
fn authority_port(rest: &str) -> &str {
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_end = authority.rfind(']').unwrap_or(0);
    authority[host_end..].rsplit_once(':').map_or("", |(_, port)| port)
}

impl ConnectionString {
    /// Parse a connection string.
    ///
    /// Parsing is done by [`Url`]. Underscores in the scheme (`tcp_s`) are
    /// accepted and kept; query values are percent-decoded.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Malformed`] if the string lacks `://` or is not
    /// a valid URL, [`ConfigError::MissingHost`] for an empty host before a
    /// port, and [`ConfigError::InvalidInteger`] if the port is not a number
    /// in `0..=65535`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| ConfigError::Malformed(raw.to_owned()))?;
        // WHATWG schemes have no `_`; parse under a hyphenated alias.
        let url = Url::parse(&format!("{}://{rest}", scheme.replace('_', "-"))).map_err(|error| match error {
            ParseError::EmptyHost => ConfigError::MissingHost(raw.to_owned()),
            ParseError::InvalidPort => ConfigError::InvalidInteger {
                key: "port".into(),
                value: authority_port(rest).into(),
            },
            _ => ConfigError::Malformed(raw.to_owned()),
        })?;
        let host = match url.host() {
            Some(Host::Ipv6(addr)) => Some(addr.to_string()),
            Some(Host::Ipv4(addr)) => Some(addr.to_string()),
            Some(Host::Domain(domain)) if !domain.is_empty() => Some(domain.to_owned()),
            Some(Host::Domain(_)) | None => None,
        };
        let query = url
            .query_pairs()
            .map(|(key, value)| (key.to_ascii_lowercase(), value.into_owned()))
            .collect();
        Ok(Self {
            raw: raw.to_owned(),
            scheme: scheme.to_ascii_lowercase(),
            host,
            port: url.port_or_known_default(),
            path: url.path().to_owned(),
            query,
        })
    }

    /// Lower-cased scheme.
    #[must_use]
    pub fn scheme(&self) -> &str { &self.scheme }

    /// Host part of the authority, without IPv6 brackets.
    #[must_use]
    pub fn host(&self) -> Option<&str> { self.host.as_deref() }

    /// Port part of the authority.
    #[must_use]
    pub fn port(&self) -> Option<u16> { self.port }

    /// Path including its leading `/`, or empty.
    #[must_use]
    pub fn path(&self) -> &str { &self.path }

    /// The string as given, trimmed.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.raw }

    /// The string without its query, used as a default port name.
    #[must_use]
    pub fn base(&self) -> &str { self.raw.split_once('?').map_or(self.raw.as_str(), |(base, _)| base) }

    /// Decoded query value for `key` (keys are case-insensitive).
    #[must_use]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// Every query pair, sorted by key.
    pub fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Host, or [`ConfigError::MissingHost`].
    ///
    /// # Errors
    ///
    /// Fails when the authority has no host.
    pub fn require_host(&self) -> Result<&str> {
        self.host().ok_or_else(|| ConfigError::MissingHost(self.raw.clone()))
    }

    /// Port, or [`ConfigError::MissingPort`].
    ///
    /// # Errors
    ///
    /// Fails when the authority has no port.
    pub fn require_port(&self) -> Result<u16> {
        self.port.ok_or_else(|| ConfigError::MissingPort(self.raw.clone()))
    }

    /// `host:port` suitable for socket address resolution.
    ///
    /// # Errors
    ///
    /// Fails when host or port are missing.
    pub fn socket_addr(&self) -> Result<String> {
        let host = self.require_host()?;
        let port = self.require_port()?;
        Ok(if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        })
    }

    /// Boolean query value. Accepts `true|false|1|0|yes|no|on|off`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBool`] for other values.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        let Some(value) = self.query(key) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    /// Integer query value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidInteger`] if the value does not parse
    /// as `T`.
    pub fn get_int<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.query(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidInteger {
                key: key.into(),
                value: value.into(),
            }),
        }
    }

    /// Query value naming one of `choices` (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnum`] when the value is not a choice;
    /// `expected` is reported verbatim.
    pub fn get_enum<T: Copy>(
        &self,
        key: &str,
        default: T,
        choices: &[(&str, T)],
        expected: &'static str,
    ) -> Result<T> {
        let Some(value) = self.query(key) else {
            return Ok(default);
        };
        choices
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(value))
            .map(|(_, choice)| *choice)
            .ok_or_else(|| ConfigError::InvalidEnum {
                key: key.into(),
                value: value.into(),
                expected,
            })
    }

    /// Optional string query value, `None` when absent or empty.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> { self.query(key).filter(|v| !v.is_empty()) }
}

impl FromStr for ConnectionString {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.raw) }
}

/// Settings shared by every port, read from the common query keys `name`,
/// `enabled` and `reconnect_ms`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port identifier; defaults to the connection string without query.
    pub name: String,
    /// Whether the router enables the port as soon as it is added.
    pub enabled: bool,
    /// Delay before a failed port reconnects.
    pub reconnect_timeout: Duration,
}

impl PortConfig {
    /// Config with defaults for a port called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            reconnect_timeout: Duration::from_millis(DEFAULT_RECONNECT_MS),
        }
    }

    /// Builder-style override of [`PortConfig::reconnect_timeout`].
    #[must_use]
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Builder-style override of [`PortConfig::enabled`].
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Read the common keys from `cs`.
    ///
    /// # Errors
    ///
    /// Fails if `enabled` is not a boolean or `reconnect_ms` not an integer.
    pub fn from_connection_string(cs: &ConnectionString) -> Result<Self> {
        Ok(Self {
            name: cs.get_str("name").unwrap_or(cs.base()).to_owned(),
            enabled: cs.get_bool("enabled", true)?,
            reconnect_timeout: Duration::from_millis(
                cs.get_int("reconnect_ms", DEFAULT_RECONNECT_MS)?,
            ),
        })
    }
}
