//! Connection Configuration
//!
//! Parses the application-facing connect configuration and derives the
//! reconnection policy from it.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::transport::{TransportError, TransportOptions};

/// Delay before a reconnect attempt when none is configured
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Application-facing connect configuration.
///
/// Mirrors the JSON shape `{url, reconnectInterval, maxReconnectAttempts}`.
/// Callbacks are supplied separately, see [`crate::transport::Callbacks`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectConfig {
    pub url: String,
    /// Parsed reconnect interval in milliseconds. A positive value enables
    /// reconnection.
    #[serde(default, deserialize_with = "deserialize_lenient_int")]
    pub reconnect_interval: Option<i64>,
    /// Retry budget. `None` or `Some(0)` means unbounded, a negative value
    /// allows no retry at all.
    #[serde(default, deserialize_with = "deserialize_lenient_int")]
    pub max_reconnect_attempts: Option<i64>,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub transport: TransportOptions,
}

impl ConnectConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ConnectConfig {
            url: url.into(),
            reconnect_interval: None,
            max_reconnect_attempts: None,
            protocols: Vec::new(),
            transport: TransportOptions::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_reconnect_interval(mut self, ms: i64) -> Self {
        self.reconnect_interval = Some(ms);
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: i64) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Reconnection starts enabled iff the interval is a positive integer
    pub fn reconnect_enabled(&self) -> bool {
        matches!(self.reconnect_interval, Some(ms) if ms > 0)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        let interval = match self.reconnect_interval {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => DEFAULT_RECONNECT_INTERVAL,
        };
        let max_attempts = match self.max_reconnect_attempts {
            None | Some(0) => None,
            Some(max) if max < 0 => Some(0),
            Some(max) => Some(u32::try_from(max).unwrap_or(u32::MAX)),
        };
        ReconnectPolicy {
            max_attempts,
            interval,
        }
    }
}

/// Reconnection budget and pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum consecutive attempts (`None` = unbounded)
    pub max_attempts: Option<u32>,
    /// Fixed delay before each attempt
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: None,
            interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl ReconnectPolicy {
    /// Whether another retry may be scheduled after `attempts` retries
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInt {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Accept integers, floats (truncated) and numeric strings
fn deserialize_lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawInt>::deserialize(deserializer)?;
    Ok(raw.and_then(|raw| match raw {
        RawInt::Integer(value) => Some(value),
        RawInt::Float(value) if value.is_finite() => Some(value.trunc() as i64),
        RawInt::Float(_) => None,
        RawInt::Text(text) => parse_leading_int(&text),
    }))
}

/// Parse the leading decimal integer of `text`, ignoring any trailing
/// characters ("1500ms" -> 1500). Returns `None` when no digits lead.
pub fn parse_leading_int(text: &str) -> Option<i64> {
    let trimmed = text.trim_start();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    let value = rest[..end].parse::<i64>().ok()?;
    Some(if negative { -value } else { value })
}
