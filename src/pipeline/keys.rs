//! Counter key codec
//!
//! Single place that knows the cache key layout:
//!
//! ```text
//! live:     <live_ns>:<banner_id>:<YYYY-MM-DDTHH:MM:SS>
//! claimed:  <processed_ns>:<live_ns>:<banner_id>:<YYYY-MM-DDTHH:MM:SS>
//! ```
//!
//! The timestamp is the UTC minute window at second resolution, so it
//! contains `:` itself. Decoding therefore splits the banner id off at the
//! first separator after the namespace and hands the remainder to chrono.

use super::types::{truncate_to_minute, BannerId};
use chrono::{DateTime, NaiveDateTime, Utc};

const WINDOW_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    WrongNamespace(String),
    MissingBannerId(String),
    InvalidBannerId(String),
    InvalidTimestamp(String),
}

impl std::fmt::Display for KeyParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyParseError::WrongNamespace(k) => write!(f, "Key '{}' is outside the live namespace", k),
            KeyParseError::MissingBannerId(k) => write!(f, "Key '{}' has no banner id segment", k),
            KeyParseError::InvalidBannerId(k) => write!(f, "Key '{}' has a non-numeric banner id", k),
            KeyParseError::InvalidTimestamp(k) => write!(f, "Key '{}' has an unparseable window timestamp", k),
        }
    }
}

impl std::error::Error for KeyParseError {}

/// Decoded identity of a live counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey {
    pub banner_id: BannerId,
    pub window_start: DateTime<Utc>,
}

/// Encoder/decoder bound to a pair of namespaces
#[derive(Debug, Clone)]
pub struct KeyCodec {
    live_prefix: String,
    processed_prefix: String,
}

impl KeyCodec {
    pub fn new(live_namespace: &str, processed_namespace: &str) -> Self {
        Self {
            live_prefix: format!("{}:", live_namespace),
            processed_prefix: format!("{}:", processed_namespace),
        }
    }

    /// Prefix every live counter key starts with (scan target of the sync tick)
    pub fn live_prefix(&self) -> &str {
        &self.live_prefix
    }

    /// Prefix every claimed counter key starts with (scan target of the sweeper)
    pub fn claimed_prefix(&self) -> String {
        format!("{}{}", self.processed_prefix, self.live_prefix)
    }

    pub fn encode(&self, banner_id: BannerId, window_start: DateTime<Utc>) -> String {
        format!(
            "{}{}:{}",
            self.live_prefix,
            banner_id,
            truncate_to_minute(window_start).format(WINDOW_FORMAT)
        )
    }

    /// Claimed form of a live key
    pub fn claimed(&self, live_key: &str) -> String {
        format!("{}{}", self.processed_prefix, live_key)
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        key.starts_with(&self.processed_prefix)
    }

    pub fn decode(&self, key: &str) -> Result<CounterKey, KeyParseError> {
        let rest = key
            .strip_prefix(&self.live_prefix)
            .ok_or_else(|| KeyParseError::WrongNamespace(key.to_string()))?;

        let (id_part, ts_part) = rest
            .split_once(':')
            .ok_or_else(|| KeyParseError::MissingBannerId(key.to_string()))?;

        if id_part.is_empty() || !id_part.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
            return Err(KeyParseError::InvalidBannerId(key.to_string()));
        }
        let banner_id: BannerId = id_part
            .parse()
            .map_err(|_| KeyParseError::InvalidBannerId(key.to_string()))?;

        let window = NaiveDateTime::parse_from_str(ts_part, WINDOW_FORMAT)
            .map_err(|_| KeyParseError::InvalidTimestamp(key.to_string()))?
            .and_utc();

        Ok(CounterKey {
            banner_id,
            window_start: truncate_to_minute(window),
        })
    }
}
