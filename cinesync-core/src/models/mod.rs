//! Domain model types shared across services

use std::path::PathBuf;

use nanoid::nanoid;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use cinesync_proto::Role;

use crate::{Error, Result};

/// Maximum display-name length in code points.
pub const MAX_NAME_LEN: usize = 30;

static STREAM_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("stream name regex"));

/// Check a bare stream name (the part after `hls:`).
#[must_use]
pub fn is_valid_stream_name(name: &str) -> bool {
    STREAM_NAME_RE.is_match(name)
}

/// Generate a 12-character nanoid for connection IDs
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Stable identifier of one live client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    #[must_use]
    pub fn new() -> Self {
        Self(generate_id())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated stream reference of the form `hls:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Parse a full `hls:<name>` reference.
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw
            .strip_prefix("hls:")
            .ok_or_else(|| Error::InvalidInput(format!("not an hls stream reference: {raw}")))?;
        if !is_valid_stream_name(name) {
            return Err(Error::InvalidInput(format!("invalid stream name: {name}")));
        }
        Ok(Self(raw.to_string()))
    }

    /// Build a reference from a bare directory name.
    pub fn from_name(name: &str) -> Result<Self> {
        if !is_valid_stream_name(name) {
            return Err(Error::InvalidInput(format!("invalid stream name: {name}")));
        }
        Ok(Self(format!("hls:{name}")))
    }

    /// The bare name (directory under `processed/`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0["hls:".len()..]
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A ready-to-serve HLS stream derived from disk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub stream_id: StreamId,
    pub master_playlist: PathBuf,
}

/// An authenticated session minted from a password auth.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub role: Role,
    pub name: String,
    pub expires_at: Instant,
}

/// Trim and cap a client-supplied display name.
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "Anonymous".to_string();
    }
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_name_validator() {
        assert!(is_valid_stream_name("intro"));
        assert!(is_valid_stream_name("Movie_Night-2024"));
        assert!(!is_valid_stream_name(""));
        assert!(!is_valid_stream_name(".."));
        assert!(!is_valid_stream_name("a/b"));
        assert!(!is_valid_stream_name("a\\b"));
        assert!(!is_valid_stream_name("a b"));
        assert!(!is_valid_stream_name("a\nb"));
        assert!(!is_valid_stream_name("intro.m3u8"));
    }

    #[test]
    fn stream_id_parse() {
        let id = StreamId::parse("hls:intro").expect("valid reference");
        assert_eq!(id.name(), "intro");
        assert_eq!(id.as_str(), "hls:intro");

        assert!(StreamId::parse("intro").is_err());
        assert!(StreamId::parse("hls:../etc").is_err());
        assert!(StreamId::parse("hls:").is_err());
    }

    #[test]
    fn stream_id_from_name_round_trip() {
        let id = StreamId::from_name("intro").expect("valid name");
        assert_eq!(id.as_str(), "hls:intro");
        assert!(StreamId::from_name("no/slashes").is_err());
    }

    #[test]
    fn client_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
        assert_eq!(ClientId::new().as_str().len(), 12);
    }

    #[test]
    fn name_sanitization() {
        assert_eq!(sanitize_name("  Ana  "), "Ana");
        assert_eq!(sanitize_name(""), "Anonymous");
        assert_eq!(sanitize_name("   "), "Anonymous");
        let long = "x".repeat(64);
        assert_eq!(sanitize_name(&long).chars().count(), MAX_NAME_LEN);
    }
}
