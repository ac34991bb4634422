//! Wire protocol for the sync channel
//!
//! JSON text frames over a bidirectional message channel. Every frame is an
//! object carrying a `type` tag; all values are absolute (snapshots, not
//! deltas), so frames are idempotent and safe to replay.

use serde::{Deserialize, Serialize};

/// WebSocket close codes used by the server.
pub mod close {
    /// Normal closure / operator logout / forced disconnect.
    pub const NORMAL: u16 = 1000;
    /// Server is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Authentication failure or auth-phase timeout.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Internal send error.
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Connected-client role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Operator,
    Viewer,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Viewer => "viewer",
        }
    }

    #[must_use]
    pub const fn is_operator(self) -> bool {
        matches!(self, Self::Operator)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames accepted from clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Authenticate with a session token or a password (token wins).
    #[serde(rename = "auth")]
    Auth {
        token: Option<String>,
        password: Option<String>,
        name: Option<String>,
    },

    #[serde(rename = "play")]
    Play,

    #[serde(rename = "pause")]
    Pause,

    #[serde(rename = "seek")]
    Seek { time: f64 },

    #[serde(rename = "changeVideo")]
    ChangeVideo { video: String },

    #[serde(rename = "requestVideoList")]
    RequestVideoList,

    #[serde(rename = "requestViewerList")]
    RequestViewerList,

    #[serde(rename = "requestSync")]
    RequestSync,

    #[serde(rename = "syncAll")]
    SyncAll,

    /// Periodic self-report of the client's local playback position.
    #[serde(rename = "clientTimeUpdate")]
    ClientTimeUpdate {
        #[serde(rename = "clientTime")]
        client_time: f64,
        #[serde(rename = "playbackRate")]
        playback_rate: f64,
        #[serde(rename = "isPlaying")]
        is_playing: bool,
        name: Option<String>,
    },
}

/// An absolute master-state snapshot pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    #[serde(rename = "currentVideo")]
    pub current_video: Option<String>,
    #[serde(rename = "targetTime")]
    pub target_time: f64,
    #[serde(rename = "isPlaying")]
    pub is_playing: bool,
    #[serde(rename = "playbackRate")]
    pub playback_rate: f64,
}

/// One row of the viewer table shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerEntry {
    pub role: Role,
    pub name: String,
    pub ip: String,
    #[serde(rename = "currentTime")]
    pub current_time: Option<f64>,
    pub drift: Option<f64>,
    #[serde(rename = "isPlaying")]
    pub is_playing: bool,
    #[serde(rename = "playbackRate")]
    pub playback_rate: f64,
}

/// Frames sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "auth_success")]
    AuthSuccess {
        role: Role,
        name: String,
        token: String,
    },

    #[serde(rename = "auth_fail")]
    AuthFail { message: String },

    #[serde(rename = "syncState")]
    SyncState(SyncSnapshot),

    #[serde(rename = "videoList")]
    VideoList { videos: Vec<String> },

    #[serde(rename = "viewerList")]
    ViewerList {
        viewers: Vec<ViewerEntry>,
        count: usize,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerFrame {
    /// Convenience constructor for error frames.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
