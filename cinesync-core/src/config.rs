use config::{Config as ConfigBuilder, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Application configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub sync: SyncConfig,
    pub video: VideoConfig,
    pub logging: LoggingConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("auth", &"<redacted>")
            .field("sync", &self.sync)
            .field("video", &self.video)
            .field("logging", &self.logging)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served as the static web UI.
    pub ui_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            ui_dir: "ui".to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Secret granting the operator role. Required.
    pub operator_password: String,
    /// Secret granting the viewer role. Required.
    pub viewer_password: String,
    /// Session lifetime in milliseconds (default 7 days).
    pub session_ttl_ms: u64,
    /// Interval between expiry sweeps (default 1 hour).
    pub sweep_interval_ms: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("operator_password", &"<redacted>")
            .field("viewer_password", &"<redacted>")
            .field("session_ttl_ms", &self.session_ttl_ms)
            .field("sweep_interval_ms", &self.sweep_interval_ms)
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            operator_password: String::new(),
            viewer_password: String::new(),
            session_ttl_ms: 604_800_000,
            sweep_interval_ms: 3_600_000,
        }
    }
}

/// Tuning knobs for the sync engine.
///
/// The shipped interval band is deliberately degenerate
/// (`min_interval_ms == max_interval_ms`), which turns per-client interval
/// adaptation into a constant; widen the band to re-enable it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Initial per-client sync period.
    pub default_interval_ms: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Step applied when adapting a client's sync period.
    pub interval_step_ms: u64,
    /// |drift| below this shrinks sync pressure (seconds).
    pub drift_low_secs: f64,
    /// |drift| above this raises sync pressure (seconds).
    pub drift_high_secs: f64,
    /// Drift below this counts a client as behind (seconds, negative).
    pub behind_threshold_secs: f64,
    /// Master playback rate floor.
    pub min_rate: f64,
    /// Master playback rate ceiling (never faster than real time).
    pub max_rate: f64,
    /// Rate-controller step per tick.
    pub rate_step: f64,
    /// Rate-controller period.
    pub rate_interval_ms: u64,
    /// Periodic whole-room broadcast period while playing.
    pub broadcast_interval_ms: u64,
    /// Liveness check period.
    pub heartbeat_interval_ms: u64,
    /// Checks a client may miss before it is disconnected.
    pub max_missed_heartbeats: u32,
    /// Window a new connection has to authenticate.
    pub auth_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 1000,
            min_interval_ms: 1000,
            max_interval_ms: 1000,
            interval_step_ms: 250,
            drift_low_secs: 0.5,
            drift_high_secs: 1.5,
            behind_threshold_secs: -1.0,
            min_rate: 0.9,
            max_rate: 1.0,
            rate_step: 0.01,
            rate_interval_ms: 1000,
            broadcast_interval_ms: 1000,
            heartbeat_interval_ms: 10_000,
            max_missed_heartbeats: 2,
            auth_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Library root. Sources live at the top level, HLS output under
    /// `<root>/processed/`.
    pub root: String,
    /// Period between library scans.
    pub scan_interval_ms: u64,
    pub ffmpeg_path: String,
    /// HLS segment length passed to the encoder.
    pub segment_secs: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            root: "videos".to_string(),
            scan_interval_ms: 60_000,
            ffmpeg_path: "ffmpeg".to_string(),
            segment_secs: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" for development, "json" for production.
    pub format: String,
    pub file_path: Option<String>,
    /// Period between counter roll-up lines.
    pub summary_interval_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            summary_interval_ms: 60_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    /// (`CINESYNC_AUTH__OPERATOR_PASSWORD`, `CINESYNC_SERVER__PORT`, ...)
    /// layered over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let builder = ConfigBuilder::builder().add_source(
            Environment::with_prefix("CINESYNC")
                .separator("__")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }

    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Validate configuration at startup (fail fast on misconfigurations)
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.auth.operator_password.is_empty() {
            errors.push(
                "auth.operator_password is required (set CINESYNC_AUTH__OPERATOR_PASSWORD)"
                    .to_string(),
            );
        }
        if self.auth.viewer_password.is_empty() {
            errors.push(
                "auth.viewer_password is required (set CINESYNC_AUTH__VIEWER_PASSWORD)".to_string(),
            );
        }
        if self.server.port == 0 {
            errors.push("server.port must be between 1 and 65535, got 0".to_string());
        }
        if self.sync.min_interval_ms > self.sync.max_interval_ms {
            errors.push(format!(
                "sync.min_interval_ms ({}) must not exceed sync.max_interval_ms ({})",
                self.sync.min_interval_ms, self.sync.max_interval_ms
            ));
        }
        if self.sync.default_interval_ms < self.sync.min_interval_ms
            || self.sync.default_interval_ms > self.sync.max_interval_ms
        {
            errors.push(format!(
                "sync.default_interval_ms ({}) must lie within [{}, {}]",
                self.sync.default_interval_ms,
                self.sync.min_interval_ms,
                self.sync.max_interval_ms
            ));
        }
        if !(self.sync.min_rate > 0.0 && self.sync.min_rate <= self.sync.max_rate) {
            errors.push(format!(
                "sync rate bounds invalid: min_rate {} max_rate {}",
                self.sync.min_rate, self.sync.max_rate
            ));
        }
        if self.sync.drift_low_secs >= self.sync.drift_high_secs {
            errors.push(format!(
                "sync.drift_low_secs ({}) must be below sync.drift_high_secs ({})",
                self.sync.drift_low_secs, self.sync.drift_high_secs
            ));
        }
        if self.video.root.is_empty() {
            errors.push("video.root must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
