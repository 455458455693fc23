//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON. Every section
//! defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::ids::ChannelId;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub hls: HlsConfig,
    pub source: SourceConfig,
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Load configuration from a file path, failing on any read or parse error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        match self.server.host.parse::<IpAddr>() {
            Ok(ip) if !ip.is_loopback() => warnings.push(format!(
                "server.host {} is not a loopback address; the proxy has no authentication",
                self.server.host
            )),
            Ok(_) => {}
            Err(_) if self.server.host == "localhost" => {}
            Err(_) => warnings.push(format!(
                "server.host '{}' is not an IP address",
                self.server.host
            )),
        }

        if !(self.hls.target_duration_secs > 0.0) {
            warnings.push(format!(
                "hls.target_duration_secs must be positive (got {})",
                self.hls.target_duration_secs
            ));
        }

        if self.hls.window_size == 0 {
            warnings.push("hls.window_size is 0; playlists will always be empty".into());
        }

        if self.session.idle_timeout_secs < self.session.sweep_interval_secs {
            warnings.push(
                "session.idle_timeout_secs is shorter than sweep_interval_secs; \
                 idle sessions will linger until the next sweep"
                    .into(),
            );
        }

        let mut seen = HashSet::new();
        for (i, channel) in self.channels.iter().enumerate() {
            if channel.url.is_empty() {
                warnings.push(format!("channels[{i}].url is empty"));
            }
            if !seen.insert(&channel.id) {
                warnings.push(format!("channels[{i}].id '{}' is duplicated", channel.id));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Loopback proxy listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8089,
        }
    }
}

/// Per-channel session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions not accessed for this long are stopped by the sweep.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
    /// How long `ensure` waits for the first playlist write.
    pub playlist_wait_ms: u64,
    /// Parent of the per-session working directories.
    pub work_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 120,
            sweep_interval_secs: 30,
            playlist_wait_ms: 3000,
            work_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn playlist_wait(&self) -> Duration {
        Duration::from_millis(self.playlist_wait_ms)
    }

    /// Resolved parent directory for session working directories.
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tunehls"))
    }
}

/// Segmenting and playlist settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub target_duration_secs: f64,
    pub window_size: usize,
    /// Cut H.264 segments on IDR frames when possible.
    pub keyframe_aligned: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            target_duration_secs: 4.0,
            window_size: 6,
            keyframe_aligned: true,
        }
    }
}

/// Upstream source fetching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            user_agent: format!("tunehls/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A statically configured channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: ChannelId,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}
