use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::platform;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not serialise config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("endpoint must be a ws:// or wss:// URI, got {0:?}")]
    InvalidEndpoint(String),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("lyric source rank {0} is used more than once")]
    DuplicateRank(u8),
    #[error("lyric source with rank {0} has no URLs")]
    NoUrls(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub lyrics: LyricsConfig,
}

/// Where the display lives and how to reconnect to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Player HTTP endpoint returning `{progress, currentTrack}`.
    #[serde(default = "default_player_api")]
    pub api_url: String,
    /// Interval of the emit loop.  Smoothed progress goes out this often.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the player API is actually queried.
    #[serde(default = "default_refetch_interval_ms")]
    pub refetch_interval_ms: u64,
    /// Time without a progress change before playback is considered paused.
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
    /// Timeout applied to every HTTP request, player and lyrics alike.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default)]
    pub backend: BackendKind,
    /// MPRIS bus suffix: `org.mpris.MediaPlayer2.<mpris_name>`.
    #[serde(default = "default_mpris_name")]
    pub mpris_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mpris,
    #[serde(rename = "none")]
    Disabled,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            BackendKind::Mpris
        } else {
            BackendKind::Disabled
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LyricsConfig {
    #[serde(default = "default_sources")]
    pub sources: Vec<LyricSourceConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LyricFormat {
    /// JSON body with `lrc.lyric`, line-synced.
    Lrc,
    /// JSON body with `yrc.lyric`, word-synced.
    Yrc,
    /// Plain TTML document.
    Ttml,
}

/// One lyric source.  Higher `rank` wins; ranks are unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LyricSourceConfig {
    pub format: LyricFormat,
    pub rank: u8,
    /// URL templates; `{id}` is replaced with the track id.  Tried in order.
    pub urls: Vec<String>,
    /// Optional banner shown before the first lyric line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit: Option<String>,
}

impl LyricSourceConfig {
    pub fn urls_for(&self, track_id: u64) -> Vec<String> {
        let id = track_id.to_string();
        self.urls.iter().map(|t| t.replace("{id}", &id)).collect()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            api_url: default_player_api(),
            poll_interval_ms: default_poll_interval_ms(),
            refetch_interval_ms: default_refetch_interval_ms(),
            stall_threshold_ms: default_stall_threshold_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            backend: BackendKind::default(),
            mpris_name: default_mpris_name(),
        }
    }
}

impl Default for LyricsConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
        }
    }
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:11444".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_player_api() -> String {
    "http://127.0.0.1:27232/player".to_string()
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_refetch_interval_ms() -> u64 {
    100
}

fn default_stall_threshold_ms() -> u64 {
    1200
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

fn default_mpris_name() -> String {
    "yesplaymusic".to_string()
}

fn default_sources() -> Vec<LyricSourceConfig> {
    vec![
        LyricSourceConfig {
            format: LyricFormat::Lrc,
            rank: 1,
            urls: vec!["http://127.0.0.1:10754/lyric?id={id}".to_string()],
            credit: Some("From：网易云逐句".to_string()),
        },
        LyricSourceConfig {
            format: LyricFormat::Yrc,
            rank: 2,
            urls: vec!["http://127.0.0.1:3000/lyric/new?id={id}".to_string()],
            credit: Some("From：网易云逐字".to_string()),
        },
        LyricSourceConfig {
            format: LyricFormat::Ttml,
            rank: 3,
            urls: vec!["https://amll.mirror.dimeta.top/api/db/ncm-lyrics/{id}.ttml".to_string()],
            credit: None,
        },
    ]
}

impl PlayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn refetch_interval(&self) -> Duration {
        Duration::from_millis(self.refetch_interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn mpris_destination(&self) -> String {
        format!("org.mpris.MediaPlayer2.{}", self.mpris_name)
    }
}

impl BridgeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl Config {
    /// Load from the default location, writing a default file on first run.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.bridge.endpoint;
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(ConfigError::InvalidEndpoint(endpoint.clone()));
        }
        if self.player.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("player.poll_interval_ms"));
        }
        if self.player.refetch_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("player.refetch_interval_ms"));
        }
        if self.player.fetch_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval("player.fetch_timeout_secs"));
        }

        let mut seen = HashSet::new();
        for source in &self.lyrics.sources {
            if !seen.insert(source.rank) {
                return Err(ConfigError::DuplicateRank(source.rank));
            }
            if source.urls.is_empty() {
                return Err(ConfigError::NoUrls(source.rank));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            player: PlayerConfig::default(),
            lyrics: LyricsConfig::default(),
        }
    }
}
