use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::api::models::SortSpec;
use crate::error::{Result, SyncError};
use crate::transport::ws::{KeepAlive, ReconnectPolicy};
use crate::utils::{normalize_url, socket_url};

const CONFIG_FILE: &str = "carebridge-sync.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub socket_url: Option<String>,
    pub token: Option<String>,
    pub conversation_page_size: u32,
    pub message_page_size: u32,
    pub connect_timeout_secs: u64,
    pub ack_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    /// Zero retries forever.
    pub max_reconnect_attempts: u32,
    /// Zero disables keepalive pings.
    pub keepalive_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub sort: SortSpec,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            socket_url: None,
            token: None,
            conversation_page_size: 20,
            message_page_size: 30,
            connect_timeout_secs: 10,
            ack_timeout_secs: 5,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 0,
            keepalive_interval_secs: 25,
            pong_timeout_secs: 10,
            sort: SortSpec::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(base_url: &str) -> Self {
        Self { base_url: normalize_url(base_url), ..Self::default() }
    }

    // TOML is the primary format. A JSON file left by older builds is read
    // once and rewritten as TOML.
    fn toml_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join(CONFIG_FILE))
    }

    fn legacy_json_path() -> Option<PathBuf> {
        let proj = ProjectDirs::from("com", "carebridge", "CareBridgeSync")?;
        Some(proj.config_dir().join("sync.json"))
    }

    /// Loads from the platform config directory, falling back to defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::toml_path() {
            match Self::load_from(&path) {
                Ok(config) => return config,
                Err(e) if path.exists() => log::warn!("ignoring {}: {e}", path.display()),
                Err(_) => {}
            }
        }

        if let Some(legacy) = Self::legacy_json_path() {
            if let Ok(config) = Self::load_legacy_json(&legacy) {
                if let Some(path) = Self::toml_path() {
                    if let Err(e) = config.save_to(&path) {
                        log::warn!("could not migrate {}: {e}", legacy.display());
                    }
                }
                return config;
            }
        }

        Self::default()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Ok(toml::from_str(&text)?)
    }

    pub fn load_legacy_json(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::toml_path().ok_or_else(|| SyncError::Config("no config dir".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::Config(e.to_string()))?;
        }
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(SyncError::Config("base_url is empty".into()));
        }
        if self.conversation_page_size == 0 || self.message_page_size == 0 {
            return Err(SyncError::Config("page sizes must be positive".into()));
        }
        Ok(())
    }

    pub fn push_url(&self) -> Result<Url> {
        match &self.socket_url {
            Some(url) => Url::parse(url).map_err(|e| SyncError::Config(e.to_string())),
            None => socket_url(&self.base_url),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn keepalive(&self) -> KeepAlive {
        KeepAlive {
            interval: Duration::from_secs(self.keepalive_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
        }
    }
}
