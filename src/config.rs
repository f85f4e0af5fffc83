use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_SERVER: &str = "CHATSYNC_SERVER";
pub const ENV_API: &str = "CHATSYNC_API";
pub const ENV_TOKEN: &str = "CHATSYNC_TOKEN";

/// Client-side timers. None of these are negotiated with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub fallback_ms: u64,
    pub typing_idle_ms: u64,
    pub typing_display_ms: u64,
    pub mark_read_debounce_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            fallback_ms: 5000,
            typing_idle_ms: 2000,
            typing_display_ms: 3000,
            mark_read_debounce_ms: 100,
        }
    }
}

impl Timeouts {
    pub fn fallback(&self) -> Duration {
        Duration::from_millis(self.fallback_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_display(&self) -> Duration {
        Duration::from_millis(self.typing_display_ms)
    }

    pub fn mark_read_debounce(&self) -> Duration {
        Duration::from_millis(self.mark_read_debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            attempts: 5,
            backoff_ms: 1000,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Socket.IO server, `http(s)://host[:port]`.
    pub server_url: String,
    /// REST base url.
    pub api_url: String,
    pub history_page_size: u32,
    pub timeouts: Timeouts,
    pub reconnect: ReconnectPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            server_url: "http://localhost:5000".to_string(),
            api_url: "http://localhost:5000".to_string(),
            history_page_size: 50,
            timeouts: Timeouts::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Config file if present, defaults otherwise, then environment overrides.
    pub fn load() -> Result<Self> {
        let path = get_config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            SyncConfig::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: SyncConfig = serde_json::from_str(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn apply_env(&mut self) {
        if let Ok(server) = env::var(ENV_SERVER) {
            self.server_url = server;
        }
        if let Ok(api) = env::var(ENV_API) {
            self.api_url = api;
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Credentials {
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Credentials {
    pub fn new(user_id: &str, user_name: &str, token: &str) -> Self {
        Credentials {
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            token: Some(BASE64.encode(token)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().map(|encoded| {
            String::from_utf8(BASE64.decode(encoded).unwrap_or_default()).unwrap_or_default()
        })
    }
}

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config and credential files at `dir`. Only the first call wins.
pub fn set_config_dir_override(dir: PathBuf) -> bool {
    CONFIG_DIR_OVERRIDE.set(dir).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = match CONFIG_DIR_OVERRIDE.get() {
        Some(dir) => dir.clone(),
        None => dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?
            .join("chatsync"),
    };

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn save_credentials(credentials: &Credentials) -> Result<()> {
    save_credentials_to(&get_config_dir()?.join("credentials.json"), credentials)
}

pub fn load_credentials() -> Result<Option<Credentials>> {
    load_credentials_from(&get_config_dir()?.join("credentials.json"))
}

pub fn save_credentials_to(path: &Path, credentials: &Credentials) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, credentials)?;
    info!("Credentials saved for {}", credentials.user_id);
    Ok(())
}

pub fn load_credentials_from(path: &Path) -> Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let credentials: Credentials = serde_json::from_str(&contents)?;
    info!("Loaded credentials for {} from {}", credentials.user_id, path.display());
    Ok(Some(credentials))
}
