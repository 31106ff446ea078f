use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SETTINGS_FILE: &str = "ballotdesk_settings.json";

/// Directory holding settings and the operation log.
pub(crate) fn app_data_dir() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        let app_dir = config_dir.join("ballotdesk");
        if !app_dir.exists() {
            let _ = fs::create_dir_all(&app_dir);
        }
        app_dir
    } else {
        PathBuf::from(".")
    }
}

/// User settings that persist between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Selected network chain ID
    pub selected_chain_id: u64,
    /// Custom RPC overrides per chain ID
    #[serde(default)]
    pub custom_rpcs: HashMap<u64, String>,
    /// Connector token of the last selected wallet, used for silent reconnect
    #[serde(default)]
    pub cached_provider: Option<String>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            selected_chain_id: crate::config::DEFAULT_CHAIN_ID,
            custom_rpcs: HashMap::new(),
            cached_provider: None,
        }
    }
}

impl UserSettings {
    /// Get the settings file path
    pub fn settings_path() -> PathBuf {
        app_data_dir().join(SETTINGS_FILE)
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        Self::load_from(&Self::settings_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(settings) => {
                        tracing::debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse settings file: {}", e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read settings file: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::settings_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        tracing::debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Get custom RPC for a chain, or None if using default
    pub fn get_custom_rpc(&self, chain_id: u64) -> Option<&String> {
        self.custom_rpcs.get(&chain_id).filter(|s| !s.is_empty())
    }

    /// Set custom RPC for a chain (empty string removes the override)
    pub fn set_custom_rpc(&mut self, chain_id: u64, rpc: String) {
        if rpc.trim().is_empty() {
            self.custom_rpcs.remove(&chain_id);
        } else {
            self.custom_rpcs.insert(chain_id, rpc.trim().to_string());
        }
    }
}

/// Durable single-slot storage for the last selected provider.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn store(&self, token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// `TokenStore` backed by the settings file.
pub struct SettingsTokenStore {
    path: PathBuf,
}

impl SettingsTokenStore {
    pub fn new() -> Self {
        Self::at(UserSettings::settings_path())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn update(&self, token: Option<&str>) -> Result<()> {
        let mut settings = UserSettings::load_from(&self.path);
        let token = token.map(str::to_string);
        if settings.cached_provider == token {
            return Ok(());
        }
        settings.cached_provider = token;
        settings.save_to(&self.path)
    }
}

impl Default for SettingsTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for SettingsTokenStore {
    fn load(&self) -> Option<String> {
        UserSettings::load_from(&self.path)
            .cached_provider
            .filter(|t| !t.trim().is_empty())
    }

    fn store(&self, token: &str) -> Result<()> {
        self.update(Some(token))
    }

    fn clear(&self) -> Result<()> {
        self.update(None)
    }
}

/// In-process `TokenStore`, for embedding without a settings file.
#[derive(Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn with_token(token: &str) -> Self {
        Self {
            slot: Mutex::new(Some(token.to_string())),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<String> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    fn store(&self, token: &str) -> Result<()> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(token.to_string());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
        Ok(())
    }
}
