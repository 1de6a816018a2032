// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: config  —  settings file + environment overrides
//
//  Lookup order for the file:
//    1. --config <path>
//    2. $BLE_DFU_CONFIG
//    3. $XDG_CONFIG_HOME/ble-dfu/config.toml
//    4. ~/.config/ble-dfu/config.toml
//
//  Every field has a default, so a missing file is fine. After the file,
//  BLE_DFU_CATALOG_URL and BLE_DFU_TOOL override what it says.
//
//  Example:
//
//    catalog_url          = "https://example.com/bluefruit/catalog.json"
//    connect_timeout_secs = 20
//
//    [transfer]
//    program = "nrfutil-legacy-dfu"
//    args    = ["--address", "{device}", "{firmware}", "--init={init}"]
// ─────────────────────────────────────────────────────────────────────────────

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DfuError, Result};

const APP_DIR: &str = "ble-dfu";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Release catalog location. Required for `update`.
    pub catalog_url:            Option<String>,
    pub catalog_cache_ttl_secs: u64,
    pub connect_timeout_secs:   u64,
    pub identity_timeout_secs:  u64,
    pub transfer:               TransferSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog_url:            None,
            catalog_cache_ttl_secs: 24 * 60 * 60,
            connect_timeout_secs:   30,
            identity_timeout_secs:  30,
            transfer:               TransferSettings::default(),
        }
    }
}

/// External program that performs the actual DFU transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub program: Option<String>,
    /// Placeholders: `{device}`, `{firmware}`, `{init}`.
    pub args:    Vec<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            program: None,
            args:    vec!["{device}".into(), "{firmware}".into(), "--init={init}".into()],
        }
    }
}

impl Settings {
    /// Load settings from the first config file found, then apply the
    /// environment. An explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os("BLE_DFU_CONFIG").map(PathBuf::from);
        let (path, required) = match (explicit, from_env) {
            (Some(p), _) => (Some(p.to_path_buf()), true),
            (None, Some(p)) => (Some(p), true),
            (None, None) => (config_path(), false),
        };

        let mut settings = match path {
            Some(path) if path.is_file() => {
                log::debug!("loading settings from {}", path.display());
                let text = fs::read_to_string(&path)?;
                Self::from_toml_str(&text).map_err(|e| DfuError::Config {
                    path:    path.display().to_string(),
                    message: e.to_string(),
                })?
            }
            Some(path) if required => {
                return Err(DfuError::Config {
                    path:    path.display().to_string(),
                    message: "file not found".into(),
                });
            }
            _ => Self::default(),
        };

        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `BLE_DFU_*` overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("BLE_DFU_CATALOG_URL") {
            self.catalog_url = Some(url);
        }
        if let Some(tool) = non_empty("BLE_DFU_TOOL") {
            self.transfer.program = Some(tool);
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.identity_timeout_secs)
    }

    pub fn catalog_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_cache_ttl_secs)
    }
}

/// Default settings file location.
pub fn config_path() -> Option<PathBuf> {
    xdg_or_home("XDG_CONFIG_HOME", ".config").map(|d| d.join(APP_DIR).join("config.toml"))
}

/// Where the downloaded release catalog is cached.
pub fn catalog_cache_path() -> Option<PathBuf> {
    xdg_or_home("XDG_CACHE_HOME", ".cache").map(|d| d.join(APP_DIR).join("catalog.json"))
}

fn xdg_or_home(xdg_var: &str, fallback: &str) -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(xdg_var).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(fallback))
}
