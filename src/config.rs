use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::fetch::DEFAULT_TIMEOUT_MS;

/// User configuration for profile provisioning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Optional override for where the cache and the combined file live.
    pub state_dir: Option<PathBuf>,
    /// Optional override for the workspace searched for a `.profiles` marker.
    pub workspace_dir: Option<PathBuf>,
    /// Preference customization file already provided by the host. When set,
    /// the merge is skipped so an explicit customization is never overridden.
    pub customization_file: Option<PathBuf>,
    pub fetch: FetchSettings,
    pub provider: ProviderSettings,
    /// Application property table backing `${sysprop:...}` variables.
    pub properties: BTreeMap<String, String>,
}

/// Settings for the remote profile download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Connect/read timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Profile provider declared in the settings file, for installations that pin
/// their profile source instead of passing it on every start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Profile names in application order.
    pub profiles: Vec<String>,
    /// Where the profiles are served from (file, http, or https URL).
    pub location: Option<String>,
    /// Values backing `${custom:...}` variables.
    pub variables: BTreeMap<String, String>,
}

impl Settings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory {}", parent.display())
                })?;
            }
            let serialised = serde_json::to_string_pretty(&settings)?;
            fs::write(path, serialised)
                .with_context(|| format!("Failed to write default config to {}", path.display()))?;
            Ok(settings)
        }
    }

    /// Resolve the directory holding the profile cache and the combined file.
    pub fn resolve_state_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.state_dir {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("dev", "preflight", "Preflight")
            .context("Unable to resolve platform data directory")?;
        Ok(dirs.data_dir().to_path_buf())
    }

    /// Resolve the workspace directory searched for a profile marker.
    pub fn resolve_workspace_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.workspace_dir {
            return Ok(path.clone());
        }
        env::current_dir().context("Unable to resolve the current directory")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }
}

/// Default path of the settings file.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "preflight", "Preflight")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("preflight.json"))
}
