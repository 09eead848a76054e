//! Project settings loader.

use crate::compactor::CompactConfig;
use crate::interfaces::RuntimeError;
use crate::model_selector::ModelTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Settings file location relative to the project root.
pub const SETTINGS_PATH: &str = ".claw/settings.yaml";

/// Runtime settings. Every field has a default, so a partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub system_prompt: String,
    pub max_iterations: usize,
    /// Context limit in estimated tokens.
    pub token_limit: usize,
    pub compact: CompactConfig,
    /// Subagent type → model tier.
    pub subagent_tiers: HashMap<String, ModelTier>,
    /// Rules file, relative to the project root unless absolute.
    pub rules_file: PathBuf,
    /// Histories kept in memory before the least recently used is evicted.
    pub max_sessions: usize,
    /// Tags merged into every response.
    pub tags: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_iterations: 16,
            token_limit: 200_000,
            compact: CompactConfig::default(),
            subagent_tiers: HashMap::new(),
            rules_file: PathBuf::from(".claw/rules.md"),
            max_sessions: 1024,
            tags: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load `<project_root>/.claw/settings.yaml`, or defaults when absent.
    pub fn load(project_root: &Path) -> Result<Self, RuntimeError> {
        let path = project_root.join(SETTINGS_PATH);
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    /// Load settings from an explicit YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file is missing, empty, not valid YAML,
    /// or holds out-of-range values.
    pub fn from_file(path: &Path) -> Result<Self, RuntimeError> {
        if !path.exists() {
            return Err(RuntimeError::ConfigError(format!(
                "Settings file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;

        if content.trim().is_empty() {
            return Err(RuntimeError::ConfigError(
                "Settings file is empty".to_string(),
            ));
        }

        let settings: Settings = serde_yaml::from_str(&content)?;
        settings.validate()?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_iterations == 0 {
            return Err(RuntimeError::ConfigError(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.token_limit == 0 {
            return Err(RuntimeError::ConfigError(
                "token_limit must be at least 1".to_string(),
            ));
        }
        self.compact.validate()
    }

    /// Rules file resolved against `project_root`.
    pub fn rules_path(&self, project_root: &Path) -> PathBuf {
        if self.rules_file.is_absolute() {
            self.rules_file.clone()
        } else {
            project_root.join(&self.rules_file)
        }
    }
}
