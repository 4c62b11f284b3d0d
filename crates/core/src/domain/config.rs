//! Configuration for the Ear controller
//!
//! This module provides:
//! - Configuration structs for logging, session and backend settings
//! - Zone layout templates applied to every new session
//! - TOML load/save through `tokio::fs`

use crate::domain::audio::AudioError;
use crate::domain::mixer::ZoneId;
use crate::domain::router::Router;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `ear_core=debug`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Session table settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Start new sessions unless `create_system` says otherwise
    pub auto_start: bool,

    /// Maximum live sessions (0 = unlimited)
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            max_sessions: 0,
        }
    }
}

/// Which audio engine drives the sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Cpal,
    Mock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,

    /// Output buffer size in frames
    pub buffer_size: u32,
}

impl BackendConfig {
    pub const MAX_BUFFER_SIZE: u32 = 8192;
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Cpal,
            buffer_size: 512,
        }
    }
}

/// A zone to create in every new session, with its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneTemplate {
    pub name: String,

    #[serde(default)]
    pub speakers: Vec<usize>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ZoneTemplate>,
}

impl ZoneTemplate {
    pub fn new(name: impl Into<String>, speakers: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            speakers,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: ZoneTemplate) -> Self {
        self.children.push(child);
        self
    }

    /// Create this zone and its children in `router`
    ///
    /// Speaker indices the router's device does not have are skipped, so one
    /// layout can serve devices of different widths.
    pub fn apply(
        &self,
        router: &mut Router,
        parent: Option<ZoneId>,
    ) -> std::result::Result<ZoneId, AudioError> {
        let count = router.num_speakers();
        let (speakers, skipped): (Vec<usize>, Vec<usize>) =
            self.speakers.iter().copied().partition(|s| *s < count);
        if !skipped.is_empty() {
            warn!(zone = %self.name, ?skipped, speakers = count, "Template speakers out of range");
        }

        let id = match parent {
            Some(parent) => router.create_zone_in(parent, &self.name, speakers)?,
            None => router.create_zone(&self.name, speakers)?,
        };
        for child in &self.children {
            child.apply(router, Some(id))?;
        }
        Ok(id)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("zone name must not be empty".to_string()));
        }
        check_unique(&self.name, &self.children)?;
        self.children.iter().try_for_each(ZoneTemplate::validate)
    }
}

fn check_unique(parent: &str, zones: &[ZoneTemplate]) -> Result<()> {
    let mut seen = HashSet::new();
    for zone in zones {
        if !seen.insert(zone.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "zone '{}' appears twice under {}",
                zone.name, parent
            )));
        }
    }
    Ok(())
}

/// Complete Ear configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    /// Default zone layout
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<ZoneTemplate>,
}

impl EarConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!(zones = config.zones.len(), "Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.buffer_size == 0 {
            return Err(ConfigError::Invalid("backend.buffer_size must be positive".to_string()));
        }
        if self.backend.buffer_size > BackendConfig::MAX_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "backend.buffer_size must be at most {}",
                BackendConfig::MAX_BUFFER_SIZE
            )));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.level must not be empty".to_string()));
        }
        check_unique("the top level", &self.zones)?;
        self.zones.iter().try_for_each(ZoneTemplate::validate)
    }

    /// Create every template zone in `router`
    pub fn apply_zones(&self, router: &mut Router) -> std::result::Result<Vec<ZoneId>, AudioError> {
        self.zones.iter().map(|t| t.apply(router, None)).collect()
    }

    /// Whether another session fits under `max_sessions`
    pub fn allows_session(&self, live: usize) -> bool {
        self.sessions.max_sessions == 0 || live < self.sessions.max_sessions
    }
}

/// Locates and loads the main config file
///
/// The file lives at `~/.config/ear/config.toml` unless a path is given.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Manage `config.toml` inside `config_dir`
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_path: config_dir.join("config.toml"),
        }
    }

    /// Manage an explicit file
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Returns `~/.config/ear` on Linux, `%APPDATA%\ear` on Windows
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("ear"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Load the file, falling back to defaults when it does not exist
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<EarConfig> {
        if !self.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, using defaults"
            );
            return Ok(EarConfig::default());
        }
        EarConfig::load_from_file(&self.config_path).await
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &EarConfig) -> Result<()> {
        config.save_to_file(&self.config_path).await
    }
}
