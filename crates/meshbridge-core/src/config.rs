//! Engine configuration.
//!
//! Configuration is read from TOML with the following priority:
//! explicit path > `MESHBRIDGE_CONFIG` > `./meshbridge.toml` > built-in
//! defaults. Individual environment variables are applied on top.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "meshbridge.toml";

/// Built-in defaults.
pub mod defaults {
    /// Recent values kept per datapoint by the learner.
    pub const HISTORY_LIMIT: usize = 10;
    /// First zone id handed out in a session.
    pub const ZONE_ID_BASE: u8 = 1;
    /// Retries of the proactive enroll response.
    pub const PROACTIVE_RETRIES: u8 = 1;
    /// The proactive enroll response is retried at most once.
    pub const MAX_PROACTIVE_RETRIES: u8 = 1;
    /// Chemistry list used when a battery device has no class default.
    pub const GENERIC_CHEMISTRY: &[&str] = &["OTHER"];
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG: &str = "MESHBRIDGE_CONFIG";
    pub const HISTORY_LIMIT: &str = "MESHBRIDGE_HISTORY_LIMIT";
    pub const ZONE_ID_BASE: &str = "MESHBRIDGE_ZONE_ID_BASE";

    /// Config path from the environment, if set.
    pub fn config_path() -> Option<std::path::PathBuf> {
        std::env::var(CONFIG)
            .ok()
            .filter(|s| !s.is_empty())
            .map(Into::into)
    }

    /// History bound override, if set and parseable.
    pub fn history_limit<F>(lookup: &F) -> Option<usize>
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(HISTORY_LIMIT).and_then(|s| s.trim().parse().ok())
    }

    /// Zone id base override, if set and parseable.
    pub fn zone_id_base<F>(lookup: &F) -> Option<u8>
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(ZONE_ID_BASE).and_then(|s| s.trim().parse().ok())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Scaling applied to raw temperature datapoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureScaling {
    /// `|raw| > 1000` is hundredths, anything else tenths.
    #[default]
    Auto,
    Tenths,
    Hundredths,
    /// Value already in degrees.
    Direct,
}

impl TemperatureScaling {
    pub fn scale(self, raw: i64) -> f64 {
        let raw = raw as f64;
        match self {
            Self::Auto if raw.abs() > 1000.0 => raw / 100.0,
            Self::Auto | Self::Tenths => raw / 10.0,
            Self::Hundredths => raw / 100.0,
            Self::Direct => raw,
        }
    }
}

/// How a datapoint value becomes a capability value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatapointTransform {
    /// Non-zero is `true`.
    Boolean,
    /// Numeric value as is.
    Direct,
    /// Numeric value divided by `divisor`.
    Divide { divisor: f64 },
    /// 0..=255 mapped onto 0.0..=1.0.
    Fraction255,
    /// Clamped to 0..=100.
    Percent,
    /// Scaled with the configured temperature strategy.
    Temperature,
}

/// One datapoint id to capability rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapointRule {
    pub id: u8,
    pub capability: String,
    pub transform: DatapointTransform,
}

impl DatapointRule {
    pub fn new(id: u8, capability: impl Into<String>, transform: DatapointTransform) -> Self {
        Self {
            id,
            capability: capability.into(),
            transform,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub history_limit: usize,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            history_limit: defaults::HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub zone_id_base: u8,
    pub proactive_retries: u8,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            zone_id_base: defaults::ZONE_ID_BASE,
            proactive_retries: defaults::PROACTIVE_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub temperature: TemperatureScaling,
    /// Rules replacing or extending the built-in datapoint table, keyed by id.
    pub datapoints: Vec<DatapointRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Battery chemistries per device class (`contact`, `remote`, `lock`, ...).
    pub chemistry: BTreeMap<String, Vec<String>>,
    /// Used when a battery device has no class entry.
    pub fallback: Vec<String>,
}

impl Default for PowerConfig {
    fn default() -> Self {
        let mut chemistry = BTreeMap::new();
        let coin = || vec!["CR2032".to_string(), "CR2450".to_string(), "CR1632".to_string()];
        chemistry.insert("contact".to_string(), coin());
        chemistry.insert("motion".to_string(), coin());
        chemistry.insert("climate".to_string(), coin());
        chemistry.insert("remote".to_string(), vec!["CR2032".to_string()]);
        chemistry.insert("lock".to_string(), vec!["AA".to_string()]);
        for mains in ["switch", "plug", "light"] {
            chemistry.insert(mains.to_string(), Vec::new());
        }
        Self {
            chemistry,
            fallback: defaults::GENERIC_CHEMISTRY
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub learner: LearnerConfig,
    pub zone: ZoneConfig,
    pub mapper: MapperConfig,
    pub power: PowerConfig,
}

impl EngineConfig {
    /// Parse TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            origin: "inline config".to_string(),
            message: e.to_string(),
        })
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            origin: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load configuration (explicit path > env > ./meshbridge.toml > defaults).
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let source = explicit
            .map(Path::to_path_buf)
            .or_else(env_vars::config_path)
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.exists().then_some(local)
            });

        let mut config = match source {
            Some(path) => {
                info!(category = "config", path = %path.display(), "Loading engine config");
                Self::from_file(&path)?
            }
            None => {
                debug!(category = "config", "No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply individual overrides looked up through `lookup`.
    ///
    /// Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(limit) = env_vars::history_limit(&lookup) {
            debug!(category = "config", history_limit = limit, "Env override");
            self.learner.history_limit = limit;
        }
        if let Some(base) = env_vars::zone_id_base(&lookup) {
            debug!(category = "config", zone_id_base = base, "Env override");
            self.zone.zone_id_base = base;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.learner.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "learner.history_limit must be at least 1".to_string(),
            ));
        }
        if self.zone.proactive_retries > defaults::MAX_PROACTIVE_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "zone.proactive_retries must be 0 or {}, got {}",
                defaults::MAX_PROACTIVE_RETRIES,
                self.zone.proactive_retries
            )));
        }
        if self.power.fallback.is_empty() {
            return Err(ConfigError::Invalid(
                "power.fallback must name at least one chemistry".to_string(),
            ));
        }
        for rule in &self.mapper.datapoints {
            if rule.capability.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "mapper rule for datapoint {} has an empty capability",
                    rule.id
                )));
            }
            if let DatapointTransform::Divide { divisor } = rule.transform {
                if divisor == 0.0 || !divisor.is_finite() {
                    return Err(ConfigError::Invalid(format!(
                        "mapper rule for datapoint {} has divisor {}",
                        rule.id, divisor
                    )));
                }
            }
        }
        Ok(())
    }
}
