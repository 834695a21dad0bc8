use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Scene path fragment of the player's hideout.
pub const DEFAULT_REFUGE_SCENE: &str = "01SD/XZ_YuJinZhiXiBiNanSuo200";

/// Scene path prefixes of seasonal mechanic zones opened from inside a map.
pub const DEFAULT_LEAGUE_PREFIXES: &[&str] = &["05ZD/", "06YS/", "07HD/"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Show values in Flame Elementium.
    #[default]
    Value,
    /// Show item quantities.
    Items,
}

impl DisplayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayMode::Value => "value",
            DisplayMode::Items => "items",
        }
    }
}

impl FromStr for DisplayMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "value" => Ok(DisplayMode::Value),
            "items" => Ok(DisplayMode::Items),
            other => Err(ConfigError::Validation(format!(
                "unknown display mode '{}'",
                other
            ))),
        }
    }
}

/// Auction house fee applied to item values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaxPolicy {
    pub enabled: bool,
    pub rate: f64,
}

impl Default for TaxPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 0.125,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub display_mode: DisplayMode,
    pub tax_enabled: bool,
    pub tax_rate: f64,
    /// Compute session rates from wall-clock time including the open map.
    pub use_real_time_stats: bool,
    /// Overrides UE_game.log auto-detection.
    pub log_path: Option<PathBuf>,
    /// Minimum InitBagData entries accepted as a full inventory snapshot.
    pub min_init_items: usize,
    pub max_pending_searches: usize,
    pub max_sessions: usize,
    pub refuge_scene: String,
    pub league_zone_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_mode: DisplayMode::Value,
            tax_enabled: false,
            tax_rate: 0.125,
            use_real_time_stats: false,
            log_path: None,
            min_init_items: 20,
            max_pending_searches: 256,
            max_sessions: 100,
            refuge_scene: DEFAULT_REFUGE_SCENE.to_string(),
            league_zone_prefixes: DEFAULT_LEAGUE_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl Config {
    pub fn tax(&self) -> TaxPolicy {
        TaxPolicy {
            enabled: self.tax_enabled,
            rate: self.tax_rate,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.tax_rate) {
            return Err(ConfigError::Validation(format!(
                "tax_rate must be within [0, 1), got {}",
                self.tax_rate
            )));
        }
        if self.refuge_scene.trim().is_empty() {
            return Err(ConfigError::Validation(
                "refuge_scene must not be empty".to_string(),
            ));
        }
        if self.max_pending_searches == 0 {
            return Err(ConfigError::Validation(
                "max_pending_searches must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let pretty = serde_json::to_string_pretty(self)?;
        fs::write(path, pretty)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mode_parse() {
        assert_eq!("value".parse::<DisplayMode>().unwrap(), DisplayMode::Value);
        assert_eq!("items".parse::<DisplayMode>().unwrap(), DisplayMode::Items);
        assert!("graph".parse::<DisplayMode>().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"tax_enabled": true}"#).unwrap();
        assert!(config.tax_enabled);
        assert_eq!(config.tax_rate, 0.125);
        assert_eq!(config.min_init_items, 20);
        assert_eq!(config.refuge_scene, DEFAULT_REFUGE_SCENE);
    }

    #[test]
    fn test_validation_rejects_bad_rate() {
        let config = Config {
            tax_rate: 1.5,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            display_mode: DisplayMode::Items,
            use_real_time_stats: true,
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
