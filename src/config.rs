//! Configuration management with layered loading
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. Global config: `$XDG_CONFIG_HOME/hierbase/hierbase.toml`
//! 3. Environment variables: `HIERBASE_*` prefix

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::application::error::ApplicationError;
use crate::domain::tabular::Dialect;

/// Unified configuration for hierbase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Minimum header-classification confidence; imports below it are
    /// rejected rather than guessed.
    pub min_header_confidence: f64,
    /// Precedence group assigned to mappings that do not declare one.
    pub default_precedence_group: String,
    /// Dialect preferred when a header row scores equally in both.
    pub default_dialect: Dialect,
    /// Highest allowed formula tier.
    pub max_formula_tier: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_header_confidence: 0.80,
            default_precedence_group: "1".to_string(),
            default_dialect: Dialect::Legacy,
            max_formula_tier: 5,
        }
    }
}

/// Raw settings for intermediate parsing (fields are Option to detect
/// "not specified").
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub min_header_confidence: Option<f64>,
    pub default_precedence_group: Option<String>,
    pub default_dialect: Option<Dialect>,
    pub max_formula_tier: Option<u8>,
}

/// Get the XDG config directory for hierbase.
pub fn global_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "hierbase").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("hierbase.toml"))
}

/// Load a TOML file into RawSettings for manual merging.
fn load_raw_settings(path: &Path) -> Result<RawSettings, ApplicationError> {
    let content = std::fs::read_to_string(path).map_err(|e| ApplicationError::Config {
        message: format!("read {}: {}", path.display(), e),
    })?;
    toml::from_str(&content).map_err(|e| ApplicationError::Config {
        message: format!("parse {}: {}", path.display(), e),
    })
}

impl Settings {
    /// Apply overlay config onto self; specified fields win.
    fn merge_with(&self, overlay: &RawSettings) -> Self {
        Self {
            min_header_confidence: overlay
                .min_header_confidence
                .unwrap_or(self.min_header_confidence),
            default_precedence_group: overlay
                .default_precedence_group
                .clone()
                .unwrap_or_else(|| self.default_precedence_group.clone()),
            default_dialect: overlay.default_dialect.unwrap_or(self.default_dialect),
            max_formula_tier: overlay.max_formula_tier.unwrap_or(self.max_formula_tier),
        }
    }

    /// Load settings with layered precedence.
    ///
    /// # Precedence (lowest to highest)
    /// 1. Compiled defaults
    /// 2. Global config: `$XDG_CONFIG_HOME/hierbase/hierbase.toml`
    /// 3. Environment variables: `HIERBASE_*` prefix
    pub fn load() -> Result<Self, ApplicationError> {
        let mut current = Self::default();

        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                let raw = load_raw_settings(&global_path)?;
                current = current.merge_with(&raw);
            }
        }

        current = Self::apply_env_overrides(current)?;
        current.validate()?;
        Ok(current)
    }

    /// Apply HIERBASE_* environment variables as explicit overrides.
    fn apply_env_overrides(mut settings: Self) -> Result<Self, ApplicationError> {
        let builder =
            Config::builder().add_source(Environment::with_prefix("HIERBASE").separator("__"));
        let config = builder.build().map_err(config_err)?;

        if let Ok(val) = config.get_float("min_header_confidence") {
            settings.min_header_confidence = val;
        }
        if let Ok(val) = config.get_string("default_precedence_group") {
            settings.default_precedence_group = val;
        }
        if let Ok(val) = config.get_string("default_dialect") {
            settings.default_dialect = match val.to_ascii_lowercase().as_str() {
                "legacy" => Dialect::Legacy,
                "current" => Dialect::Current,
                other => {
                    return Err(ApplicationError::Config {
                        message: format!("unknown dialect '{other}' (expected legacy or current)"),
                    })
                }
            };
        }
        if let Ok(val) = config.get_int("max_formula_tier") {
            settings.max_formula_tier =
                u8::try_from(val).map_err(|_| ApplicationError::Config {
                    message: format!("max_formula_tier {val} out of range"),
                })?;
        }

        Ok(settings)
    }

    fn validate(&self) -> Result<(), ApplicationError> {
        if !(0.0..=1.0).contains(&self.min_header_confidence) {
            return Err(ApplicationError::Config {
                message: format!(
                    "min_header_confidence {} outside 0.0..=1.0",
                    self.min_header_confidence
                ),
            });
        }
        if self.default_precedence_group.trim().is_empty() {
            return Err(ApplicationError::Config {
                message: "default_precedence_group must not be empty".to_string(),
            });
        }
        if self.max_formula_tier == 0 {
            return Err(ApplicationError::Config {
                message: "max_formula_tier must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Show the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ApplicationError> {
        toml::to_string_pretty(self).map_err(|e| ApplicationError::Config {
            message: format!("serialize config: {e}"),
        })
    }
}

fn config_err(e: ConfigError) -> ApplicationError {
    ApplicationError::Config {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_no_config_when_loading_then_uses_defaults() {
        let settings = Settings::default();
        assert!((settings.min_header_confidence - 0.80).abs() < 1e-9);
        assert_eq!(settings.default_precedence_group, "1");
        assert_eq!(settings.default_dialect, Dialect::Legacy);
        assert_eq!(settings.max_formula_tier, 5);
    }

    #[test]
    fn given_overlay_when_merging_then_specified_fields_win() {
        let base = Settings::default();
        let overlay = RawSettings {
            min_header_confidence: Some(0.9),
            default_dialect: Some(Dialect::Current),
            ..Default::default()
        };

        let merged = base.merge_with(&overlay);

        assert!((merged.min_header_confidence - 0.9).abs() < 1e-9);
        assert_eq!(merged.default_dialect, Dialect::Current);
        assert_eq!(merged.default_precedence_group, "1");
        assert_eq!(merged.max_formula_tier, 5);
    }

    #[test]
    fn given_empty_precedence_group_when_validating_then_errors() {
        let settings = Settings {
            default_precedence_group: "  ".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn given_out_of_range_confidence_when_validating_then_errors() {
        let settings = Settings {
            min_header_confidence: 1.5,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
