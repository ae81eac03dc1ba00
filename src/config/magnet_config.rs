//! `MagnetConfig` and its loading, validation and error type.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;

/// Magnet loss hyper-parameters.
///
/// Every field is optional in TOML; missing ones take the values in
/// [`defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnetConfig {
    /// Sub-clusters per class
    #[serde(default = "default_k")]
    pub k: usize,

    /// Clusters per batch
    #[serde(default = "default_m")]
    pub m: usize,

    /// Examples per cluster in a batch
    #[serde(default = "default_d")]
    pub d: usize,

    /// Margin
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Lloyd iteration cap for each per-class k-means
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Seeds both batch sampling and k-means initialisation. Unset means
    /// entropy-seeded (non-reproducible) runs.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Recompute every cluster loss from the new assignments after a
    /// recluster instead of keeping the stale per-cluster means.
    #[serde(default)]
    pub refresh_losses_on_recluster: bool,
}

fn default_k() -> usize {
    defaults::K
}
fn default_m() -> usize {
    defaults::M
}
fn default_d() -> usize {
    defaults::D
}
fn default_alpha() -> f64 {
    defaults::ALPHA
}
fn default_max_iterations() -> usize {
    defaults::MAX_ITERATIONS
}

impl Default for MagnetConfig {
    fn default() -> Self {
        Self {
            k: defaults::K,
            m: defaults::M,
            d: defaults::D,
            alpha: defaults::ALPHA,
            max_iterations: defaults::MAX_ITERATIONS,
            seed: None,
            refresh_losses_on_recluster: false,
        }
    }
}

impl MagnetConfig {
    /// Load configuration using the standard search order:
    /// 1. `$MAGNET_CONFIG` environment variable
    /// 2. `./magnet.toml` in the current working directory
    /// 3. Built-in defaults
    ///
    /// A file that fails to load is logged and skipped.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), k = config.k, m = config.m, d = config.d, "Loaded magnet config from MAGNET_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from MAGNET_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "MAGNET_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(defaults::LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(k = config.k, m = config.m, d = config.d, "Loaded magnet config from ./magnet.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./magnet.toml, using defaults");
                }
            }
        }

        info!("No magnet.toml found, using built-in defaults");
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(Some(path.to_path_buf()), inner),
            other => other,
        })
    }

    /// Parse and validate TOML text. Unknown keys are logged, not rejected.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(None, e))?;
        config.validate()?;
        for w in super::validation::validate_ranges(&config) {
            warn!("{}", w);
        }
        Ok(config)
    }

    /// Render as TOML, e.g. to record the effective settings of a run.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check every field, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.k == 0 {
            errors.push("k must be at least 1".to_string());
        }
        if self.m < 2 {
            errors.push(format!(
                "m ({}) must be at least 2 (one seed cluster plus impostors)",
                self.m
            ));
        }
        if self.d == 0 {
            errors.push("d must be at least 1".to_string());
        }
        if !self.alpha.is_finite() {
            errors.push(format!("alpha ({}) must be finite", self.alpha));
        }
        if self.max_iterations == 0 {
            errors.push("max_iterations must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    /// Path is `None` when parsing text that did not come from a file.
    Parse(Option<PathBuf>, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(Some(path), e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Parse(None, e) => write!(f, "Config parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}
