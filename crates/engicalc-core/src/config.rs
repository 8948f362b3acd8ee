use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::identity::IdentityPolicy;

/// Environment variable overriding [`EvaluatorConfig::endpoint`].
pub const ENV_EVALUATOR_URL: &str = "ENGICALC_EVALUATOR_URL";
/// Environment variable overriding [`EvaluatorConfig::timeout_secs`].
pub const ENV_TIMEOUT_SECS: &str = "ENGICALC_TIMEOUT_SECS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where and how to reach the calculation service.
    pub evaluator: EvaluatorConfig,
    /// Which fenced blocks count as calculations.
    pub extractor: ExtractorConfig,
    /// How calculation blocks are keyed across re-parses.
    pub identity: IdentityPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Base URL of the calculation API, e.g. `http://127.0.0.1:8000/api`.
    pub endpoint: String,
    /// Upper bound on a single evaluator call. `0` disables the bound.
    pub timeout_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/api".to_owned(),
            timeout_secs: 30,
        }
    }
}

impl EvaluatorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Where the calculation marker may appear inside a fenced block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerPlacement {
    /// The marker must be the first non-blank line.
    #[default]
    FirstLine,
    /// The marker may be on any line of the block.
    Anywhere,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub marker: SmolStr,
    /// Fence languages that may carry the marker.
    pub languages: Vec<SmolStr>,
    pub marker_placement: MarkerPlacement,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            marker: SmolStr::new_static("%%calc"),
            languages: vec![SmolStr::new_static("python")],
            marker_placement: MarkerPlacement::FirstLine,
        }
    }
}

impl ExtractorConfig {
    pub fn is_executable_language(&self, lang: &str) -> bool {
        self.languages.iter().any(|l| l.eq_ignore_ascii_case(lang))
    }
}

impl Config {
    /// Load a config file, picking the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&text)?,
            Some("json") => serde_json::from_str(&text)?,
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    path: path.to_path_buf(),
                });
            }
        };
        tracing::debug!(target: "engicalc::config", path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Apply `ENGICALC_*` environment overrides on top of this config.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    fn with_overrides_from(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(url) = lookup(ENV_EVALUATOR_URL) {
            self.evaluator.endpoint = url;
        }
        if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
            self.evaluator.timeout_secs = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_TIMEOUT_SECS,
                value,
            })?;
        }
        Ok(self)
    }
}
