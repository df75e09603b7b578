//! Kernel configuration, persisted as TOML.
//!
//! Every field has a serde default so a partial (or empty) file is valid.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, KernelResult};

/// How ties between indifferent candidates are broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExplorationMode {
    /// Earliest candidate in preference order.
    #[default]
    First,
    Last,
    /// Uniformly random candidate.
    Random,
    /// Best numeric value with probability `1 - epsilon`, otherwise random.
    EpsilonGreedy,
    /// Boltzmann selection over numeric values.
    Softmax,
}

impl std::fmt::Display for ExplorationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExplorationMode::First => "first",
            ExplorationMode::Last => "last",
            ExplorationMode::Random => "random",
            ExplorationMode::EpsilonGreedy => "epsilon-greedy",
            ExplorationMode::Softmax => "softmax",
        };
        f.write_str(name)
    }
}

/// Per-reasoner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Elaboration waves allowed per phase before the phase is cut short.
    #[serde(default = "default_max_elaborations")]
    pub max_elaborations: u32,
    /// Deepest goal the decider may create before halting.
    #[serde(default = "default_max_goal_depth")]
    pub max_goal_depth: u32,
    /// Tie-break policy for indifferent candidates.
    #[serde(default)]
    pub exploration: ExplorationMode,
    /// Exploration rate for `epsilon-greedy`.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Temperature for `softmax`.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Seed for the selection RNG. Entropy-seeded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// When set, a state no-change waits instead of creating a sub-goal.
    #[serde(default)]
    pub wait_on_state_no_change: bool,
}

fn default_max_elaborations() -> u32 {
    100
}
fn default_max_goal_depth() -> u32 {
    100
}
fn default_epsilon() -> f64 {
    0.1
}
fn default_temperature() -> f64 {
    1.0
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_elaborations: default_max_elaborations(),
            max_goal_depth: default_max_goal_depth(),
            exploration: ExplorationMode::default(),
            epsilon: default_epsilon(),
            temperature: default_temperature(),
            seed: None,
            wait_on_state_no_change: false,
        }
    }
}

impl KernelConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> KernelResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty TOML.
    pub fn to_toml_string(&self) -> KernelResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::Parse {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> KernelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    /// Save to a TOML file, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> KernelResult<()> {
        let content = self.to_toml_string()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| {
            ConfigError::Write {
                path: path.display().to_string(),
                source: e,
            }
            .into()
        })
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.max_elaborations == 0 {
            return Err(invalid("max_elaborations must be at least 1"));
        }
        if self.max_goal_depth < 2 {
            return Err(invalid("max_goal_depth must be at least 2"));
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(invalid("epsilon must lie in [0, 1]"));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(invalid("temperature must be a positive finite number"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> crate::error::KernelError {
    ConfigError::Invalid {
        message: message.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = KernelConfig::from_toml_str("").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.max_elaborations, 100);
        assert_eq!(config.exploration, ExplorationMode::First);
    }

    #[test]
    fn kebab_case_exploration_parses() {
        let config = KernelConfig::from_toml_str(
            "exploration = \"epsilon-greedy\"\nepsilon = 0.25\nseed = 7\n",
        )
        .unwrap();
        assert_eq!(config.exploration, ExplorationMode::EpsilonGreedy);
        assert_eq!(config.epsilon, 0.25);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn invalid_values_rejected() {
        assert!(KernelConfig::from_toml_str("epsilon = 1.5").is_err());
        assert!(KernelConfig::from_toml_str("max_elaborations = 0").is_err());
        assert!(KernelConfig::from_toml_str("temperature = 0.0").is_err());
    }

    #[test]
    fn unknown_mode_is_parse_error() {
        let err = KernelConfig::from_toml_str("exploration = \"greedy\"").unwrap_err();
        assert!(format!("{err}").contains("parse"));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kernel.toml");
        let config = KernelConfig {
            max_goal_depth: 12,
            exploration: ExplorationMode::Softmax,
            seed: Some(42),
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = KernelConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = KernelConfig::load(Path::new("/nonexistent/kernel.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::KernelError::Config(ConfigError::Read { .. })
        ));
    }
}
