//! Engine configuration
//!
//! All tunables live in one immutable [`EngineConfig`] handed to
//! [`crate::TacticEngine::new`]. [`ConfigLoader`] builds it with
//! hierarchical merging:
//!
//! 1. Programmatic defaults
//! 2. `tactic-bandit.yaml` in the working directory (optional)
//! 3. Environment variables (`TACTIC_*`, nested keys split on `__`)

use crate::policy::Policy;
use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Weights of the hybrid score
///
/// `score = exploitation*mean + uncertainty*sd - cost*cost + recency*decay`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridWeights {
    pub exploitation: f64,
    pub uncertainty: f64,
    pub cost: f64,
    pub recency: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            exploitation: 0.6,
            uncertainty: 0.2,
            cost: 0.1,
            recency: 0.1,
        }
    }
}

/// Immutable engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Evidence half-life in days (<= 0 disables decay)
    pub half_life_days: f64,

    /// UCB1 exploration constant `c`
    pub exploration_constant: f64,

    pub hybrid_weights: HybridWeights,

    /// Edges not updated for this many days are pruned (<= 0 disables)
    pub ttl_days: f64,

    /// Per-step fan-out kept by Top-K pruning (0 disables)
    pub top_k: usize,

    /// Entries returned by `recommend` unless overridden per call
    pub max_recommendations: usize,

    /// Policy used when a call does not pick one
    pub policy: Policy,

    /// SQLite file used by the CLI
    pub database_path: Option<PathBuf>,

    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            half_life_days: 7.0,
            exploration_constant: std::f64::consts::SQRT_2,
            hybrid_weights: HybridWeights::default(),
            ttl_days: 30.0,
            top_k: 8,
            max_recommendations: 3,
            policy: Policy::Ucb1,
            database_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// TTL pruning disabled, everything else default
    pub fn without_ttl() -> Self {
        Self {
            ttl_days: 0.0,
            ..Self::default()
        }
    }

    pub fn ttl_enabled(&self) -> bool {
        self.ttl_days.is_finite() && self.ttl_days > 0.0
    }

    pub fn top_k_enabled(&self) -> bool {
        self.top_k > 0
    }
}

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid half_life_days: {0}. Must be finite")]
    InvalidHalfLife(f64),

    #[error("Invalid exploration_constant: {0}. Must be finite and non-negative")]
    InvalidExplorationConstant(f64),

    #[error("Invalid hybrid weight `{name}`: {value}. Must be finite and non-negative")]
    InvalidHybridWeight { name: &'static str, value: f64 },

    #[error("Invalid ttl_days: {0}. Must be finite")]
    InvalidTtl(f64),

    #[error("Invalid max_recommendations: 0. Must be at least 1")]
    InvalidMaxRecommendations,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, then `tactic-bandit.yaml`, then `TACTIC_*` environment
    pub fn load() -> Result<EngineConfig> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file("tactic-bandit.yaml"))
            .merge(Env::prefixed("TACTIC_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific YAML file (no environment merge)
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<EngineConfig> {
        let config: EngineConfig = Figment::new()
            .merge(Serialized::defaults(EngineConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .with_context(|| {
                format!("Failed to load config from {}", path.as_ref().display())
            })?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Reject values that would make scores NaN
    ///
    /// Hybrid weights are deliberately not required to sum to 1.
    pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
        if !config.half_life_days.is_finite() {
            return Err(ConfigError::InvalidHalfLife(config.half_life_days));
        }

        if !config.exploration_constant.is_finite() || config.exploration_constant < 0.0 {
            return Err(ConfigError::InvalidExplorationConstant(
                config.exploration_constant,
            ));
        }

        let w = &config.hybrid_weights;
        for (name, value) in [
            ("exploitation", w.exploitation),
            ("uncertainty", w.uncertainty),
            ("cost", w.cost),
            ("recency", w.recency),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidHybridWeight { name, value });
            }
        }

        if !config.ttl_days.is_finite() {
            return Err(ConfigError::InvalidTtl(config.ttl_days));
        }

        if config.max_recommendations == 0 {
            return Err(ConfigError::InvalidMaxRecommendations);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.log_level.clone()));
        }

        Ok(())
    }
}
