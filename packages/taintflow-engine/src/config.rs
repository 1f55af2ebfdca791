//! Engine configuration
//!
//! Preset-based progressive disclosure: most callers pick a preset and
//! optionally override individual knobs through the builder methods. Every
//! value is range-checked by `validate()`; out-of-range values are rejected
//! with a precise error rather than silently clamped to a default.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Valid `max_depth` range for path enumeration (call-chain hops).
pub const MAX_DEPTH_MIN: usize = 1;
pub const MAX_DEPTH_MAX: usize = 7;

/// Configuration error type
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: &'static str,
        value: String,
        min: String,
        max: String,
        hint: &'static str,
    },

    /// Unknown preset name
    #[error("Unknown preset '{0}'. Valid presets: fast, balanced, thorough")]
    UnknownPreset(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    fn range(
        field: &'static str,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: &'static str,
    ) -> Self {
        Self::Range {
            field,
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint,
        }
    }
}

/// Analysis presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Shallow traversal, tight caps, quick CI feedback
    Fast,
    /// Default trade-off
    #[default]
    Balanced,
    /// Deepest allowed traversal, generous caps
    Thorough,
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fast" => Ok(Preset::Fast),
            "balanced" => Ok(Preset::Balanced),
            "thorough" => Ok(Preset::Thorough),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum source-to-sink hop count for path enumeration (1..=7)
    pub max_depth: usize,

    /// Findings below this confidence are kept as low-confidence
    /// diagnostics, not primary findings (0.0..=1.0)
    pub confidence_threshold: f32,

    /// Per-function worklist block-visit cap; exceeding it truncates the
    /// propagation, it is not an error (1..=100_000)
    pub worklist_max_iterations: usize,

    /// Fixed-point rounds for mutually recursive clusters; summaries still
    /// changing at the cap are published as truncated lower bounds (1..=100)
    pub scc_max_rounds: usize,

    /// Maximum paths to materialize (1..=100_000)
    pub max_paths: usize,

    /// Cooperative deadline; None disables the timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_preset(Preset::Balanced)
    }
}

impl EngineConfig {
    pub fn from_preset(preset: Preset) -> Self {
        match preset {
            Preset::Fast => Self {
                max_depth: 3,
                confidence_threshold: 0.5,
                worklist_max_iterations: 2_000,
                scc_max_rounds: 3,
                max_paths: 500,
                timeout_secs: Some(60),
            },
            Preset::Balanced => Self {
                max_depth: 5,
                confidence_threshold: 0.5,
                worklist_max_iterations: 10_000,
                scc_max_rounds: 5,
                max_paths: 5_000,
                timeout_secs: Some(300),
            },
            Preset::Thorough => Self {
                max_depth: 7,
                confidence_threshold: 0.3,
                worklist_max_iterations: 50_000,
                scc_max_rounds: 10,
                max_paths: 50_000,
                timeout_secs: Some(1_800),
            },
        }
    }

    /// Builder: set max_depth
    pub fn max_depth(mut self, v: usize) -> Self {
        self.max_depth = v;
        self
    }

    /// Builder: set confidence threshold
    pub fn confidence_threshold(mut self, v: f32) -> Self {
        self.confidence_threshold = v;
        self
    }

    /// Builder: set worklist iteration cap
    pub fn worklist_max_iterations(mut self, v: usize) -> Self {
        self.worklist_max_iterations = v;
        self
    }

    /// Builder: set recursion-cluster round cap
    pub fn scc_max_rounds(mut self, v: usize) -> Self {
        self.scc_max_rounds = v;
        self
    }

    /// Builder: set path cap
    pub fn max_paths(mut self, v: usize) -> Self {
        self.max_paths = v;
        self
    }

    /// Builder: set timeout
    pub fn timeout_secs(mut self, v: Option<u64>) -> Self {
        self.timeout_secs = v;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_depth < MAX_DEPTH_MIN || self.max_depth > MAX_DEPTH_MAX {
            return Err(ConfigError::range(
                "max_depth",
                self.max_depth,
                MAX_DEPTH_MIN,
                MAX_DEPTH_MAX,
                "Path enumeration depth is bounded to keep BFS frontiers finite",
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::range(
                "confidence_threshold",
                self.confidence_threshold,
                "0.0",
                "1.0",
                "Confidence scores are normalized to [0, 1]",
            ));
        }
        if self.worklist_max_iterations == 0 || self.worklist_max_iterations > 100_000 {
            return Err(ConfigError::range(
                "worklist_max_iterations",
                self.worklist_max_iterations,
                1,
                100_000,
                "The cap is a termination safety net for the dataflow worklist",
            ));
        }
        if self.scc_max_rounds == 0 || self.scc_max_rounds > 100 {
            return Err(ConfigError::range(
                "scc_max_rounds",
                self.scc_max_rounds,
                1,
                100,
                "Recursion clusters iterate to a fixed point within this many rounds",
            ));
        }
        if self.max_paths == 0 || self.max_paths > 100_000 {
            return Err(ConfigError::range(
                "max_paths",
                self.max_paths,
                1,
                100_000,
                "Bounds memory for materialized paths",
            ));
        }
        Ok(())
    }
}
