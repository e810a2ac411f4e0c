//! Run configuration.
//!
//! A [`GrmConfig`] is fixed for the lifetime of a run. It is validated once,
//! before any tile is processed, so every later stage can rely on its values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

pub const DEFAULT_TILE_SIZE: u32 = 512;
pub const DEFAULT_ITERATIONS: u32 = 75;

// =============================================================================
// Criterion selection
// =============================================================================

/// Cost model used to score a candidate merge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
pub enum MergingCostCriterion {
    /// Euclidean distance between mean spectra.
    Spring,
    /// Weighted spectral and shape heterogeneity increase.
    #[serde(alias = "Baatz & Schape")]
    #[strum(to_string = "BaatzSchape", serialize = "Baatz & Schape")]
    BaatzSchape,
    /// Spectral distance scaled by the smaller perimeter.
    #[serde(alias = "Full Lambda Schedule")]
    #[strum(to_string = "FullLambdaSchedule", serialize = "Full Lambda Schedule")]
    FullLambdaSchedule,
}

/// Rule deciding which neighbor a region merges with.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum RegionMergingCriterion {
    /// Merge with the cheapest neighbor.
    #[serde(alias = "Best Fitting")]
    #[strum(to_string = "BestFitting", serialize = "Best Fitting")]
    BestFitting,
    /// Merge only when both regions are each other's cheapest neighbor.
    #[default]
    #[serde(alias = "Local Mutual Best Fitting")]
    #[strum(
        to_string = "LocalMutualBestFitting",
        serialize = "Local Mutual Best Fitting"
    )]
    LocalMutualBestFitting,
}

// =============================================================================
// Validation errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Please specify the total iterations for second segmentation")]
    ZeroIterations,

    #[error("Please specify a positive threshold, got {0}")]
    NonPositiveThreshold(f32),

    #[error("Please specify the spectral weight")]
    ZeroSpectralWeight,

    #[error("Please specify the shape weight")]
    ZeroShapeWeight,

    #[error("Weights must be finite and non-negative, got spectral {spectral}, shape {shape}")]
    InvalidWeights { spectral: f32, shape: f32 },

    #[error("Please select at least one band")]
    NoSourceBands,

    #[error("Tile size must be positive, got {width}x{height}")]
    ZeroTileSize { width: u32, height: u32 },

    #[error("Failed to read configuration '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yml::Error),
}

// =============================================================================
// Run configuration
// =============================================================================

/// Parameters of one segmentation run. YAML keys are camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrmConfig {
    pub merging_cost_criterion: MergingCostCriterion,
    #[serde(default)]
    pub region_merging_criterion: RegionMergingCriterion,
    /// Iteration budget of the run, split between first segmentation and
    /// the stitching passes.
    #[serde(default = "default_iterations")]
    pub total_iterations_for_second_segmentation: u32,
    /// Merges are accepted only when their cost is strictly below this value.
    pub threshold: f32,
    /// Baatz-Schape only.
    #[serde(default = "default_weight")]
    pub spectral_weight: f32,
    /// Baatz-Schape only.
    #[serde(default = "default_weight")]
    pub shape_weight: f32,
    pub source_band_names: Vec<String>,
    #[serde(default = "default_tile_size")]
    pub tile_width: u32,
    #[serde(default = "default_tile_size")]
    pub tile_height: u32,
    /// Directory for spilled tile graphs. A unique temp directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

fn default_weight() -> f32 {
    0.5
}

fn default_tile_size() -> u32 {
    DEFAULT_TILE_SIZE
}

impl GrmConfig {
    /// Minimal configuration for `criterion` over the given bands.
    pub fn new(
        merging_cost_criterion: MergingCostCriterion,
        threshold: f32,
        source_band_names: Vec<String>,
    ) -> Self {
        Self {
            merging_cost_criterion,
            region_merging_criterion: RegionMergingCriterion::default(),
            total_iterations_for_second_segmentation: DEFAULT_ITERATIONS,
            threshold,
            spectral_weight: default_weight(),
            shape_weight: default_weight(),
            source_band_names,
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            work_dir: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_iterations_for_second_segmentation == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(ConfigError::NonPositiveThreshold(self.threshold));
        }
        if self.merging_cost_criterion == MergingCostCriterion::BaatzSchape {
            if self.spectral_weight == 0.0 {
                return Err(ConfigError::ZeroSpectralWeight);
            }
            if self.shape_weight == 0.0 {
                return Err(ConfigError::ZeroShapeWeight);
            }
            let valid = |w: f32| w.is_finite() && w > 0.0;
            if !valid(self.spectral_weight) || !valid(self.shape_weight) {
                return Err(ConfigError::InvalidWeights {
                    spectral: self.spectral_weight,
                    shape: self.shape_weight,
                });
            }
        }
        if self.source_band_names.is_empty() {
            return Err(ConfigError::NoSourceBands);
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(ConfigError::ZeroTileSize {
                width: self.tile_width,
                height: self.tile_height,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn band_count(&self) -> usize {
        self.source_band_names.len()
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: GrmConfig = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yml::to_string(self)?)
    }
}
