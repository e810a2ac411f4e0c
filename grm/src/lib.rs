//! GRM - tiled, out-of-core Generic Region Merging segmentation.
//!
//! An image is cut into tiles. Every tile is segmented together with a margin
//! wide enough for its interior regions to come out as they would from the
//! whole image, and spilled to disk. Stitching passes then advance all tiles
//! one merge iteration at a time until the partition no longer changes, so the
//! result does not depend on the tile size.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use grm::{GrmConfig, MergingCostCriterion, MultiBandImage};
//!
//! let image = MultiBandImage::from_f32(width, height, "red", samples)?;
//! let config = GrmConfig::new(MergingCostCriterion::Spring, 20.0, vec!["red".into()]);
//! let segmentation = grm::segment_image(config, &image, 4)?;
//!
//! println!("{} regions", segmentation.regions.len());
//! ```

pub mod assembler;
pub mod config;
pub mod criterion;
pub mod drive;
pub mod engine;
pub mod error;
pub mod first_segmentation;
pub mod geometry;
pub mod graph;
pub mod node;
pub mod persistence;
pub mod segmenter;
pub mod source;
pub mod stitcher;
pub mod tiling;

#[cfg(test)]
mod tests;

// ============================================================================
// Configuration & errors
// ============================================================================

pub use config::{ConfigError, GrmConfig, MergingCostCriterion, RegionMergingCriterion};
pub use error::{Error, Result};

// ============================================================================
// Running a segmentation
// ============================================================================

pub use assembler::{Finalized, RegionDescriptor};
pub use criterion::{CostModel, MergeCriterion, SelectionRule};
pub use drive::{segment_image, Segmentation};
pub use engine::RunContext;
pub use segmenter::CancelToken;
pub use tiling::{Registration, TileKey, TileLayout, TileState};

// ============================================================================
// Pixel input
// ============================================================================

pub use source::{BandSamples, MultiBandImage, PixelTile, SampleType, TileSource};

pub use geometry::Rect;
