//! Error types for segmentation runs.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::geometry::Rect;

/// Errors that can occur during a segmentation run.
///
/// Everything except [`Error::Cancelled`] is fatal for the run: once one is
/// returned from a tile, later entry points report [`Error::Aborted`].
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to create work directory '{path}': {source}")]
    CreateWorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write region graph '{path}': {source}")]
    WriteGraph {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read region graph '{path}': {source}")]
    ReadGraph {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write label runs '{path}': {source}")]
    WriteLabels {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read label runs '{path}': {source}")]
    ReadLabels {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Band count mismatch: expected {expected}, found {found}")]
    BandCountMismatch { expected: usize, found: usize },

    #[error("Unknown source band '{0}'")]
    UnknownBand(String),

    #[error("Sample count mismatch: expected {expected}, found {found}")]
    SampleCount { expected: usize, found: usize },

    #[error("Partition violated in {scope}: expected {expected} pixels, found {found}")]
    Partition {
        scope: String,
        expected: u64,
        found: u64,
    },

    #[error("Inconsistent region graph: {0}")]
    Inconsistent(String),

    #[error("Image of {width}x{height} pixels has nothing to segment")]
    EmptyImage { width: u32, height: u32 },

    #[error("Tile rectangle {rect:?} does not match the tile layout")]
    TileMismatch { rect: Rect },

    #[error("Segmentation cancelled")]
    Cancelled,

    #[error("Segmentation run aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
