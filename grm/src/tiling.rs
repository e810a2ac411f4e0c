//! Tile layout, margins and the registry of tiles in flight.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::GrmConfig;
use crate::criterion::SelectionRule;
use crate::error::{Error, Result};
use crate::geometry::{PixelPos, Rect};

/// Row/column of a tile in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TileKey {
    pub row: u32,
    pub col: u32,
}

impl TileKey {
    #[inline]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Pixel distance within which the input determines a region after
/// `iterations` merge iterations.
///
/// An iteration merges groups of at most two nodes under local mutual best
/// fitting, and a pair plus the nodes picking either side under best fitting,
/// so the extent of a region grows by a factor of 2 or 4 per iteration. The
/// groups an iteration forms around a node are decided by nodes at most 2 (mutual)
/// or 4 (best fitting) adjacency steps away.
pub fn reach(rule: SelectionRule, iterations: u32) -> u64 {
    let (growth, hops) = match rule {
        SelectionRule::LocalMutualBestFitting => (2u64, 2u64),
        SelectionRule::BestFitting => (4, 4),
    };
    let mut extent = 0u64;
    let mut reach = 0u64;
    for _ in 0..iterations {
        let step = hops.saturating_mul(extent.saturating_add(1)).saturating_add(extent);
        reach = reach.saturating_add(step);
        extent = growth.saturating_mul(extent).saturating_add(growth - 1);
        if reach == u64::MAX {
            break;
        }
    }
    reach
}

/// Largest number of iterations, at most `budget`, whose [`reach`] fits in `margin`.
pub fn exact_iterations(rule: SelectionRule, margin: u32, budget: u32) -> u32 {
    let mut iterations = 0;
    while iterations < budget && reach(rule, iterations + 1) <= margin as u64 {
        iterations += 1;
    }
    iterations
}

/// Margin of a tile in a multi-tile layout.
///
/// Covers the reach of as many first-segmentation iterations as a margin of
/// half the smaller tile side allows, within the iteration budget.
pub fn compute_tile_margin(iterations: u32, rule: SelectionRule, tile_width: u32, tile_height: u32) -> u32 {
    let cap = tile_width.min(tile_height) / 2;
    reach(rule, exact_iterations(rule, cap, iterations)) as u32
}

// =============================================================================
// Layout
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    image: Rect,
    tile_width: u32,
    tile_height: u32,
    margin: u32,
    /// Merge iterations of first segmentation.
    first_pass_iterations: u32,
    tiles_x: u32,
    tiles_y: u32,
}

impl TileLayout {
    pub fn new(width: u32, height: u32, tile_width: u32, tile_height: u32, margin: u32) -> Self {
        assert!(tile_width > 0 && tile_height > 0, "tile size must be positive");
        Self {
            image: Rect::new(0, 0, width, height),
            tile_width,
            tile_height,
            margin,
            first_pass_iterations: 0,
            tiles_x: width.div_ceil(tile_width),
            tiles_y: height.div_ceil(tile_height),
        }
    }

    /// A single tile runs the whole iteration budget without a margin; every
    /// other layout runs the iterations its margin keeps exact.
    pub fn from_config(width: u32, height: u32, config: &GrmConfig) -> Self {
        let rule = SelectionRule::from(config.region_merging_criterion);
        let budget = config.total_iterations_for_second_segmentation;
        let (tile_width, tile_height) = (config.tile_width, config.tile_height);

        if width <= tile_width && height <= tile_height {
            return Self::new(width, height, tile_width, tile_height, 0).with_first_pass_iterations(budget);
        }
        let margin = compute_tile_margin(budget, rule, tile_width, tile_height);
        Self::new(width, height, tile_width, tile_height, margin)
            .with_first_pass_iterations(exact_iterations(rule, margin, budget))
    }

    pub fn with_first_pass_iterations(mut self, iterations: u32) -> Self {
        self.first_pass_iterations = iterations;
        self
    }

    #[inline]
    pub fn first_pass_iterations(&self) -> u32 {
        self.first_pass_iterations
    }

    #[inline]
    pub fn image(&self) -> Rect {
        self.image
    }

    #[inline]
    pub fn tiles_x(&self) -> u32 {
        self.tiles_x
    }

    #[inline]
    pub fn tiles_y(&self) -> u32 {
        self.tiles_y
    }

    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tiles_x as usize * self.tiles_y as usize
    }

    #[inline]
    pub fn margin(&self) -> u32 {
        self.margin
    }

    #[inline]
    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    #[inline]
    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    /// All keys in row-major order.
    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        (0..self.tiles_y).flat_map(move |row| (0..self.tiles_x).map(move |col| TileKey::new(row, col)))
    }

    #[inline]
    pub fn contains_key(&self, key: TileKey) -> bool {
        key.row < self.tiles_y && key.col < self.tiles_x
    }

    /// Row-major position of `key`.
    #[inline]
    pub fn index_of(&self, key: TileKey) -> usize {
        key.row as usize * self.tiles_x as usize + key.col as usize
    }

    /// Interior rectangle of a tile, clipped to the image.
    pub fn tile_rect(&self, key: TileKey) -> Rect {
        debug_assert!(self.contains_key(key));
        let x = key.col * self.tile_width;
        let y = key.row * self.tile_height;
        Rect::new(
            x,
            y,
            self.tile_width.min(self.image.width - x),
            self.tile_height.min(self.image.height - y),
        )
    }

    /// Interior rectangle expanded by the margin, clipped to the image.
    pub fn region_rect(&self, key: TileKey) -> Rect {
        self.tile_rect(key).expand_within(self.margin, &self.image)
    }

    /// Key of the tile whose interior is exactly `rect`.
    pub fn key_for_rect(&self, rect: Rect) -> Result<TileKey> {
        let aligned = rect.x % self.tile_width == 0 && rect.y % self.tile_height == 0;
        let key = TileKey::new(rect.y / self.tile_height, rect.x / self.tile_width);
        if aligned && self.contains_key(key) && self.tile_rect(key) == rect {
            Ok(key)
        } else {
            Err(Error::TileMismatch { rect })
        }
    }

    #[inline]
    pub fn tile_of_pixel(&self, pos: PixelPos) -> TileKey {
        TileKey::new(pos.y / self.tile_height, pos.x / self.tile_width)
    }

    /// Tiles whose interior intersects `bbox`.
    pub fn tiles_overlapping(&self, bbox: &Rect) -> Vec<TileKey> {
        let Some(bbox) = self.image.intersection(bbox) else {
            return Vec::new();
        };
        let rows = bbox.y / self.tile_height..=(bbox.bottom() - 1) / self.tile_height;
        let cols = bbox.x / self.tile_width..=(bbox.right() - 1) / self.tile_width;
        rows.flat_map(|row| cols.clone().map(move |col| TileKey::new(row, col)))
            .collect()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// A tile registered for first segmentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingTile {
    pub key: TileKey,
    /// Interior rectangle; the pixels this tile is authoritative for.
    pub rect: Rect,
    pub margin: u32,
    /// Interior expanded by the margin, clipped to the image.
    pub region: Rect,
    /// Persisted graph of the tile.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Registered,
    Seeded,
    Merging,
    Converged,
    Persisted,
}

/// Outcome of registering a tile. Duplicate requests are expected and not an error.
#[derive(Debug, Clone)]
pub enum Registration {
    New(Arc<ProcessingTile>),
    Existing(Arc<ProcessingTile>),
}

impl Registration {
    pub fn tile(&self) -> &Arc<ProcessingTile> {
        match self {
            Registration::New(tile) | Registration::Existing(tile) => tile,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::New(_))
    }
}

/// Result of marking a tile persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub persisted: usize,
    pub total: usize,
}

impl Completion {
    #[inline]
    pub fn is_last(&self) -> bool {
        self.persisted == self.total
    }
}

#[derive(Debug)]
struct Cell {
    tile: Arc<ProcessingTile>,
    state: TileState,
}

/// Row x column array of registered tiles and their states.
#[derive(Debug)]
pub struct TileGrid {
    layout: TileLayout,
    cells: Vec<Option<Cell>>,
    persisted: usize,
}

impl TileGrid {
    pub fn new(layout: TileLayout) -> Self {
        let cells = (0..layout.tile_count()).map(|_| None).collect();
        Self {
            layout,
            cells,
            persisted: 0,
        }
    }

    pub fn register(&mut self, tile: ProcessingTile) -> Registration {
        let index = self.layout.index_of(tile.key);
        match &self.cells[index] {
            Some(cell) => Registration::Existing(Arc::clone(&cell.tile)),
            None => {
                let tile = Arc::new(tile);
                self.cells[index] = Some(Cell {
                    tile: Arc::clone(&tile),
                    state: TileState::Registered,
                });
                Registration::New(tile)
            }
        }
    }

    pub fn get(&self, key: TileKey) -> Option<&Arc<ProcessingTile>> {
        self.cell(key).map(|cell| &cell.tile)
    }

    pub fn state(&self, key: TileKey) -> Option<TileState> {
        self.cell(key).map(|cell| cell.state)
    }

    pub fn set_state(&mut self, key: TileKey, state: TileState) {
        let index = self.layout.index_of(key);
        if let Some(cell) = self.cells[index].as_mut() {
            cell.state = state;
        }
    }

    #[inline]
    pub fn is_persisted(&self, key: TileKey) -> bool {
        self.state(key) == Some(TileState::Persisted)
    }

    pub fn persisted_count(&self) -> usize {
        self.persisted
    }

    pub fn all_persisted(&self) -> bool {
        self.persisted == self.cells.len()
    }

    pub fn mark_persisted(&mut self, key: TileKey) -> Completion {
        if !self.is_persisted(key) {
            self.set_state(key, TileState::Persisted);
            self.persisted += 1;
        }
        Completion {
            persisted: self.persisted,
            total: self.cells.len(),
        }
    }

    fn cell(&self, key: TileKey) -> Option<&Cell> {
        if !self.layout.contains_key(key) {
            return None;
        }
        self.cells[self.layout.index_of(key)].as_ref()
    }
}

/// Shared registry; registration and completion counting share one lock.
#[derive(Debug)]
pub struct TileRegistry {
    grid: Mutex<TileGrid>,
}

impl TileRegistry {
    pub fn new(layout: TileLayout) -> Self {
        Self {
            grid: Mutex::new(TileGrid::new(layout)),
        }
    }

    /// First registrant wins; later callers receive the stored tile.
    pub fn register(&self, tile: ProcessingTile) -> Registration {
        let key = tile.key;
        let registration = self.grid.lock().register(tile);
        if !registration.is_new() {
            warn!(tile = %key, "Tile already registered, skipping");
        }
        registration
    }

    pub fn set_state(&self, key: TileKey, state: TileState) {
        self.grid.lock().set_state(key, state);
    }

    pub fn state(&self, key: TileKey) -> Option<TileState> {
        self.grid.lock().state(key)
    }

    pub fn is_persisted(&self, key: TileKey) -> bool {
        self.grid.lock().is_persisted(key)
    }

    pub fn all_persisted(&self) -> bool {
        self.grid.lock().all_persisted()
    }

    pub fn mark_persisted(&self, key: TileKey) -> Completion {
        self.grid.lock().mark_persisted(key)
    }

    pub fn get(&self, key: TileKey) -> Option<Arc<ProcessingTile>> {
        self.grid.lock().get(key).cloned()
    }
}
