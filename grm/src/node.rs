//! Region nodes and their incremental statistics.

use crate::criterion::MergeCriterion;
use crate::geometry::{Contour, PixelPos, Rect};
use crate::tiling::TileKey;

/// Per-band aggregates of a region.
///
/// Only `sum` and `square_sum` are carried forward by merges; `mean` and `std`
/// are derived from them and the area.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandStats {
    pub mean: f32,
    pub sum: f32,
    pub square_sum: f32,
    pub std: f32,
}

impl BandStats {
    #[inline]
    pub fn seed(value: f32) -> Self {
        Self {
            mean: value,
            sum: value,
            square_sum: value * value,
            std: 0.0,
        }
    }

    /// Statistics of the union of two disjoint regions covering `area` pixels.
    #[inline]
    pub fn merged(&self, other: &BandStats, area: u32) -> Self {
        let sum = self.sum + other.sum;
        let square_sum = self.square_sum + other.square_sum;
        Self::from_sums(sum, square_sum, area)
    }

    #[inline]
    pub fn from_sums(sum: f32, square_sum: f32, area: u32) -> Self {
        let area = area as f32;
        let mean = sum / area;
        let variance = (square_sum / area - mean * mean).max(0.0);
        Self {
            mean,
            sum,
            square_sum,
            std: variance.sqrt(),
        }
    }
}

/// A mergeable region.
///
/// Adjacency and the cached best candidate belong to the graph holding the
/// node, see [`RegionGraph`](crate::graph::RegionGraph).
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique within the graph instance holding the node.
    pub id: u32,
    /// First pixel in global raster order.
    pub anchor: PixelPos,
    /// Tile whose graph holds the node; the tile containing `anchor`.
    pub owner: TileKey,
    pub bbox: Rect,
    pub contour: Contour,
    pub perimeter: u32,
    pub area: u32,
    pub bands: Vec<BandStats>,
}

impl Node {
    /// One-pixel node at `(x, y)` with one sample per band.
    pub fn seed_pixel(id: u32, x: u32, y: u32, samples: &[f32], owner: TileKey) -> Self {
        Self {
            id,
            anchor: PixelPos::new(x, y),
            owner,
            bbox: Rect::pixel(x, y),
            contour: Contour::pixel(x, y),
            perimeter: 4,
            area: 1,
            bands: samples.iter().copied().map(BandStats::seed).collect(),
        }
    }

    #[inline]
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// The region covering both nodes, under a new `id`.
    ///
    /// Pure function of the two nodes' aggregates and geometry; the result does
    /// not depend on the operand order.
    pub fn merge_with(&self, other: &Node, id: u32) -> Node {
        debug_assert_eq!(self.bands.len(), other.bands.len());
        let area = self.area + other.area;
        let contour = self.contour.merge(&other.contour);
        let (first, _) = if self.anchor <= other.anchor {
            (self, other)
        } else {
            (other, self)
        };

        Node {
            id,
            anchor: first.anchor,
            owner: first.owner,
            bbox: self.bbox.union(&other.bbox),
            perimeter: contour.len() as u32,
            contour,
            area,
            bands: self
                .bands
                .iter()
                .zip(&other.bands)
                .map(|(a, b)| a.merged(b, area))
                .collect(),
        }
    }

    /// Perimeter of the union with an adjacent node sharing `boundary` cracks.
    #[inline]
    pub fn merged_perimeter(&self, other: &Node, boundary: u32) -> u32 {
        self.perimeter + other.perimeter - 2 * boundary
    }

    /// Cost of merging with an adjacent node sharing `boundary` cracks.
    #[inline]
    pub fn cost_to(&self, other: &Node, boundary: u32, criterion: &MergeCriterion) -> f32 {
        criterion.cost(self, other, boundary)
    }
}
