//! Intra-tile segmentation: seed one node per pixel of the tile region, run
//! the merge iterations the margin keeps exact and keep the regions anchored
//! in the interior.
//!
//! After `n` iterations a region depends only on pixels within
//! [`reach`](crate::tiling::reach) of its anchor. With a margin of at least that
//! reach, every region anchored in the interior comes out exactly as it would
//! from the whole image after `n` iterations. Regions anchored in the margin
//! belong to a neighboring tile, which computes them itself.

use tracing::debug;

use crate::criterion::MergeCriterion;
use crate::error::{Error, Result};
use crate::graph::RegionGraph;
use crate::node::Node;
use crate::segmenter::{CancelToken, SegmentationStats, Segmenter};
use crate::source::PixelTile;
use crate::tiling::ProcessingTile;

/// One node per pixel of `tile.region`, 4-adjacent pixels linked with length 1.
pub fn seed_graph(tile: &ProcessingTile, pixels: &PixelTile, band_count: usize) -> Result<RegionGraph> {
    if pixels.rect != tile.region {
        return Err(Error::TileMismatch { rect: pixels.rect });
    }
    if pixels.band_count() != band_count {
        return Err(Error::BandCountMismatch {
            expected: band_count,
            found: pixels.band_count(),
        });
    }

    let region = tile.region;
    let mut graph = RegionGraph::with_capacity(band_count, region.area() as usize);
    let mut samples = Vec::with_capacity(band_count);
    let mut row_above = Vec::with_capacity(region.width as usize);
    let mut row = Vec::with_capacity(region.width as usize);

    for y in region.y..region.bottom() {
        row.clear();
        for x in region.x..region.right() {
            pixels.samples_at(x, y, &mut samples);
            let id = graph.allocate_id();
            let idx = graph.push(Node::seed_pixel(id, x, y, &samples, tile.key))?;

            if let Some(&left) = row.last() {
                graph.connect(left, idx, 1);
            }
            if let Some(&up) = row_above.get(row.len()) {
                graph.connect(up, idx, 1);
            }
            row.push(idx);
        }
        std::mem::swap(&mut row, &mut row_above);
    }

    graph.check_partition(region.area(), format!("seeding of tile {}", tile.key))?;
    Ok(graph)
}

/// Runs up to `iterations` merge iterations over a seeded tile graph.
///
/// Margin nodes are ordinary neighbors and merge like any other node.
pub fn merge_tile(
    tile: &ProcessingTile,
    graph: &mut RegionGraph,
    criterion: &MergeCriterion,
    cancel: &CancelToken,
    iterations: u32,
) -> Result<SegmentationStats> {
    let stats = Segmenter::new(criterion, cancel, iterations).run(graph)?;
    graph.check_partition(tile.region.area(), format!("tile {}", tile.key))?;
    debug!(
        tile = %tile.key,
        seeds = tile.region.area(),
        nodes = graph.len(),
        merges = stats.merges,
        "First segmentation merged"
    );
    Ok(stats)
}

/// Regions anchored in the tile interior, in anchor order.
pub fn interior_nodes(tile: &ProcessingTile, graph: RegionGraph) -> Vec<Node> {
    let mut nodes = graph.into_nodes();
    nodes.retain(|node| tile.rect.contains(node.anchor.x, node.anchor.y));
    nodes
}

/// Seeds, merges and trims a tile.
pub fn segment_tile(
    tile: &ProcessingTile,
    pixels: &PixelTile,
    criterion: &MergeCriterion,
    cancel: &CancelToken,
    iterations: u32,
    band_count: usize,
) -> Result<(Vec<Node>, SegmentationStats)> {
    let mut graph = seed_graph(tile, pixels, band_count)?;
    let stats = merge_tile(tile, &mut graph, criterion, cancel, iterations)?;
    Ok((interior_nodes(tile, graph), stats))
}
