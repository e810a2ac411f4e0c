//! Second segmentation: advancing the tiled graph one merge iteration per
//! pass until it converges or the iteration budget runs out.
//!
//! A pass runs one iteration for every tile. The window of a tile holds its
//! own regions and every region within [`hops`] adjacency steps of them,
//! loaded through the presence index. That is enough for one iteration over
//! the window to form the groups of the tile's regions exactly as an iteration
//! over the whole graph would. Regions anchored in the tile are staged, and
//! all tiles are committed together once every window has run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use common::parallel::{default_concurrency, try_par_for_each_limited};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::criterion::{MergeCriterion, SelectionRule};
use crate::error::{Error, Result};
use crate::geometry::{Crack, PixelPos};
use crate::graph::RegionGraph;
use crate::node::Node;
use crate::persistence::GraphStore;
use crate::segmenter::{CancelToken, Segmenter};
use crate::tiling::{TileKey, TileLayout, TileRegistry};

/// Everything a stitch reads from the run.
#[derive(Clone, Copy)]
pub struct StitchEnv<'a> {
    pub layout: &'a TileLayout,
    pub store: &'a GraphStore,
    pub registry: &'a TileRegistry,
    pub criterion: &'a MergeCriterion,
    pub cancel: &'a CancelToken,
    /// Iteration budget of the whole run, first segmentation included.
    pub iterations: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergeStats {
    pub passes: u32,
    pub merges: usize,
    /// Iterations behind the final graph, first segmentation included.
    pub iterations: u32,
    /// A pass merged nothing before the budget ran out.
    pub converged: bool,
}

/// Adjacency steps around a region that decide its group in one iteration.
pub fn hops(rule: SelectionRule) -> usize {
    match rule {
        SelectionRule::LocalMutualBestFitting => 2,
        SelectionRule::BestFitting => 4,
    }
}

/// For every tile, the tiles whose graphs own nodes reaching into it.
#[derive(Debug, Default)]
struct PresenceIndex {
    owners: HashMap<TileKey, BTreeSet<TileKey>>,
}

impl PresenceIndex {
    fn record(&mut self, owner: TileKey, tiles: &BTreeSet<TileKey>) {
        for (tile, owners) in self.owners.iter_mut() {
            if !tiles.contains(tile) {
                owners.remove(&owner);
            }
        }
        for tile in tiles {
            self.owners.entry(*tile).or_default().insert(owner);
        }
    }

    fn owners(&self, tile: TileKey) -> BTreeSet<TileKey> {
        self.owners.get(&tile).cloned().unwrap_or_default()
    }
}

/// Tiles overlapped by the bounding box of any node.
pub fn tiles_of_nodes(layout: &TileLayout, nodes: &[Node]) -> BTreeSet<TileKey> {
    nodes
        .iter()
        .flat_map(|node| layout.tiles_overlapping(&node.bbox))
        .collect()
}

/// Regions loaded around one tile, keyed by anchor.
struct Window<'a> {
    env: &'a StitchEnv<'a>,
    index: &'a PresenceIndex,
    loaded: BTreeSet<TileKey>,
    nodes: BTreeMap<PixelPos, Node>,
    sides: HashMap<Crack, Vec<PixelPos>>,
}

impl<'a> Window<'a> {
    fn new(env: &'a StitchEnv<'a>, index: &'a PresenceIndex) -> Self {
        Self {
            env,
            index,
            loaded: BTreeSet::new(),
            nodes: BTreeMap::new(),
            sides: HashMap::new(),
        }
    }

    fn load(&mut self, key: TileKey) -> Result<()> {
        if !self.loaded.insert(key) {
            return Ok(());
        }
        for node in self.env.store.load(key)? {
            for crack in node.contour.cracks() {
                self.sides.entry(*crack).or_default().push(node.anchor);
            }
            self.nodes.insert(node.anchor, node);
        }
        Ok(())
    }

    /// Loads every graph owning a node that may share a crack with `anchor`.
    fn load_around(&mut self, anchor: PixelPos) -> Result<()> {
        let Some(node) = self.nodes.get(&anchor) else {
            return Ok(());
        };
        let around = node.bbox.expand_within(1, &self.env.layout.image());
        let owners: BTreeSet<TileKey> = self
            .env
            .layout
            .tiles_overlapping(&around)
            .into_iter()
            .flat_map(|tile| self.index.owners(tile))
            .collect();
        for owner in owners {
            self.load(owner)?;
        }
        Ok(())
    }

    fn neighbors(&self, anchor: PixelPos) -> BTreeSet<PixelPos> {
        let Some(node) = self.nodes.get(&anchor) else {
            return BTreeSet::new();
        };
        node.contour
            .cracks()
            .iter()
            .filter_map(|crack| self.sides.get(crack))
            .flatten()
            .copied()
            .filter(|other| *other != anchor)
            .collect()
    }

    /// Nodes within `hops` steps of the nodes of `key`, in anchor order, and
    /// how many of them `key` owns.
    fn collect(mut self, key: TileKey, hops: usize) -> Result<(usize, Vec<Node>)> {
        self.load(key)?;
        let mut frontier: Vec<PixelPos> = self.nodes.keys().copied().collect();
        let own = frontier.len();
        let mut members: BTreeSet<PixelPos> = frontier.iter().copied().collect();

        for _ in 0..hops {
            let mut next = Vec::new();
            for anchor in &frontier {
                self.load_around(*anchor)?;
                for neighbor in self.neighbors(*anchor) {
                    if members.insert(neighbor) {
                        next.push(neighbor);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        let nodes = members
            .iter()
            .filter_map(|anchor| self.nodes.remove(anchor))
            .collect();
        Ok((own, nodes))
    }
}

/// Owns the presence index and runs the stitching passes.
#[derive(Debug, Default)]
pub struct Stitcher {
    index: Mutex<PresenceIndex>,
}

impl Stitcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the index after the graph of `owner` was persisted.
    pub fn record(&self, owner: TileKey, tiles: &BTreeSet<TileKey>) {
        self.index.lock().record(owner, tiles);
    }

    /// Tiles currently indexed as owning nodes that reach into `tile`.
    pub fn owners(&self, tile: TileKey) -> BTreeSet<TileKey> {
        self.index.lock().owners(tile)
    }

    /// Runs passes from the first-segmentation iteration count until a pass
    /// merges nothing or the budget is spent.
    ///
    /// Every tile must already be persisted.
    pub fn converge(&self, env: &StitchEnv<'_>) -> Result<ConvergeStats> {
        if !env.registry.all_persisted() {
            return Err(Error::Inconsistent(
                "stitching started before every tile was persisted".to_string(),
            ));
        }

        let mut stats = ConvergeStats {
            iterations: env.layout.first_pass_iterations(),
            ..ConvergeStats::default()
        };
        while stats.iterations < env.iterations {
            env.cancel.check()?;
            let merges = self.pass(env)?;
            stats.passes += 1;
            stats.iterations += 1;
            stats.merges += merges;
            info!(pass = stats.passes, iteration = stats.iterations, merges, "Stitching pass finished");
            if merges == 0 {
                stats.converged = true;
                break;
            }
        }
        Ok(stats)
    }

    /// Advances every tile by one iteration and returns the number of merges.
    fn pass(&self, env: &StitchEnv<'_>) -> Result<usize> {
        let mut index = self.index.lock();
        let keys: Vec<TileKey> = env.layout.keys().collect();
        let before = AtomicUsize::new(0);
        let after = AtomicUsize::new(0);
        let next = Mutex::new(PresenceIndex::default());

        let current: &PresenceIndex = &index;
        try_par_for_each_limited(&keys, default_concurrency(), |key| {
            env.cancel.check()?;
            let (own, nodes) = stitch_tile(env, current, *key)?;
            env.store.save_staged(*key, &nodes)?;
            next.lock().record(*key, &tiles_of_nodes(env.layout, &nodes));
            before.fetch_add(own, Ordering::Relaxed);
            after.fetch_add(nodes.len(), Ordering::Relaxed);
            Ok::<(), Error>(())
        })?;

        for key in &keys {
            env.store.commit_staged(*key)?;
        }
        *index = next.into_inner();
        Ok(before.into_inner().saturating_sub(after.into_inner()))
    }
}

/// One iteration over the window of `key`; returns how many regions the tile
/// owned before and the regions anchored in it after.
fn stitch_tile(env: &StitchEnv<'_>, index: &PresenceIndex, key: TileKey) -> Result<(usize, Vec<Node>)> {
    let (own, mut nodes) = Window::new(env, index).collect(key, hops(env.criterion.rule))?;
    for (id, node) in nodes.iter_mut().enumerate() {
        node.id = id as u32;
    }
    let window = nodes.len();

    let mut graph = RegionGraph::from_nodes(env.store.band_count(), nodes)?;
    let area = graph.total_area();
    Segmenter::new(env.criterion, env.cancel, 1).run(&mut graph)?;
    graph.check_partition(area, format!("window of tile {key}"))?;

    let rect = env.layout.tile_rect(key);
    let mut kept = graph.into_nodes();
    kept.retain(|node| rect.contains(node.anchor.x, node.anchor.y));
    for node in &mut kept {
        node.owner = key;
    }

    debug!(tile = %key, window, before = own, after = kept.len(), "Stitched tile");
    Ok((own, kept))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::criterion::CostModel;
    use crate::first_segmentation::segment_tile;
    use crate::geometry::Rect;
    use crate::source::{MultiBandImage, TileSource};
    use crate::tiling::ProcessingTile;

    struct Fixture {
        layout: TileLayout,
        store: GraphStore,
        registry: TileRegistry,
        criterion: MergeCriterion,
        cancel: CancelToken,
        stitcher: Stitcher,
        iterations: u32,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(layout: TileLayout, criterion: MergeCriterion) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                store: GraphStore::create(Some(dir.path()), 1).unwrap(),
                registry: TileRegistry::new(layout.clone()),
                layout,
                criterion,
                cancel: CancelToken::new(),
                stitcher: Stitcher::new(),
                iterations: 50,
                _dir: dir,
            }
        }

        fn env(&self) -> StitchEnv<'_> {
            StitchEnv {
                layout: &self.layout,
                store: &self.store,
                registry: &self.registry,
                criterion: &self.criterion,
                cancel: &self.cancel,
                iterations: self.iterations,
            }
        }

        fn first_segmentation(&self, image: &MultiBandImage, key: TileKey) {
            let tile = ProcessingTile {
                key,
                rect: self.layout.tile_rect(key),
                margin: self.layout.margin(),
                region: self.layout.region_rect(key),
                path: self.store.graph_path(key),
            };
            self.registry.register(tile.clone());
            let pixels = image.read(tile.region, &["v".to_string()]).unwrap();
            let iterations = self.layout.first_pass_iterations();
            let (nodes, _) = segment_tile(&tile, &pixels, &self.criterion, &self.cancel, iterations, 1).unwrap();
            self.store.save(key, &nodes).unwrap();
            self.stitcher.record(key, &tiles_of_nodes(&self.layout, &nodes));
            self.registry.mark_persisted(key);
        }

        fn segment_all(&self, image: &MultiBandImage) {
            for key in self.layout.keys().collect::<Vec<_>>() {
                self.first_segmentation(image, key);
            }
        }

        fn authoritative(&self) -> Vec<Node> {
            let mut nodes: Vec<Node> = self
                .layout
                .keys()
                .flat_map(|key| self.store.load(key).unwrap())
                .collect();
            nodes.sort_by_key(|node| node.anchor);
            nodes
        }
    }

    fn two_blocks() -> MultiBandImage {
        let mut values = vec![10.0; 8];
        values.extend([90.0; 8]);
        MultiBandImage::from_f32(4, 4, "v", values).unwrap()
    }

    /// Regions after `iterations` iterations over the whole image at once.
    fn whole_image(image: &MultiBandImage, criterion: &MergeCriterion, iterations: u32) -> Vec<Node> {
        let pixels = image.read(image.rect(), &["v".to_string()]).unwrap();
        let mut nodes = Vec::new();
        let mut samples = Vec::new();
        for y in 0..image.height() {
            for x in 0..image.width() {
                pixels.samples_at(x, y, &mut samples);
                nodes.push(Node::seed_pixel(nodes.len() as u32, x, y, &samples, TileKey::new(0, 0)));
            }
        }
        let mut graph = RegionGraph::from_nodes(1, nodes).unwrap();
        Segmenter::new(criterion, &CancelToken::new(), iterations)
            .run(&mut graph)
            .unwrap();
        graph.into_nodes()
    }

    fn summary(nodes: &[Node]) -> Vec<(PixelPos, u32, u32, Rect, u32)> {
        nodes
            .iter()
            .map(|node| (node.anchor, node.area, node.perimeter, node.bbox, node.bands[0].sum.to_bits()))
            .collect()
    }

    #[test]
    fn stitching_joins_blocks_split_by_a_vertical_border() {
        let criterion = MergeCriterion::new(CostModel::Spring, SelectionRule::BestFitting, 50.0);
        let fixture = Fixture::new(TileLayout::new(4, 4, 2, 4, 0), criterion);
        fixture.segment_all(&two_blocks());

        let stats = fixture.stitcher.converge(&fixture.env()).unwrap();
        assert_eq!(stats.merges, 14);
        assert!(stats.passes >= 2);
        assert!(stats.converged);

        let regions: Vec<_> = fixture
            .authoritative()
            .iter()
            .map(|node| (node.bbox, node.area, node.owner))
            .collect();
        assert_eq!(
            regions,
            vec![
                (Rect::new(0, 0, 4, 2), 8, TileKey::new(0, 0)),
                (Rect::new(0, 2, 4, 2), 8, TileKey::new(0, 0)),
            ]
        );
        assert!(fixture.store.load(TileKey::new(0, 1)).unwrap().is_empty());
    }

    #[test]
    fn stitching_waits_for_every_tile() {
        let criterion = MergeCriterion::new(CostModel::Spring, SelectionRule::BestFitting, 50.0);
        let fixture = Fixture::new(TileLayout::new(4, 4, 2, 4, 0), criterion);
        fixture.first_segmentation(&two_blocks(), TileKey::new(0, 0));

        let result = fixture.stitcher.converge(&fixture.env());
        assert!(matches!(result, Err(Error::Inconsistent(_))));
    }

    #[test]
    fn index_follows_nodes_across_tiles() {
        let criterion = MergeCriterion::new(CostModel::Spring, SelectionRule::BestFitting, 50.0);
        let fixture = Fixture::new(TileLayout::new(4, 4, 2, 4, 0), criterion);
        fixture.segment_all(&two_blocks());

        let (left, right) = (TileKey::new(0, 0), TileKey::new(0, 1));
        assert_eq!(fixture.stitcher.owners(left), BTreeSet::from([left]));
        assert_eq!(fixture.stitcher.owners(right), BTreeSet::from([right]));

        fixture.stitcher.converge(&fixture.env()).unwrap();
        assert_eq!(fixture.stitcher.owners(left), BTreeSet::from([left]));
        assert_eq!(fixture.stitcher.owners(right), BTreeSet::from([left]));
    }

    #[test]
    fn different_values_stay_apart() {
        let criterion = MergeCriterion::new(CostModel::Spring, SelectionRule::LocalMutualBestFitting, 5.0);
        let fixture = Fixture::new(TileLayout::new(4, 2, 2, 2, 0), criterion);
        let image = MultiBandImage::from_f32(4, 2, "v", vec![1.0, 1.0, 20.0, 20.0, 1.0, 1.0, 20.0, 20.0]).unwrap();
        fixture.segment_all(&image);

        let stats = fixture.stitcher.converge(&fixture.env()).unwrap();
        assert_eq!(stats.merges, 6);
        assert!(stats.converged);
        let regions: Vec<_> = fixture
            .authoritative()
            .iter()
            .map(|node| (node.bbox, node.owner))
            .collect();
        assert_eq!(
            regions,
            vec![
                (Rect::new(0, 0, 2, 2), TileKey::new(0, 0)),
                (Rect::new(2, 0, 2, 2), TileKey::new(0, 1)),
            ]
        );
    }

    #[test]
    fn budget_spent_by_first_segmentation_skips_stitching() {
        let criterion = MergeCriterion::new(CostModel::Spring, SelectionRule::BestFitting, 50.0);
        let layout = TileLayout::new(4, 4, 2, 4, 4).with_first_pass_iterations(1);
        let mut fixture = Fixture::new(layout, criterion);
        fixture.iterations = 1;
        fixture.segment_all(&two_blocks());
        let before = fixture.authoritative();

        let stats = fixture.stitcher.converge(&fixture.env()).unwrap();
        assert_eq!(stats.passes, 0);
        assert_eq!(stats.iterations, 1);
        assert!(!stats.converged);
        assert_eq!(fixture.authoritative(), before);
    }

    #[test]
    fn passes_match_whole_image_iterations() {
        let mut rng = StdRng::seed_from_u64(11);
        let values: Vec<f32> = (0..12 * 10).map(|_| rng.random_range(0..30) as f32).collect();
        let image = MultiBandImage::from_f32(12, 10, "v", values).unwrap();
        let models = [
            (CostModel::Spring, 6.0),
            (
                CostModel::BaatzSchape {
                    spectral_weight: 0.5,
                    shape_weight: 0.5,
                },
                8.0,
            ),
        ];

        for (model, threshold) in models {
            for rule in [SelectionRule::BestFitting, SelectionRule::LocalMutualBestFitting] {
                let criterion = MergeCriterion::new(model, rule, threshold);
                for iterations in [1, 3] {
                    let mut fixture = Fixture::new(TileLayout::new(12, 10, 4, 4, 0), criterion);
                    fixture.iterations = iterations;
                    fixture.segment_all(&image);
                    let stats = fixture.stitcher.converge(&fixture.env()).unwrap();
                    assert!(stats.merges > 0);

                    let expected = whole_image(&image, &criterion, iterations);
                    assert_eq!(
                        summary(&fixture.authoritative()),
                        summary(&expected),
                        "{model:?} {rule:?} after {iterations} iterations"
                    );
                }
            }
        }
    }

    #[test]
    fn cancelled_stitch_returns_cancelled() {
        let criterion = MergeCriterion::new(CostModel::Spring, SelectionRule::BestFitting, 50.0);
        let fixture = Fixture::new(TileLayout::new(4, 4, 2, 4, 0), criterion);
        fixture.segment_all(&two_blocks());
        fixture.cancel.cancel();

        assert!(matches!(
            fixture.stitcher.converge(&fixture.env()),
            Err(Error::Cancelled)
        ));
    }
}
