//! The per-run context every entry point goes through.
//!
//! A host calls [`RunContext::compute_tile`] for every tile rectangle, from any
//! number of threads and in any order. The call that persists the last tile
//! runs the stitching passes and finalizes the labels; readers
//! blocked in [`RunContext::labels`] are woken when that happens, or when the
//! run fails or is cancelled.

use std::path::Path;
use std::sync::Arc;

use common::Buffer2;
use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use crate::assembler::{self, Finalized, RegionDescriptor};
use crate::config::GrmConfig;
use crate::criterion::MergeCriterion;
use crate::error::{Error, Result};
use crate::first_segmentation::{interior_nodes, merge_tile, seed_graph};
use crate::geometry::Rect;
use crate::persistence::GraphStore;
use crate::segmenter::CancelToken;
use crate::source::TileSource;
use crate::stitcher::{tiles_of_nodes, StitchEnv, Stitcher};
use crate::tiling::{ProcessingTile, Registration, TileKey, TileLayout, TileRegistry, TileState};

#[derive(Debug, Clone)]
enum RunState {
    Running,
    Finalized(Arc<Finalized>),
    Failed(String),
    Cancelled,
}

pub struct RunContext {
    config: GrmConfig,
    criterion: MergeCriterion,
    layout: TileLayout,
    registry: TileRegistry,
    store: GraphStore,
    stitcher: Stitcher,
    cancel: CancelToken,
    state: Mutex<RunState>,
    state_changed: Condvar,
    finalize_lock: Mutex<()>,
}

impl RunContext {
    /// Validates `config` and prepares the working directory for an image of
    /// `width` x `height` pixels.
    pub fn new(config: GrmConfig, width: u32, height: u32) -> Result<Self> {
        let criterion = MergeCriterion::from_config(&config)?;
        if width == 0 || height == 0 {
            return Err(Error::EmptyImage { width, height });
        }
        let layout = TileLayout::from_config(width, height, &config);
        let store = GraphStore::create(config.work_dir.as_deref(), config.band_count())?;

        info!(
            width,
            height,
            tiles_x = layout.tiles_x(),
            tiles_y = layout.tiles_y(),
            margin = layout.margin(),
            first_pass_iterations = layout.first_pass_iterations(),
            criterion = %config.merging_cost_criterion,
            rule = %config.region_merging_criterion,
            threshold = config.threshold,
            work_dir = %store.dir().display(),
            "Segmentation run created"
        );

        Ok(Self {
            registry: TileRegistry::new(layout.clone()),
            config,
            criterion,
            layout,
            store,
            stitcher: Stitcher::new(),
            cancel: CancelToken::new(),
            state: Mutex::new(RunState::Running),
            state_changed: Condvar::new(),
            finalize_lock: Mutex::new(()),
        })
    }

    #[inline]
    pub fn config(&self) -> &GrmConfig {
        &self.config
    }

    #[inline]
    pub fn criterion(&self) -> &MergeCriterion {
        &self.criterion
    }

    #[inline]
    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    pub fn work_dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn tile_state(&self, key: TileKey) -> Option<TileState> {
        self.registry.state(key)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Segments the tile whose interior is `rect`.
    ///
    /// A tile already requested returns [`Registration::Existing`] without
    /// doing any work. Any error except a rejected rectangle aborts the run.
    pub fn compute_tile(&self, rect: Rect, source: &dyn TileSource) -> Result<Registration> {
        self.ensure_running()?;
        let key = self.layout.key_for_rect(rect)?;
        let registration = self.registry.register(self.processing_tile(key));
        if !registration.is_new() {
            return Ok(registration);
        }

        match self.segment(registration.tile(), source) {
            Ok(()) => Ok(registration),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Runs the stitching passes and writes the labels.
    ///
    /// Runs on the worker persisting the last tile; calling it again returns
    /// the stored result.
    pub fn finalize(&self) -> Result<Arc<Finalized>> {
        let _guard = self.finalize_lock.lock();
        match &*self.state.lock() {
            RunState::Running => {}
            RunState::Finalized(finalized) => return Ok(Arc::clone(finalized)),
            RunState::Failed(reason) => return Err(Error::Aborted(reason.clone())),
            RunState::Cancelled => return Err(Error::Cancelled),
        }
        if !self.registry.all_persisted() {
            return Err(Error::Inconsistent(
                "finalization requested before every tile was persisted".to_string(),
            ));
        }

        let result = self
            .stitcher
            .converge(&self.stitch_env())
            .and_then(|stats| {
                info!(
                    passes = stats.passes,
                    merges = stats.merges,
                    iterations = stats.iterations,
                    converged = stats.converged,
                    "Stitching finished"
                );
                assembler::finalize(&self.layout, &self.store)
            });
        match result {
            Ok(finalized) => {
                let finalized = Arc::new(finalized);
                *self.state.lock() = RunState::Finalized(Arc::clone(&finalized));
                self.state_changed.notify_all();
                Ok(finalized)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Label raster of `rect`, blocking until the run is finalized.
    pub fn labels(&self, rect: Rect) -> Result<Buffer2<i32>> {
        self.wait_finalized()?.labels(rect)
    }

    /// Label raster of `rect`, or `None` while the run is still in progress.
    pub fn try_labels(&self, rect: Rect) -> Result<Option<Buffer2<i32>>> {
        let finalized = match &*self.state.lock() {
            RunState::Running => return Ok(None),
            RunState::Finalized(finalized) => Arc::clone(finalized),
            RunState::Failed(reason) => return Err(Error::Aborted(reason.clone())),
            RunState::Cancelled => return Err(Error::Cancelled),
        };
        finalized.labels(rect).map(Some)
    }

    /// Region descriptors, blocking until the run is finalized.
    pub fn regions(&self) -> Result<Vec<RegionDescriptor>> {
        Ok(self.wait_finalized()?.regions().to_vec())
    }

    pub fn is_finalized(&self) -> bool {
        matches!(*self.state.lock(), RunState::Finalized(_))
    }

    /// Stops merge loops at their next step and wakes blocked readers.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock();
        if matches!(*state, RunState::Running) {
            *state = RunState::Cancelled;
            info!("Segmentation run cancelled");
        }
        drop(state);
        self.state_changed.notify_all();
    }

    fn processing_tile(&self, key: TileKey) -> ProcessingTile {
        ProcessingTile {
            key,
            rect: self.layout.tile_rect(key),
            margin: self.layout.margin(),
            region: self.layout.region_rect(key),
            path: self.store.graph_path(key),
        }
    }

    fn stitch_env(&self) -> StitchEnv<'_> {
        StitchEnv {
            layout: &self.layout,
            store: &self.store,
            registry: &self.registry,
            criterion: &self.criterion,
            cancel: &self.cancel,
            iterations: self.config.total_iterations_for_second_segmentation,
        }
    }

    fn segment(&self, tile: &ProcessingTile, source: &dyn TileSource) -> Result<()> {
        let key = tile.key;
        info!(tile = %key, region = ?tile.region, "First segmentation started");

        let pixels = source.read(tile.region, &self.config.source_band_names)?;
        let mut graph = seed_graph(tile, &pixels, self.config.band_count())?;
        drop(pixels);
        self.registry.set_state(key, TileState::Seeded);

        self.registry.set_state(key, TileState::Merging);
        let stats = merge_tile(
            tile,
            &mut graph,
            &self.criterion,
            &self.cancel,
            self.layout.first_pass_iterations(),
        )?;
        self.registry.set_state(key, TileState::Converged);

        let nodes = interior_nodes(tile, graph);
        self.store.save(key, &nodes)?;
        self.stitcher.record(key, &tiles_of_nodes(&self.layout, &nodes));
        let completion = self.registry.mark_persisted(key);
        info!(
            tile = %key,
            nodes = nodes.len(),
            iterations = stats.iterations,
            merges = stats.merges,
            persisted = completion.persisted,
            total = completion.total,
            "First segmentation finished"
        );
        drop(nodes);

        if completion.is_last() {
            self.finalize()?;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        match &*self.state.lock() {
            RunState::Running | RunState::Finalized(_) => Ok(()),
            RunState::Failed(reason) => Err(Error::Aborted(reason.clone())),
            RunState::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Moves a running run into its terminal failure state.
    fn fail(&self, err: Error) -> Error {
        let mut state = self.state.lock();
        if matches!(*state, RunState::Running) {
            *state = match &err {
                Error::Cancelled => RunState::Cancelled,
                other => {
                    error!(error = %other, "Segmentation run aborted");
                    RunState::Failed(other.to_string())
                }
            };
        }
        drop(state);
        self.state_changed.notify_all();
        err
    }

    fn wait_finalized(&self) -> Result<Arc<Finalized>> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                RunState::Running => {}
                RunState::Finalized(finalized) => return Ok(Arc::clone(finalized)),
                RunState::Failed(reason) => return Err(Error::Aborted(reason.clone())),
                RunState::Cancelled => return Err(Error::Cancelled),
            }
            self.state_changed.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::MergingCostCriterion;
    use crate::source::{MultiBandImage, PixelTile};

    struct CountingSource {
        image: MultiBandImage,
        reads: AtomicUsize,
    }

    impl TileSource for CountingSource {
        fn read(&self, rect: Rect, bands: &[String]) -> Result<PixelTile> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.image.read(rect, bands)
        }
    }

    fn config(dir: &tempfile::TempDir, tile: u32) -> GrmConfig {
        let mut config = GrmConfig::new(MergingCostCriterion::Spring, 50.0, vec!["v".to_string()]);
        config.tile_width = tile;
        config.tile_height = tile;
        config.total_iterations_for_second_segmentation = 20;
        config.work_dir = Some(dir.path().to_path_buf());
        config
    }

    fn image() -> MultiBandImage {
        let values = (0..16).map(|i| if i < 8 { 10.0 } else { 90.0 }).collect();
        MultiBandImage::from_f32(4, 4, "v", values).unwrap()
    }

    #[test]
    fn invalid_configuration_fails_before_any_tile() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = config(&dir, 2);
        bad.threshold = 0.0;
        assert!(matches!(RunContext::new(bad, 4, 4), Err(Error::Config(_))));
        assert!(matches!(
            RunContext::new(config(&dir, 2), 0, 4),
            Err(Error::EmptyImage { .. })
        ));
    }

    #[test]
    fn duplicate_request_returns_existing_tile() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunContext::new(config(&dir, 2), 4, 4).unwrap();
        let source = CountingSource {
            image: image(),
            reads: AtomicUsize::new(0),
        };
        let rect = Rect::new(0, 0, 2, 2);

        let first = run.compute_tile(rect, &source).unwrap();
        let second = run.compute_tile(rect, &source).unwrap();
        assert!(first.is_new());
        assert!(!second.is_new());
        assert!(Arc::ptr_eq(first.tile(), second.tile()));
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
        assert_eq!(run.tile_state(TileKey::new(0, 0)), Some(TileState::Persisted));
    }

    #[test]
    fn concurrent_requests_segment_each_tile_once() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunContext::new(config(&dir, 2), 4, 4).unwrap();
        let source = CountingSource {
            image: image(),
            reads: AtomicUsize::new(0),
        };
        let rects: Vec<Rect> = run.layout().keys().map(|key| run.layout().tile_rect(key)).collect();

        let new_tiles = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for rect in &rects {
                        if run.compute_tile(*rect, &source).unwrap().is_new() {
                            new_tiles.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(new_tiles.load(Ordering::SeqCst), 4);
        assert_eq!(source.reads.load(Ordering::SeqCst), 4);
        assert!(run.is_finalized());
        assert_eq!(run.regions().unwrap().len(), 2);
    }

    #[test]
    fn labels_are_deferred_until_the_last_tile() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunContext::new(config(&dir, 2), 4, 4).unwrap();
        let image = image();
        let whole = Rect::new(0, 0, 4, 4);

        for key in run.layout().keys().collect::<Vec<_>>() {
            assert!(run.try_labels(whole).unwrap().is_none());
            run.compute_tile(run.layout().tile_rect(key), &image).unwrap();
        }
        let labels = run.try_labels(whole).unwrap().unwrap();
        assert_eq!(labels, run.labels(whole).unwrap());
        assert_eq!(labels.row(0), &[0, 0, 0, 0]);
        assert_eq!(labels.row(3), &[1, 1, 1, 1]);
    }

    #[test]
    fn failure_aborts_later_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir, 2);
        cfg.source_band_names = vec!["missing".to_string()];
        let run = RunContext::new(cfg, 4, 4).unwrap();
        let image = image();

        assert!(matches!(
            run.compute_tile(Rect::new(0, 0, 2, 2), &image),
            Err(Error::UnknownBand(_))
        ));
        assert!(matches!(
            run.compute_tile(Rect::new(2, 0, 2, 2), &image),
            Err(Error::Aborted(_))
        ));
        assert!(matches!(run.labels(Rect::new(0, 0, 4, 4)), Err(Error::Aborted(_))));
    }

    #[test]
    fn misaligned_rect_is_rejected_without_failing_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunContext::new(config(&dir, 2), 4, 4).unwrap();
        let image = image();

        assert!(matches!(
            run.compute_tile(Rect::new(1, 0, 2, 2), &image),
            Err(Error::TileMismatch { .. })
        ));
        assert!(run.compute_tile(Rect::new(0, 0, 2, 2), &image).is_ok());
    }

    #[test]
    fn cancel_wakes_blocked_readers() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunContext::new(config(&dir, 2), 4, 4).unwrap();

        std::thread::scope(|scope| {
            let reader = scope.spawn(|| run.labels(Rect::new(0, 0, 4, 4)));
            std::thread::sleep(std::time::Duration::from_millis(20));
            run.cancel();
            assert!(matches!(reader.join().unwrap(), Err(Error::Cancelled)));
        });
        assert!(matches!(
            run.compute_tile(Rect::new(0, 0, 2, 2), &image()),
            Err(Error::Cancelled)
        ));
    }
}
