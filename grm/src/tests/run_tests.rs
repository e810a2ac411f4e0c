use super::{config, two_blocks};
use crate::config::{MergingCostCriterion, RegionMergingCriterion};
use crate::criterion::{CostModel, MergeCriterion, SelectionRule};
use crate::drive::segment_image;
use crate::engine::RunContext;
use crate::error::Error;
use crate::first_segmentation::seed_graph;
use crate::geometry::Rect;
use crate::segmenter::{CancelToken, Segmenter};
use crate::source::{MultiBandImage, TileSource};
use crate::tiling::{ProcessingTile, TileKey, TileLayout};

#[test]
fn two_blocks_as_one_tile() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(
        &dir,
        MergingCostCriterion::Spring,
        RegionMergingCriterion::BestFitting,
        50.0,
        (4, 4),
    );

    let segmentation = segment_image(config, &two_blocks(), 1)?;

    assert_eq!(segmentation.labels.pixels(), &[0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1]);
    assert_eq!(segmentation.regions.len(), 2);
    assert_eq!(segmentation.regions[0].bbox, Rect::new(0, 0, 4, 2));
    assert_eq!(segmentation.regions[1].bbox, Rect::new(0, 2, 4, 2));
    assert_eq!(segmentation.regions[0].means, vec![10.0]);
    assert_eq!(segmentation.regions[1].means, vec![90.0]);
    assert!(segmentation.regions.iter().all(|r| r.area == 8 && r.perimeter == 12));
    Ok(())
}

#[test]
fn two_blocks_as_two_tiles() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(
        &dir,
        MergingCostCriterion::Spring,
        RegionMergingCriterion::BestFitting,
        50.0,
        (2, 4),
    );

    let segmentation = segment_image(config, &two_blocks(), 2)?;

    assert_eq!(segmentation.labels.pixels(), &[0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1]);
    let bboxes: Vec<Rect> = segmentation.regions.iter().map(|r| r.bbox).collect();
    assert_eq!(bboxes, vec![Rect::new(0, 0, 4, 2), Rect::new(0, 2, 4, 2)]);
    Ok(())
}

#[test]
fn zero_threshold_keeps_every_pixel() -> anyhow::Result<()> {
    let image = two_blocks();
    let layout = TileLayout::new(4, 4, 4, 4, 0);
    let key = TileKey::new(0, 0);
    let tile = ProcessingTile {
        key,
        rect: layout.tile_rect(key),
        margin: 0,
        region: layout.region_rect(key),
        path: Default::default(),
    };
    let pixels = image.read(tile.region, &["v".to_string()])?;
    let mut graph = seed_graph(&tile, &pixels, 1)?;
    let criterion = MergeCriterion::new(CostModel::Spring, SelectionRule::BestFitting, 0.0);

    let stats = Segmenter::new(&criterion, &CancelToken::new(), 10).run(&mut graph)?;

    assert_eq!(stats.merges, 0);
    assert_eq!(graph.len(), 16);

    // a run configuration refuses the same threshold up front
    let dir = tempfile::tempdir()?;
    let config = config(
        &dir,
        MergingCostCriterion::Spring,
        RegionMergingCriterion::BestFitting,
        0.0,
        (4, 4),
    );
    assert!(matches!(segment_image(config, &image, 1), Err(Error::Config(_))));
    Ok(())
}

#[test]
fn labels_partition_the_image() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let values: Vec<f32> = (0..9 * 7).map(|i| ((i % 9) / 3 * 40 + (i / 9) / 4 * 100) as f32).collect();
    let image = MultiBandImage::from_f32(9, 7, "v", values)?;
    let config = config(
        &dir,
        MergingCostCriterion::FullLambdaSchedule,
        RegionMergingCriterion::LocalMutualBestFitting,
        5.0,
        (4, 3),
    );

    let segmentation = segment_image(config, &image, 3)?;

    let area: u32 = segmentation.regions.iter().map(|r| r.area).sum();
    assert_eq!(area, 63);
    for region in &segmentation.regions {
        let painted = segmentation
            .labels
            .iter()
            .filter(|&&label| label == region.id)
            .count();
        assert_eq!(painted as u32, region.area, "region {}", region.id);
    }
    // 3 column bands x 2 row bands of constant value
    assert_eq!(segmentation.regions.len(), 6);
    Ok(())
}

#[test]
fn label_windows_match_the_full_raster() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let values: Vec<f32> = (0..8 * 8).map(|i| ((i % 8) / 2 * 30) as f32).collect();
    let image = MultiBandImage::from_f32(8, 8, "v", values)?;
    let run = RunContext::new(
        config(
            &dir,
            MergingCostCriterion::Spring,
            RegionMergingCriterion::BestFitting,
            10.0,
            (3, 3),
        ),
        8,
        8,
    )?;
    for key in run.layout().keys().collect::<Vec<_>>() {
        run.compute_tile(run.layout().tile_rect(key), &image)?;
    }

    let full = run.labels(image.rect())?;
    let window = Rect::new(2, 3, 4, 5);
    let part = run.labels(window)?;
    for y in 0..window.height as usize {
        assert_eq!(
            part.row(y),
            &full.row(y + window.y as usize)[window.x as usize..window.right() as usize]
        );
    }
    assert_eq!(run.regions()?.len(), 4);
    Ok(())
}

#[test]
fn work_dir_is_removed_with_the_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let run = RunContext::new(
        config(
            &dir,
            MergingCostCriterion::Spring,
            RegionMergingCriterion::BestFitting,
            50.0,
            (2, 2),
        ),
        4,
        4,
    )?;
    let work_dir = run.work_dir().to_path_buf();
    assert!(work_dir.starts_with(dir.path()));
    assert!(work_dir.exists());

    drop(run);
    assert!(!work_dir.exists());
    Ok(())
}

#[test]
fn cancelled_run_reports_cancelled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let image = two_blocks();
    let run = RunContext::new(
        config(
            &dir,
            MergingCostCriterion::Spring,
            RegionMergingCriterion::BestFitting,
            50.0,
            (2, 2),
        ),
        4,
        4,
    )?;
    run.compute_tile(Rect::new(0, 0, 2, 2), &image)?;
    run.cancel();

    assert!(matches!(
        run.compute_tile(Rect::new(2, 0, 2, 2), &image),
        Err(Error::Cancelled)
    ));
    assert!(matches!(run.try_labels(image.rect()), Err(Error::Cancelled)));
    assert!(matches!(run.regions(), Err(Error::Cancelled)));
    Ok(())
}
