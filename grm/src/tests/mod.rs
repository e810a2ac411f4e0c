mod run_tests;

use std::collections::HashMap;

use crate::config::{GrmConfig, MergingCostCriterion, RegionMergingCriterion};
use crate::source::MultiBandImage;

pub(crate) fn config(
    dir: &tempfile::TempDir,
    criterion: MergingCostCriterion,
    rule: RegionMergingCriterion,
    threshold: f32,
    tile: (u32, u32),
) -> GrmConfig {
    let mut config = GrmConfig::new(criterion, threshold, vec!["v".to_string()]);
    config.region_merging_criterion = rule;
    config.tile_width = tile.0;
    config.tile_height = tile.1;
    config.total_iterations_for_second_segmentation = 200;
    config.work_dir = Some(dir.path().to_path_buf());
    config
}

/// Top half 10, bottom half 90.
pub(crate) fn two_blocks() -> MultiBandImage {
    let values = (0..16).map(|i| if i < 8 { 10.0 } else { 90.0 }).collect();
    MultiBandImage::from_f32(4, 4, "v", values).expect("4x4 image")
}

/// 4-connected components of equal values, labeled in raster order.
pub(crate) fn equal_value_components(values: &[f32], width: usize, height: usize) -> Vec<usize> {
    let mut labels = vec![usize::MAX; values.len()];
    let mut next = 0;
    for start in 0..values.len() {
        if labels[start] != usize::MAX {
            continue;
        }
        labels[start] = next;
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            let (x, y) = (i % width, i / width);
            let mut neighbors = Vec::with_capacity(4);
            if x > 0 {
                neighbors.push(i - 1);
            }
            if x + 1 < width {
                neighbors.push(i + 1);
            }
            if y > 0 {
                neighbors.push(i - width);
            }
            if y + 1 < height {
                neighbors.push(i + width);
            }
            for n in neighbors {
                if labels[n] == usize::MAX && values[n] == values[i] {
                    labels[n] = next;
                    stack.push(n);
                }
            }
        }
        next += 1;
    }
    labels
}

/// Whether two labelings group the pixels identically.
pub(crate) fn same_partition<A, B>(a: &[A], b: &[B]) -> bool
where
    A: Copy + Eq + std::hash::Hash,
    B: Copy + Eq + std::hash::Hash,
{
    if a.len() != b.len() {
        return false;
    }
    let mut forward = HashMap::new();
    let mut backward = HashMap::new();
    a.iter().zip(b).all(|(&x, &y)| {
        *forward.entry(x).or_insert(y) == y && *backward.entry(y).or_insert(x) == x
    })
}
