//! Merge cost models and candidate selection rules.
//!
//! Both are closed enums resolved once from the run configuration into a
//! [`MergeCriterion`]. Every cost formula combines the two operands only through
//! commutative operations, so `cost(a, b)` and `cost(b, a)` are bit-identical.

use crate::config::{ConfigError, GrmConfig, MergingCostCriterion, RegionMergingCriterion};
use crate::geometry::PixelPos;
use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CostModel {
    Spring,
    /// Weights are normalized to sum to one.
    BaatzSchape {
        spectral_weight: f32,
        shape_weight: f32,
    },
    FullLambdaSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionRule {
    BestFitting,
    #[default]
    LocalMutualBestFitting,
}

impl From<RegionMergingCriterion> for SelectionRule {
    fn from(value: RegionMergingCriterion) -> Self {
        match value {
            RegionMergingCriterion::BestFitting => SelectionRule::BestFitting,
            RegionMergingCriterion::LocalMutualBestFitting => SelectionRule::LocalMutualBestFitting,
        }
    }
}

/// Cost model, selection rule and acceptance threshold of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeCriterion {
    pub model: CostModel,
    pub rule: SelectionRule,
    /// Merges are accepted only when `cost < threshold`.
    pub threshold: f32,
}

impl MergeCriterion {
    /// Unvalidated criterion. A threshold of zero accepts no merge at all.
    pub fn new(model: CostModel, rule: SelectionRule, threshold: f32) -> Self {
        Self {
            model,
            rule,
            threshold,
        }
    }

    pub fn from_config(config: &GrmConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let model = match config.merging_cost_criterion {
            MergingCostCriterion::Spring => CostModel::Spring,
            MergingCostCriterion::FullLambdaSchedule => CostModel::FullLambdaSchedule,
            MergingCostCriterion::BaatzSchape => {
                let total = config.spectral_weight + config.shape_weight;
                CostModel::BaatzSchape {
                    spectral_weight: config.spectral_weight / total,
                    shape_weight: config.shape_weight / total,
                }
            }
        };

        Ok(Self::new(
            model,
            config.region_merging_criterion.into(),
            config.threshold,
        ))
    }

    #[inline]
    pub fn accepts(&self, cost: f32) -> bool {
        cost < self.threshold
    }

    /// Cost of merging `a` and `b`, adjacent along `boundary` cracks.
    pub fn cost(&self, a: &Node, b: &Node, boundary: u32) -> f32 {
        debug_assert_eq!(a.band_count(), b.band_count());
        match self.model {
            CostModel::Spring => spectral_distance(a, b),
            CostModel::FullLambdaSchedule => {
                a.perimeter.min(b.perimeter) as f32 * spectral_distance(a, b)
            }
            CostModel::BaatzSchape {
                spectral_weight,
                shape_weight,
            } => {
                spectral_weight * spectral_heterogeneity(a, b)
                    + shape_weight * shape_heterogeneity(a, b, boundary)
            }
        }
    }
}

/// Euclidean distance between mean spectra.
fn spectral_distance(a: &Node, b: &Node) -> f32 {
    a.bands
        .iter()
        .zip(&b.bands)
        .map(|(x, y)| {
            let d = x.mean - y.mean;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// Increase of area-weighted standard deviation, summed over bands.
fn spectral_heterogeneity(a: &Node, b: &Node) -> f32 {
    let area = a.area + b.area;
    let area_f = area as f32;
    let (area_a, area_b) = (a.area as f32, b.area as f32);
    a.bands
        .iter()
        .zip(&b.bands)
        .map(|(x, y)| {
            let merged = x.merged(y, area);
            area_f * merged.std - (area_a * x.std + area_b * y.std)
        })
        .sum()
}

/// Mean of the compactness and smoothness increases.
fn shape_heterogeneity(a: &Node, b: &Node, boundary: u32) -> f32 {
    let area = (a.area + b.area) as f32;
    let perimeter = a.merged_perimeter(b, boundary) as f32;
    let bbox_perimeter = a.bbox.union(&b.bbox).perimeter() as f32;

    let compact = |p: f32, a: f32| a * p / a.sqrt();
    let smooth = |p: f32, a: f32, bp: f32| a * p / bp;

    let (pa, aa, ba) = (a.perimeter as f32, a.area as f32, a.bbox.perimeter() as f32);
    let (pb, ab, bb) = (b.perimeter as f32, b.area as f32, b.bbox.perimeter() as f32);

    let compactness = compact(perimeter, area) - (compact(pa, aa) + compact(pb, ab));
    let smoothness = smooth(perimeter, area, bbox_perimeter) - (smooth(pa, aa, ba) + smooth(pb, ab, bb));
    0.5 * compactness + 0.5 * smoothness
}

/// Deterministic ordering key for equal-cost candidates.
///
/// Depends only on the unordered pair of anchors, so both endpoints rank the
/// pair the same way and the key is the same however the image is tiled.
/// Hashing instead of comparing anchors keeps ties from forming long chains in
/// uniform areas, where every node would otherwise prefer its oldest neighbor.
pub fn tie_key(a: PixelPos, b: PixelPos) -> u64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let packed_lo = ((lo.y as u64) << 32) | lo.x as u64;
    let packed_hi = ((hi.y as u64) << 32) | hi.x as u64;
    mix64(mix64(packed_lo) ^ packed_hi.rotate_left(17))
}

#[inline]
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
