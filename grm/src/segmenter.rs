//! The merge loop shared by first segmentation and stitching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::criterion::{MergeCriterion, SelectionRule};
use crate::error::{Error, Result};
use crate::graph::{NodeIdx, RegionGraph};

/// Shared cancellation flag of a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentationStats {
    pub iterations: u32,
    pub merges: usize,
    /// An iteration found nothing to merge before the budget ran out.
    pub converged: bool,
}

/// Runs merge iterations over a graph.
///
/// An iteration is synchronous: every live node picks its cheapest neighbor
/// from the state at the start of the iteration, then all selected groups
/// merge at once. A group is a pair of nodes picking each other with a cost
/// below the threshold. Under best fitting a group also takes in every node
/// whose pick is one of the pair; nodes picking anything else wait for a
/// later iteration. Members are folded in anchor order.
pub struct Segmenter<'a> {
    criterion: &'a MergeCriterion,
    cancel: &'a CancelToken,
    max_iterations: u32,
}

impl<'a> Segmenter<'a> {
    pub fn new(criterion: &'a MergeCriterion, cancel: &'a CancelToken, max_iterations: u32) -> Self {
        Self {
            criterion,
            cancel,
            max_iterations,
        }
    }

    pub fn run(&self, graph: &mut RegionGraph) -> Result<SegmentationStats> {
        let mut stats = SegmentationStats::default();
        while stats.iterations < self.max_iterations {
            let merges = self.iterate(graph)?;
            stats.iterations += 1;
            stats.merges += merges;
            trace!(
                iteration = stats.iterations,
                merges,
                nodes = graph.len(),
                "Merge iteration"
            );
            if merges == 0 {
                stats.converged = true;
                break;
            }
        }
        debug!(
            iterations = stats.iterations,
            merges = stats.merges,
            converged = stats.converged,
            nodes = graph.len(),
            "Merge loop finished"
        );
        Ok(stats)
    }

    fn iterate(&self, graph: &mut RegionGraph) -> Result<usize> {
        let order = graph.indices_by_anchor();
        let mut picks: HashMap<NodeIdx, NodeIdx> = HashMap::with_capacity(order.len());
        for &idx in &order {
            self.cancel.check()?;
            if let Some(best) = graph.best_candidate(idx, self.criterion) {
                if self.criterion.accepts(best.cost) {
                    picks.insert(idx, best.target);
                }
            }
        }

        let mut merges = 0;
        for group in merge_groups(&order, &picks, self.criterion.rule) {
            self.cancel.check()?;
            let mut members = group.into_iter();
            let Some(mut merged) = members.next() else {
                continue;
            };
            for member in members {
                merged = graph.merge(merged, member);
                merges += 1;
            }
        }
        Ok(merges)
    }
}

/// Groups selected by one iteration, each listed in anchor order.
///
/// `order` holds the live nodes by anchor and `picks` the cheapest neighbor
/// of every node whose best cost is accepted.
fn merge_groups(
    order: &[NodeIdx],
    picks: &HashMap<NodeIdx, NodeIdx>,
    rule: SelectionRule,
) -> Vec<Vec<NodeIdx>> {
    let mut group_of: HashMap<NodeIdx, usize> = HashMap::new();
    let mut count = 0;
    for &idx in order {
        if group_of.contains_key(&idx) {
            continue;
        }
        let Some(&target) = picks.get(&idx) else {
            continue;
        };
        if picks.get(&target) == Some(&idx) {
            group_of.insert(idx, count);
            group_of.insert(target, count);
            count += 1;
        }
    }

    if rule == SelectionRule::BestFitting {
        let joiners: Vec<(NodeIdx, usize)> = order
            .iter()
            .filter(|idx| !group_of.contains_key(*idx))
            .filter_map(|idx| {
                let target = picks.get(idx)?;
                group_of.get(target).map(|&group| (*idx, group))
            })
            .collect();
        group_of.extend(joiners);
    }

    let mut groups = vec![Vec::new(); count];
    for idx in order {
        if let Some(&group) = group_of.get(idx) {
            groups[group].push(*idx);
        }
    }
    groups
}
