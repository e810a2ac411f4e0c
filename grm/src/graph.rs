//! Region adjacency graph stored as an arena.
//!
//! Nodes live in slots addressed by [`NodeIdx`]. A merge tombstones both
//! operand slots and appends the merged node, so indices handed out earlier
//! never alias a different region. Neighbor lists hold indices and shared
//! boundary lengths; every list touching a merged pair is rewritten.

use std::cmp::Ordering;

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use crate::criterion::{tie_key, MergeCriterion};
use crate::error::{Error, Result};
use crate::geometry::{Crack, PixelPos};
use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIdx(u32);

impl NodeIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub target: NodeIdx,
    /// Shared boundary length in cracks.
    pub boundary: u32,
}

/// Cheapest neighbor of a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub target: NodeIdx,
    pub cost: f32,
    pub key: u64,
    /// Anchor of `target`.
    pub anchor: PixelPos,
}

impl Candidate {
    fn cmp_rank(&self, other: &Candidate) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then(self.key.cmp(&other.key))
            .then(self.anchor.cmp(&other.anchor))
    }
}

#[derive(Debug, Clone)]
struct Slot {
    node: Node,
    edges: Vec<Edge>,
    /// `None` when stale.
    best: Option<Option<Candidate>>,
}

#[derive(Debug, Clone)]
pub struct RegionGraph {
    slots: Vec<Option<Slot>>,
    live: usize,
    next_id: u32,
    band_count: usize,
}

impl RegionGraph {
    pub fn new(band_count: usize) -> Self {
        Self::with_capacity(band_count, 0)
    }

    pub fn with_capacity(band_count: usize, capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            live: 0,
            next_id: 0,
            band_count,
        }
    }

    /// Builds a graph from persisted nodes, recovering adjacency from shared cracks.
    pub fn from_nodes(band_count: usize, nodes: Vec<Node>) -> Result<Self> {
        let mut graph = Self::with_capacity(band_count, nodes.len());
        for node in nodes {
            graph.push(node)?;
        }

        let mut sides: HashMap<Crack, (NodeIdx, Option<NodeIdx>)> = HashMap::new();
        let mut shared: HashMap<(NodeIdx, NodeIdx), u32> = HashMap::new();
        for (idx, node) in graph.iter() {
            for &crack in node.contour.cracks() {
                match sides.entry(crack) {
                    Entry::Vacant(entry) => {
                        entry.insert((idx, None));
                    }
                    Entry::Occupied(mut entry) => {
                        let (first, second) = entry.get_mut();
                        if second.is_some() {
                            return Err(Error::Inconsistent(format!(
                                "crack {crack:?} bounds more than two regions"
                            )));
                        }
                        *second = Some(idx);
                        *shared.entry((*first, idx)).or_insert(0) += 1;
                    }
                }
            }
        }

        let mut pairs: Vec<_> = shared.into_iter().collect();
        pairs.sort_unstable_by_key(|&(pair, _)| pair);
        for ((a, b), boundary) in pairs {
            graph.connect(a, b, boundary);
        }
        Ok(graph)
    }

    #[inline]
    pub fn band_count(&self) -> usize {
        self.band_count
    }

    /// Number of live nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots ever allocated, tombstones included.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Reserves a fresh node id.
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn push(&mut self, node: Node) -> Result<NodeIdx> {
        if node.band_count() != self.band_count {
            return Err(Error::BandCountMismatch {
                expected: self.band_count,
                found: node.band_count(),
            });
        }
        self.next_id = self.next_id.max(node.id + 1);
        let idx = NodeIdx(self.slots.len() as u32);
        self.slots.push(Some(Slot {
            node,
            edges: Vec::new(),
            best: None,
        }));
        self.live += 1;
        Ok(idx)
    }

    /// Links two nodes not yet adjacent.
    pub fn connect(&mut self, a: NodeIdx, b: NodeIdx, boundary: u32) {
        debug_assert_ne!(a, b);
        for (from, to) in [(a, b), (b, a)] {
            if let Some(slot) = self.slots[from.index()].as_mut() {
                debug_assert!(slot.edges.iter().all(|edge| edge.target != to));
                slot.edges.push(Edge {
                    target: to,
                    boundary,
                });
                slot.best = None;
            }
        }
    }

    #[inline]
    pub fn is_live(&self, idx: NodeIdx) -> bool {
        self.slots
            .get(idx.index())
            .is_some_and(|slot| slot.is_some())
    }

    #[inline]
    pub fn node(&self, idx: NodeIdx) -> Option<&Node> {
        self.slot(idx).map(|slot| &slot.node)
    }

    /// Neighbors of a live node; empty for tombstones.
    #[inline]
    pub fn edges(&self, idx: NodeIdx) -> &[Edge] {
        self.slot(idx).map_or(&[][..], |slot| slot.edges.as_slice())
    }

    /// Live nodes in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, &Node)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|slot| (NodeIdx(i as u32), &slot.node)))
    }

    /// Live nodes ordered by anchor.
    pub fn indices_by_anchor(&self) -> Vec<NodeIdx> {
        let mut order: Vec<(NodeIdx, _)> = self.iter().map(|(idx, node)| (idx, node.anchor)).collect();
        order.sort_unstable_by_key(|&(_, anchor)| anchor);
        order.into_iter().map(|(idx, _)| idx).collect()
    }

    pub fn total_area(&self) -> u64 {
        self.iter().map(|(_, node)| node.area as u64).sum()
    }

    /// Cheapest neighbor of `idx`, cached until the node or a neighbor changes.
    ///
    /// Equal costs are ordered by [`tie_key`], then by the neighbor's anchor.
    pub fn best_candidate(&mut self, idx: NodeIdx, criterion: &MergeCriterion) -> Option<Candidate> {
        let slot = self.slot(idx)?;
        if let Some(best) = slot.best {
            return best;
        }

        let mut best: Option<Candidate> = None;
        for edge in &slot.edges {
            let Some(other) = self.node(edge.target) else {
                continue;
            };
            let candidate = Candidate {
                target: edge.target,
                cost: slot.node.cost_to(other, edge.boundary, criterion),
                key: tie_key(slot.node.anchor, other.anchor),
                anchor: other.anchor,
            };
            if best.map_or(true, |b| candidate.cmp_rank(&b) == Ordering::Less) {
                best = Some(candidate);
            }
        }

        if let Some(slot) = self.slots[idx.index()].as_mut() {
            slot.best = Some(best);
        }
        best
    }

    /// Merges two live nodes and returns the index of the result.
    ///
    /// The nodes need not be adjacent; a group is merged by folding its
    /// members one after the other.
    ///
    /// # Panics
    ///
    /// Panics if either index is a tombstone.
    pub fn merge(&mut self, a: NodeIdx, b: NodeIdx) -> NodeIdx {
        debug_assert_ne!(a, b);
        let id = self.allocate_id();
        let slot_a = self.slots[a.index()].take().expect("merge operand is live");
        let slot_b = self.slots[b.index()].take().expect("merge operand is live");
        let merged = NodeIdx(self.slots.len() as u32);

        let mut edges: Vec<Edge> = Vec::with_capacity(slot_a.edges.len() + slot_b.edges.len());
        for edge in slot_a.edges.iter().chain(&slot_b.edges) {
            if edge.target == a || edge.target == b {
                continue;
            }
            match edges.iter_mut().find(|e| e.target == edge.target) {
                Some(existing) => existing.boundary += edge.boundary,
                None => edges.push(*edge),
            }
        }

        for edge in &edges {
            if let Some(neighbor) = self.slots[edge.target.index()].as_mut() {
                neighbor.edges.retain(|e| e.target != a && e.target != b);
                neighbor.edges.push(Edge {
                    target: merged,
                    boundary: edge.boundary,
                });
                neighbor.best = None;
            }
        }

        let node = slot_a.node.merge_with(&slot_b.node, id);
        self.slots.push(Some(Slot {
            node,
            edges,
            best: None,
        }));
        self.live -= 1;
        merged
    }

    /// Live nodes in anchor order, consuming the graph.
    pub fn into_nodes(mut self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .slots
            .drain(..)
            .flatten()
            .map(|slot| slot.node)
            .collect();
        nodes.sort_unstable_by_key(|node| node.anchor);
        nodes
    }

    /// Verifies that every edge has a live target and a mirror of equal length.
    pub fn check_symmetry(&self) -> Result<()> {
        for (idx, node) in self.iter() {
            for edge in self.edges(idx) {
                let mirrored = self
                    .edges(edge.target)
                    .iter()
                    .any(|back| back.target == idx && back.boundary == edge.boundary);
                if !mirrored {
                    return Err(Error::Inconsistent(format!(
                        "edge from node {} to slot {} has no mirror",
                        node.id,
                        edge.target.index()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Verifies that live areas add up to `expected` pixels.
    pub fn check_partition(&self, expected: u64, scope: impl Into<String>) -> Result<()> {
        let found = self.total_area();
        if found != expected {
            return Err(Error::Partition {
                scope: scope.into(),
                expected,
                found,
            });
        }
        Ok(())
    }

    #[inline]
    fn slot(&self, idx: NodeIdx) -> Option<&Slot> {
        self.slots.get(idx.index()).and_then(|slot| slot.as_ref())
    }
}
