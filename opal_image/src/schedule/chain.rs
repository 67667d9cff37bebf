//! Profile-driven block chaining (JIT mode).
//!
//! Greedy maximal-weight matching over chain endpoints: every block starts
//! as a singleton chain, edges are consumed from the heaviest down, and an
//! edge merges two chains only while its source is still the tail of one
//! chain and its target the head of the other. Emission walks the original
//! reverse-postorder index and lays out a whole chain at its head's
//! position, which keeps the result a valid topological order.

use std::collections::VecDeque;

use super::graph::BlockGraph;
use super::ScheduleStats;

// =============================================================================
// Chain Set
// =============================================================================

/// Disjoint chains of blocks with O(1) membership lookup.
///
/// `chain_of` maps a block's reverse-postorder index straight to its chain;
/// a union rewrites the mapping of the shorter chain's blocks into the
/// longer one, which keeps total relinking work O(n log n).
struct ChainSet {
    chain_of: Vec<u32>,
    chains: Vec<VecDeque<u32>>,
}

impl ChainSet {
    fn new(block_count: usize) -> Self {
        Self {
            chain_of: (0..block_count as u32).collect(),
            chains: (0..block_count as u32)
                .map(|block| VecDeque::from([block]))
                .collect(),
        }
    }

    #[inline]
    fn chain_of(&self, block: u32) -> u32 {
        self.chain_of[block as usize]
    }

    #[inline]
    fn head(&self, chain: u32) -> u32 {
        *self.chains[chain as usize].front().expect("empty chain")
    }

    #[inline]
    fn tail(&self, chain: u32) -> u32 {
        *self.chains[chain as usize].back().expect("empty chain")
    }

    #[inline]
    fn blocks(&self, chain: u32) -> impl Iterator<Item = u32> + '_ {
        self.chains[chain as usize].iter().copied()
    }

    /// Merge `target`'s chain behind `source`'s chain, relinking whichever
    /// side is shorter.
    fn unite(&mut self, source: u32, target: u32) {
        debug_assert_ne!(source, target);
        if self.chains[source as usize].len() >= self.chains[target as usize].len() {
            let moved = std::mem::take(&mut self.chains[target as usize]);
            for block in moved {
                self.chain_of[block as usize] = source;
                self.chains[source as usize].push_back(block);
            }
        } else {
            let moved = std::mem::take(&mut self.chains[source as usize]);
            for block in moved.into_iter().rev() {
                self.chain_of[block as usize] = target;
                self.chains[target as usize].push_front(block);
            }
        }
    }
}

// =============================================================================
// Scheduling
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Edge {
    source: u32,
    target: u32,
    weight: f64,
}

/// Order blocks along the heaviest control-flow edges.
pub(super) fn schedule_profiled(graph: &BlockGraph, stats: &mut ScheduleStats) -> Vec<u32> {
    let block_count = graph.block_count();
    let mut chains = ChainSet::new(block_count);

    let mut edges = Vec::new();
    for source in 0..block_count as u32 {
        for &(target, weight) in graph.successors(source) {
            edges.push(Edge {
                source,
                target,
                weight,
            });
        }
    }
    edges.sort_by(|a, b| a.weight.total_cmp(&b.weight));

    // Consume the heaviest remaining edge first.
    while let Some(edge) = edges.pop() {
        let source_chain = chains.chain_of(edge.source);
        let target_chain = chains.chain_of(edge.target);
        if source_chain == target_chain {
            continue;
        }
        if chains.tail(source_chain) != edge.source {
            continue;
        }
        if chains.head(target_chain) != edge.target {
            continue;
        }
        chains.unite(source_chain, target_chain);
        stats.chain_unions += 1;
    }

    // A chain takes the topological position of its head.
    let mut order = Vec::with_capacity(block_count);
    for index in 0..block_count as u32 {
        let chain = chains.chain_of(index);
        if chains.head(chain) == index {
            order.extend(chains.blocks(chain));
            stats.chains_emitted += 1;
        }
    }
    order
}

// =============================================================================
// Tests
// =============================================================================
