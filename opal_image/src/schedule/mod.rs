//! Basic-block scheduling for one function.
//!
//! Runs on the function's block graph before final code emission and
//! produces a new block order:
//! - **JIT mode** consumes per-edge execution frequencies from the
//!   instrumented unoptimized code and chains blocks along the
//!   highest-weight edges so hot successors fall through;
//! - **AOT mode** has no counters; it keeps loop bodies contiguous and
//!   pushes never-taken cold blocks behind everything else.
//!
//! The emitted order is always a permutation of the input blocks.

mod chain;
mod cold;
mod graph;

pub use graph::BlockGraph;

use opal_core::config::{BuildMode, LayoutConfig};

// =============================================================================
// Scheduler
// =============================================================================

/// Reorders one function's basic blocks according to the build mode.
#[derive(Debug)]
pub struct BlockScheduler {
    config: LayoutConfig,
    stats: ScheduleStats,
}

impl BlockScheduler {
    /// Create a scheduler for the given configuration.
    pub fn new(config: LayoutConfig) -> Self {
        Self {
            config,
            stats: ScheduleStats::default(),
        }
    }

    /// Produce the new block order for `graph`.
    ///
    /// Blocks are identified by their reverse-postorder index; block 0 is
    /// the entry and is always emitted first.
    pub fn schedule(&mut self, graph: &BlockGraph) -> Vec<u32> {
        self.stats = ScheduleStats::default();
        self.stats.blocks_scheduled = graph.block_count();

        let order = match self.config.mode {
            BuildMode::Jit => chain::schedule_profiled(graph, &mut self.stats),
            BuildMode::Aot => cold::schedule_static(graph, &mut self.stats),
        };

        debug_assert_eq!(order.len(), graph.block_count());
        order
    }

    /// Counters from the last `schedule` call.
    #[inline]
    pub fn stats(&self) -> &ScheduleStats {
        &self.stats
    }
}

/// Counters describing one scheduling run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleStats {
    /// Blocks in the scheduled function.
    pub blocks_scheduled: usize,
    /// Chain unions performed (JIT mode).
    pub chain_unions: usize,
    /// Chains surviving to emission (JIT mode).
    pub chains_emitted: usize,
    /// Blocks segregated into the trailing cold region (AOT mode).
    pub cold_blocks: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_dispatch() {
        let mut graph = BlockGraph::new(3);
        graph.add_weighted_edge(0, 1, 1.0);
        graph.add_edge(1, 2);

        let mut jit = BlockScheduler::new(LayoutConfig::jit());
        let order = jit.schedule(&graph);
        assert_eq!(order.len(), 3);
        assert_eq!(jit.stats().blocks_scheduled, 3);

        let mut aot = BlockScheduler::new(LayoutConfig::aot());
        let order = aot.schedule(&graph);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], 0);
    }
}
