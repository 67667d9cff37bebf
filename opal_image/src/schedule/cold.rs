//! Static block layout with cold segregation (AOT mode).
//!
//! Without counters the scheduler leans on structure: a depth-first walk
//! from the entry that keeps loop bodies contiguous, with blocks that can
//! only end in a throw peeled off into a trailing cold region.

use smallvec::SmallVec;

use super::graph::BlockGraph;
use super::ScheduleStats;

/// Compute the cold mark for every block.
///
/// A block is cold when its terminator always throws, or when it has
/// successors and every one of them is cold; the property propagates
/// upward to a fixpoint.
fn propagate_cold(graph: &BlockGraph) -> Vec<bool> {
    let block_count = graph.block_count();
    let mut cold: Vec<bool> = (0..block_count as u32)
        .map(|block| graph.always_throws(block))
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for block in (0..block_count as u32).rev() {
            if cold[block as usize] {
                continue;
            }
            let succs = graph.successors(block);
            if !succs.is_empty() && succs.iter().all(|&(target, _)| cold[target as usize]) {
                cold[block as usize] = true;
                changed = true;
            }
        }
    }
    cold
}

/// Order blocks by structural DFS, cold-and-unpinned blocks last.
pub(super) fn schedule_static(graph: &BlockGraph, stats: &mut ScheduleStats) -> Vec<u32> {
    let block_count = graph.block_count();
    if block_count == 0 {
        return Vec::new();
    }

    let cold = propagate_cold(graph);

    let mut normal = Vec::with_capacity(block_count);
    let mut demoted = Vec::new();
    let mut visited = vec![false; block_count];
    let mut stack = vec![0u32];

    while let Some(block) = stack.pop() {
        if visited[block as usize] {
            continue;
        }
        visited[block as usize] = true;

        if cold[block as usize] && !graph.is_pinned(block) {
            demoted.push(block);
        } else {
            normal.push(block);
        }

        let succs: SmallVec<[u32; 2]> = graph
            .successors(block)
            .iter()
            .map(|&(target, _)| target)
            .collect();
        if succs.len() == 2 && graph.loop_depth(block) > 0 {
            // Keep the loop body contiguous: the deeper successor's subtree
            // is visited first, so it is pushed second (LIFO).
            let (first, second) = if graph.loop_depth(succs[0]) >= graph.loop_depth(succs[1]) {
                (succs[0], succs[1])
            } else {
                (succs[1], succs[0])
            };
            stack.push(second);
            stack.push(first);
        } else {
            for &succ in succs.iter().rev() {
                stack.push(succ);
            }
        }
    }

    debug_assert!(
        visited.iter().all(|&seen| seen),
        "block unreachable from the entry"
    );

    stats.cold_blocks = demoted.len();
    normal.extend(demoted);
    normal
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run(graph: &BlockGraph) -> (Vec<u32>, ScheduleStats) {
        let mut stats = ScheduleStats::default();
        let order = schedule_static(graph, &mut stats);
        (order, stats)
    }

    #[test]
    fn test_dfs_visits_first_successor_first() {
        let mut graph = BlockGraph::new(4);
        graph.add_edge(0, 1);
        graph.add_edge(0, 2);
        graph.add_edge(1, 3);
        graph.add_edge(2, 3);

        let (order, stats) = run(&graph);
        assert_eq!(order, vec![0, 1, 3, 2]);
        assert_eq!(stats.cold_blocks, 0);
    }

    #[test]
    fn test_throwing_block_moves_to_cold_region() {
        let mut graph = BlockGraph::new(3);
        graph.add_edge(0, 1);
        graph.add_edge(0, 2);
        graph.set_always_throws(2);

        let (order, stats) = run(&graph);
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(stats.cold_blocks, 1);
    }

    #[test]
    fn test_cold_propagates_through_all_cold_successors() {
        // 2's only successors both throw, so 2 itself is cold.
        let mut graph = BlockGraph::new(5);
        graph.add_edge(0, 1);
        graph.add_edge(0, 2);
        graph.add_edge(2, 3);
        graph.add_edge(2, 4);
        graph.set_always_throws(3);
        graph.set_always_throws(4);

        let (order, stats) = run(&graph);
        assert_eq!(stats.cold_blocks, 3);
        // Cold blocks trail the normal region.
        assert_eq!(&order[..2], &[0, 1]);
        let mut tail = order[2..].to_vec();
        tail.sort_unstable();
        assert_eq!(tail, vec![2, 3, 4]);
    }

    #[test]
    fn test_pinned_block_is_never_demoted() {
        let mut graph = BlockGraph::new(2);
        graph.add_edge(0, 1);
        graph.set_always_throws(1);
        graph.set_pinned(1);

        let (order, stats) = run(&graph);
        assert_eq!(order, vec![0, 1]);
        assert_eq!(stats.cold_blocks, 0);
    }

    #[test]
    fn test_entry_stays_first_even_when_cold() {
        // The entry's one successor throws, making the entry notionally
        // cold, but the entry is implicitly pinned.
        let mut graph = BlockGraph::new(2);
        graph.add_edge(0, 1);
        graph.set_always_throws(1);

        let (order, stats) = run(&graph);
        assert_eq!(order, vec![0, 1]);
        assert_eq!(stats.cold_blocks, 1);
    }

    #[test]
    fn test_loop_body_kept_contiguous() {
        // Block 1 heads a loop whose exit is listed before the body; the
        // depth rule still visits the body first.
        let mut graph = BlockGraph::new(4);
        graph.add_edge(0, 1);
        graph.add_edge(1, 3); // exit, depth 0
        graph.add_edge(1, 2); // body, depth 1
        graph.add_edge(2, 1); // back edge
        graph.set_loop_depth(1, 1);
        graph.set_loop_depth(2, 1);

        let (order, _) = run(&graph);
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_order_is_permutation() {
        let mut graph = BlockGraph::new(6);
        graph.add_edge(0, 1);
        graph.add_edge(1, 2);
        graph.add_edge(1, 3);
        graph.add_edge(2, 4);
        graph.add_edge(3, 4);
        graph.add_edge(4, 5);
        graph.set_always_throws(5);

        let (order, _) = run(&graph);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5]);
    }
}
