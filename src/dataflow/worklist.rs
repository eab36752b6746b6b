use std::collections::BTreeSet;

use crate::cfg::MethodGraph;
use crate::ir::{BasicBlock, EdgeKind, FlowEdge};

/// States a block hands to its successors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BlockOutcome<S> {
    /// State after the last instruction, sent along normal edges.
    pub(crate) exit: S,
    /// State sent along throw edges.
    pub(crate) exceptional: S,
}

/// Domain callbacks required by the block-level fixpoint.
pub(crate) trait FixpointSemantics {
    type State: Clone + Eq;

    fn bottom(&self) -> Self::State;

    /// State flowing into the entry block from the method's caller.
    fn initial_state(&self) -> Self::State;

    fn join(&self, left: &Self::State, right: &Self::State) -> Self::State;

    fn transfer_block(&self, block: &BasicBlock, entry: &Self::State) -> BlockOutcome<Self::State>;

    /// State flowing along `edge`. Ghost edges carry nothing.
    fn transfer_edge(
        &self,
        edge: &FlowEdge,
        _block: &BasicBlock,
        outcome: &BlockOutcome<Self::State>,
    ) -> Self::State {
        match edge.kind {
            EdgeKind::Throw => outcome.exceptional.clone(),
            EdgeKind::Ghost => self.bottom(),
            EdgeKind::Goto | EdgeKind::Branch { .. } => outcome.exit.clone(),
        }
    }
}

/// Per-block and per-edge states at the fixpoint, indexed like [`MethodGraph`].
#[derive(Clone, Debug)]
pub(crate) struct FixpointStates<S> {
    pub(crate) entry: Vec<S>,
    pub(crate) outcome: Vec<BlockOutcome<S>>,
    pub(crate) edges: Vec<S>,
    /// Number of block transfers performed.
    pub(crate) visits: usize,
}

/// Monotone worklist iteration. Blocks are seeded in post-order and always
/// popped in reverse post-order, so the result does not depend on hashing or
/// thread scheduling.
pub(crate) fn solve<S>(graph: &MethodGraph<'_>, semantics: &S) -> FixpointStates<S::State>
where
    S: FixpointSemantics,
{
    let post_order = graph.post_order();
    let mut rank = vec![0usize; graph.block_count()];
    for (index, position) in post_order.iter().rev().enumerate() {
        rank[*position] = index;
    }
    let mut by_rank = vec![0usize; graph.block_count()];
    for (position, rank_of) in rank.iter().enumerate() {
        by_rank[*rank_of] = position;
    }

    let bottom = semantics.bottom();
    let mut entry = vec![bottom.clone(); graph.block_count()];
    let mut outcome: Vec<BlockOutcome<S::State>> = vec![
        BlockOutcome {
            exit: bottom.clone(),
            exceptional: bottom.clone(),
        };
        graph.block_count()
    ];
    let mut edges = vec![bottom.clone(); graph.edge_count()];
    let mut visited = vec![false; graph.block_count()];
    let mut worklist: BTreeSet<usize> = post_order.iter().map(|position| rank[*position]).collect();
    let entry_position = graph.entry_position();
    let mut visits = 0;

    while let Some(next) = worklist.pop_first() {
        let position = by_rank[next];
        let mut state = if position == entry_position {
            semantics.initial_state()
        } else {
            bottom.clone()
        };
        for edge in graph.in_edges(position) {
            state = semantics.join(&state, &edges[*edge]);
        }
        let block = graph.block(position);
        let new_outcome = semantics.transfer_block(block, &state);
        visits += 1;
        entry[position] = state;
        let changed = !visited[position] || new_outcome != outcome[position];
        visited[position] = true;
        if !changed {
            continue;
        }
        for edge in graph.out_edges(position) {
            let edge_state = semantics.transfer_edge(graph.edge(*edge), block, &new_outcome);
            if edge_state != edges[*edge] {
                edges[*edge] = edge_state;
                worklist.insert(rank[graph.edge_target(*edge)]);
            }
        }
        outcome[position] = new_outcome;
    }

    FixpointStates {
        entry,
        outcome,
        edges,
        visits,
    }
}
