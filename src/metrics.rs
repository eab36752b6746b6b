use serde::Serialize;

use crate::interprocedural::whole_program::WholeProgramState;
use crate::runtime_assert::AssertStats;
use crate::transform::TransformStats;

/// Counters reported after a run.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct Metrics {
    pub(crate) constant_fields: usize,
    pub(crate) constant_methods: usize,
    pub(crate) branches_removed: usize,
    pub(crate) materialized_consts: usize,
    pub(crate) redundant_puts_removed: usize,
    pub(crate) dead_blocks_removed: usize,
    /// Call sites whose callees never return.
    pub(crate) throws: usize,
    pub(crate) asserts_inserted: usize,
    pub(crate) rounds: usize,
}

impl Metrics {
    pub(crate) fn from_analysis(whole_program: &WholeProgramState, rounds: usize) -> Self {
        Self {
            constant_fields: whole_program.constant_field_count(),
            constant_methods: whole_program.constant_method_count(),
            rounds,
            ..Self::default()
        }
    }

    pub(crate) fn record_transform(&mut self, stats: &TransformStats) {
        self.branches_removed += stats.branches_removed;
        self.materialized_consts += stats.materialized_consts;
        self.redundant_puts_removed += stats.redundant_puts_removed;
        self.dead_blocks_removed += stats.dead_blocks_removed;
    }

    /// Add another partial count; the whole-program figures are kept.
    pub(crate) fn merge(&mut self, other: &Metrics) {
        self.branches_removed += other.branches_removed;
        self.materialized_consts += other.materialized_consts;
        self.redundant_puts_removed += other.redundant_puts_removed;
        self.dead_blocks_removed += other.dead_blocks_removed;
        self.throws += other.throws;
        self.asserts_inserted += other.asserts_inserted;
    }

    pub(crate) fn record_asserts(&mut self, stats: &AssertStats) {
        self.asserts_inserted += stats.asserts_inserted;
        self.throws += stats.throws;
    }
}
