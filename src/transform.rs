use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dataflow::analyzer::MethodContext;
use crate::dataflow::intraprocedural::IntraproceduralResult;
use crate::error::{CpError, malformed_ir};
use crate::hierarchy::{ClassId, ProgramIndex};
use crate::interprocedural::MethodResults;
use crate::ir::{
    BlockId, ControlFlowGraph, EdgeKind, FieldRef, FlowEdge, Instruction, Program, ValueKind,
};
use crate::lattice::ConstantEnvironment;

/// Knobs of the rewriting pass.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TransformOptions {
    pub(crate) replace_moves_with_consts: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            replace_moves_with_consts: true,
        }
    }
}

/// What one method's rewrite changed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct TransformStats {
    pub(crate) branches_removed: usize,
    pub(crate) materialized_consts: usize,
    pub(crate) redundant_puts_removed: usize,
    pub(crate) dead_blocks_removed: usize,
}

impl TransformStats {
    pub(crate) fn is_empty(&self) -> bool {
        *self == TransformStats::default()
    }
}

enum Edit {
    Replace(Instruction),
    Delete,
}

/// Rewrites queued against the original instruction positions and committed
/// in one go once every block has been inspected.
#[derive(Default)]
struct PendingRewrites {
    instructions: BTreeMap<BlockId, BTreeMap<usize, Edit>>,
    removed_edges: Vec<FlowEdge>,
    added_edges: Vec<FlowEdge>,
    /// Blocks whose conditional was dropped; each must end with one goto.
    collapsed: BTreeSet<BlockId>,
}

impl PendingRewrites {
    fn edit(&mut self, block: BlockId, index: usize, edit: Edit) {
        self.instructions.entry(block).or_default().insert(index, edit);
    }

    fn commit(self, cfg: &mut ControlFlowGraph) -> Result<(), CpError> {
        for (id, edits) in self.instructions {
            let block = cfg
                .block_mut(id)
                .ok_or_else(|| malformed_ir!("rewrite of missing block {}", id))?;
            for (index, edit) in edits.into_iter().rev() {
                match edit {
                    Edit::Replace(instruction) => block.instructions[index] = instruction,
                    Edit::Delete => {
                        block.instructions.remove(index);
                    }
                }
            }
        }
        for edge in &self.removed_edges {
            if let Some(position) = cfg.edges.iter().position(|candidate| candidate == edge) {
                cfg.edges.remove(position);
            }
        }
        cfg.edges.extend(self.added_edges);
        for id in self.collapsed {
            let gotos = cfg
                .edges
                .iter()
                .filter(|edge| edge.from == id && edge.kind != EdgeKind::Throw)
                .filter(|edge| edge.kind != EdgeKind::Ghost)
                .count();
            if gotos != 1 {
                return Err(malformed_ir!(
                    "block {} keeps {} successors after its branch was folded",
                    id,
                    gotos
                ));
            }
        }
        Ok(())
    }
}

/// Classes whose `<clinit>` may call out while it still runs. A store into
/// one of their fields from elsewhere could execute before the initialiser
/// has assigned the field, so it is never treated as redundant.
pub(crate) fn classes_calling_out_of_clinit(
    program: &Program,
    index: &ProgramIndex,
    results: &MethodResults,
) -> BTreeSet<ClassId> {
    index
        .class_ids()
        .filter(|class| {
            let Some(clinit) = index.class(*class).clinit else {
                return false;
            };
            let (Some(cfg), Some(result)) = (index.code(program, clinit), results.get(&clinit)) else {
                return true;
            };
            cfg.blocks.iter().any(|block| {
                result.is_reachable(block.id)
                    && block
                        .instructions
                        .iter()
                        .any(|instruction| matches!(instruction, Instruction::Invoke { .. }))
            })
        })
        .collect()
}

struct Rewriter<'a> {
    ctx: MethodContext<'a>,
    result: &'a IntraproceduralResult,
    calling_out: &'a BTreeSet<ClassId>,
    options: &'a TransformOptions,
    pending: PendingRewrites,
    stats: TransformStats,
}

impl Rewriter<'_> {
    fn is_redundant_put(&self, before: &ConstantEnvironment, src: u32, field: &FieldRef) -> bool {
        let Some(field) = self.ctx.index.resolve_field(field) else {
            return false;
        };
        let owner = self.ctx.index.field(field).class;
        let current = if self.ctx.clinit_class == Some(owner) {
            before.field(field)
        } else if self.calling_out.contains(&owner) {
            return false;
        } else {
            self.ctx.whole_program.field_value(field)
        };
        before.get(src).runtime_equals(&current) == Some(true)
    }

    fn exact_after(&self, block: BlockId, index: usize, reg: u32) -> Option<i64> {
        self.result.state_after(block, index).get(reg).get_constant()
    }

    fn materialize(&mut self, block: BlockId, index: usize, dest: u32, literal: i64, kind: ValueKind) {
        self.pending
            .edit(block, index, Edit::Replace(Instruction::Const { dest, literal, kind }));
        self.stats.materialized_consts += 1;
    }

    fn simplify_instructions(&mut self, block: BlockId, instructions: &[Instruction]) {
        for (index, instruction) in instructions.iter().enumerate() {
            match instruction {
                Instruction::Sput { src, field, .. } => {
                    let before = self.result.state_before(block, index);
                    if self.is_redundant_put(&before, *src, field) {
                        debug!("removing redundant store to {}", field);
                        self.pending.edit(block, index, Edit::Delete);
                        self.stats.redundant_puts_removed += 1;
                    }
                }
                Instruction::Move { dest, kind, .. } if self.options.replace_moves_with_consts => {
                    if let Some(literal) = self.exact_after(block, index, *dest) {
                        self.materialize(block, index, *dest, literal, *kind);
                    }
                }
                Instruction::BinopLit {
                    dest: Some(dest), ..
                } => {
                    if let Some(literal) = self.exact_after(block, index, *dest) {
                        self.materialize(block, index, *dest, literal, ValueKind::Int);
                    }
                }
                Instruction::MoveResultPseudo { dest, kind } if index > 0 => {
                    let foldable = matches!(
                        instructions[index - 1],
                        Instruction::Sget { .. }
                            | Instruction::Iget { .. }
                            | Instruction::Aget { .. }
                            | Instruction::BinopLit { dest: None, .. }
                    );
                    if !foldable {
                        continue;
                    }
                    if let Some(literal) = self.exact_after(block, index, *dest) {
                        self.pending.edit(block, index - 1, Edit::Delete);
                        self.materialize(block, index, *dest, literal, *kind);
                    }
                }
                _ => {}
            }
        }
    }

    fn out_edges<'c>(&self, cfg: &'c ControlFlowGraph, block: BlockId) -> Vec<&'c FlowEdge> {
        cfg.edges
            .iter()
            .filter(|edge| edge.from == block && matches!(edge.kind, EdgeKind::Goto | EdgeKind::Branch { .. }))
            .collect()
    }

    fn is_dead(&self, edge: &FlowEdge) -> bool {
        self.result.state_on_edge(edge).is_bottom()
    }

    fn fold_if(&mut self, cfg: &ControlFlowGraph, block: BlockId, index: usize) {
        let edges = self.out_edges(cfg, block);
        let taken = edges.iter().find(|edge| matches!(edge.kind, EdgeKind::Branch { .. }));
        let fall_through = edges.iter().find(|edge| edge.kind == EdgeKind::Goto);
        let (Some(taken), Some(fall_through)) = (taken, fall_through) else {
            return;
        };
        match (self.is_dead(taken), self.is_dead(fall_through)) {
            (true, false) => {
                self.pending.removed_edges.push(**taken);
            }
            (false, true) => {
                self.pending.removed_edges.push(**fall_through);
                self.pending.removed_edges.push(**taken);
                self.pending.added_edges.push(FlowEdge {
                    from: block,
                    to: taken.to,
                    kind: EdgeKind::Goto,
                });
            }
            (true, true) => {
                // Nothing flows past the block, so it keeps no successor.
                self.pending.removed_edges.push(**taken);
                self.pending.removed_edges.push(**fall_through);
                self.drop_terminator(block, index);
                return;
            }
            (false, false) => return,
        }
        debug!("folding branch at end of block {}", block);
        self.pending.edit(block, index, Edit::Delete);
        self.pending.collapsed.insert(block);
        self.stats.branches_removed += 1;
    }

    fn drop_terminator(&mut self, block: BlockId, index: usize) {
        debug!("dropping conditional of block {} that never completes", block);
        self.pending.edit(block, index, Edit::Delete);
        self.stats.branches_removed += 1;
    }

    fn fold_switch(&mut self, cfg: &ControlFlowGraph, block: BlockId, index: usize) {
        let edges = self.out_edges(cfg, block);
        let (dead, live): (Vec<&FlowEdge>, Vec<&FlowEdge>) =
            edges.into_iter().partition(|edge| self.is_dead(edge));
        if dead.is_empty() {
            return;
        }
        if live.is_empty() {
            self.pending.removed_edges.extend(dead.iter().map(|edge| **edge));
            self.drop_terminator(block, index);
            return;
        }
        if let [survivor] = live.as_slice() {
            self.pending.removed_edges.extend(dead.iter().map(|edge| **edge));
            self.pending.removed_edges.push(**survivor);
            self.pending.added_edges.push(FlowEdge {
                from: block,
                to: survivor.to,
                kind: EdgeKind::Goto,
            });
            self.pending.edit(block, index, Edit::Delete);
            self.pending.collapsed.insert(block);
            self.stats.branches_removed += 1;
        } else {
            // The default edge stays even when dead; a switch needs one.
            self.pending.removed_edges.extend(
                dead.iter()
                    .filter(|edge| edge.kind != EdgeKind::Goto)
                    .map(|edge| **edge),
            );
        }
    }
}

/// Rewrite one method body with its final analysis result: fold constants,
/// drop redundant static stores, fold decided branches and delete blocks the
/// analysis proved unreachable. Methods that are never entered are left alone.
pub(crate) fn transform_method(
    ctx: MethodContext<'_>,
    cfg: &mut ControlFlowGraph,
    result: &IntraproceduralResult,
    calling_out: &BTreeSet<ClassId>,
    options: &TransformOptions,
) -> Result<TransformStats, CpError> {
    if !result.is_reachable(cfg.entry) {
        return Ok(TransformStats::default());
    }
    let mut rewriter = Rewriter {
        ctx,
        result,
        calling_out,
        options,
        pending: PendingRewrites::default(),
        stats: TransformStats::default(),
    };
    let mut dead_blocks = BTreeSet::new();
    for block in &cfg.blocks {
        if !result.is_reachable(block.id) {
            if block.id != cfg.entry && Some(block.id) != cfg.exit {
                dead_blocks.insert(block.id);
            }
            continue;
        }
        rewriter.simplify_instructions(block.id, &block.instructions);
        let last = block.instructions.len().saturating_sub(1);
        match block.instructions.last() {
            Some(Instruction::If { .. }) => rewriter.fold_if(cfg, block.id, last),
            Some(Instruction::Switch { .. }) => rewriter.fold_switch(cfg, block.id, last),
            _ => {}
        }
    }
    let Rewriter {
        pending, mut stats, ..
    } = rewriter;
    pending.commit(cfg)?;
    if !dead_blocks.is_empty() {
        debug!("deleting {} unreachable blocks", dead_blocks.len());
        stats.dead_blocks_removed = dead_blocks.len();
        cfg.remove_blocks(&dead_blocks);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::{CallGraph, CallGraphOptions, build_call_graph};
    use crate::cfg::validate_program;
    use crate::dataflow::intraprocedural::analyze_method;
    use crate::hierarchy::MethodId;
    use crate::interprocedural::fixpoint::{CancellationToken, RoundsOutcome, run_rounds};
    use crate::ir::{BinopKind, IfCond};
    use crate::lattice::ConstantValue;
    use crate::test_harness::{
        ClassBuilder, MethodBuilder, ProgramBuilder, if_zero, interpret, invoke_static, konst,
        move_result_pseudo, param, ret, sget, sput,
    };

    struct Analysed {
        index: ProgramIndex,
        call_graph: CallGraph,
        outcome: RoundsOutcome,
    }

    impl Analysed {
        fn new(program: &Program) -> Self {
            let index = ProgramIndex::build(program).expect("index");
            let call_graph = build_call_graph(
                program,
                &index,
                CallGraphOptions {
                    keep_methods_are_entries: true,
                    ..CallGraphOptions::default()
                },
            );
            let outcome = run_rounds(program, &index, &call_graph, 4, &CancellationToken::new(), None)
                .expect("rounds");
            Self {
                index,
                call_graph,
                outcome,
            }
        }

        fn method(&self, class: &str, name: &str) -> MethodId {
            self.index
                .method_ids()
                .find(|method| {
                    let info = self.index.method(*method);
                    info.name == name && self.index.class(info.class).name == class
                })
                .expect("method exists")
        }

        fn result(&self, class: &str, name: &str) -> &IntraproceduralResult {
            &self.outcome.results[&self.method(class, name)]
        }

        fn transform(
            &self,
            program: &mut Program,
            class: &str,
            name: &str,
            options: TransformOptions,
        ) -> TransformStats {
            let method = self.method(class, name);
            let ctx = MethodContext::new(
                &self.index,
                &self.call_graph,
                &self.outcome.whole_program,
                method,
            );
            let calling_out = classes_calling_out_of_clinit(program, &self.index, &self.outcome.results);
            let cfg = self.index.code_mut(program, method).expect("code");
            transform_method(ctx, cfg, &self.outcome.results[&method], &calling_out, &options)
                .expect("transform")
        }
    }

    fn transformed(program: &Program, class: &str, name: &str) -> (Program, TransformStats) {
        let analysed = Analysed::new(program);
        let mut rewritten = program.clone();
        let stats = analysed.transform(&mut rewritten, class, name, TransformOptions::default());
        (rewritten, stats)
    }

    fn body<'p>(program: &'p Program, class: &str, name: &str) -> &'p ControlFlowGraph {
        program
            .classes
            .iter()
            .find(|candidate| candidate.name == class)
            .and_then(|class| class.methods.iter().find(|method| method.name == name))
            .and_then(|method| method.code.as_ref())
            .expect("method body")
    }

    fn caller(name: &str, argument: i64) -> MethodBuilder {
        MethodBuilder::new(name, "()V")
            .keep()
            .instruction(konst(0, argument))
            .instruction(invoke_static("Foo", "baz", "(I)V", vec![0]))
            .returning_void()
    }

    fn program_with(baz: MethodBuilder, arguments: &[i64]) -> Program {
        let mut class = ClassBuilder::new("Foo")
            .method(baz)
            .method(MethodBuilder::new("work", "()V").returning_void());
        for (position, argument) in arguments.iter().enumerate() {
            class = class.method(caller(&format!("bar{position}"), *argument));
        }
        ProgramBuilder::new().class(class).build()
    }

    /// `baz(x) { if (x == 0) return; work(); }`
    fn zero_test_baz() -> MethodBuilder {
        MethodBuilder::new("baz", "(I)V")
            .instruction(param(0))
            .instruction(if_zero(IfCond::Eq, 0))
            .block(1)
            .instruction(Instruction::ReturnVoid)
            .block(2)
            .instruction(invoke_static("Foo", "work", "()V", vec![]))
            .instruction(Instruction::ReturnVoid)
            .branch(0, 1)
            .goto(0, 2)
    }

    /// `if-gtz v1 L; const v0, 0; L: return-void`
    fn positive_test_baz() -> MethodBuilder {
        MethodBuilder::new("baz", "(I)V")
            .instruction(param(1))
            .instruction(if_zero(IfCond::Gt, 1))
            .block(1)
            .instruction(konst(0, 0))
            .block(2)
            .instruction(Instruction::ReturnVoid)
            .branch(0, 2)
            .goto(0, 1)
            .goto(1, 2)
    }

    #[test]
    fn constant_argument_leaves_only_the_return() {
        let program = program_with(zero_test_baz(), &[0]);
        let (rewritten, stats) = transformed(&program, "Foo", "baz");
        let cfg = body(&rewritten, "Foo", "baz");

        assert_eq!(stats.branches_removed, 1);
        assert_eq!(stats.dead_blocks_removed, 1);
        assert!(cfg.block(2).is_none());
        assert_eq!(
            cfg.block(0).expect("entry").instructions,
            vec![param(0)]
        );
        assert_eq!(
            cfg.edges,
            vec![FlowEdge {
                from: 0,
                to: 1,
                kind: EdgeKind::Goto
            }]
        );
    }

    #[test]
    fn mixed_arguments_leave_the_method_unchanged() {
        let program = program_with(zero_test_baz(), &[0, 1]);
        let (rewritten, stats) = transformed(&program, "Foo", "baz");
        assert!(stats.is_empty());
        assert_eq!(
            body(&rewritten, "Foo", "baz").blocks.len(),
            body(&program, "Foo", "baz").blocks.len()
        );
    }

    #[test]
    fn positive_arguments_make_the_branch_always_taken() {
        let program = program_with(positive_test_baz(), &[1, 2]);
        let (rewritten, stats) = transformed(&program, "Foo", "baz");
        let cfg = body(&rewritten, "Foo", "baz");

        assert_eq!(stats.branches_removed, 1);
        assert!(cfg.block(1).is_none());
        assert!(
            cfg.blocks
                .iter()
                .flat_map(|block| block.instructions.iter())
                .all(|instruction| !matches!(instruction, Instruction::Const { .. } | Instruction::If { .. }))
        );
    }

    #[test]
    fn folded_branches_never_hide_a_concrete_path() {
        let program = program_with(positive_test_baz(), &[1, 2]);
        let original = body(&program, "Foo", "baz");
        let (rewritten, _) = transformed(&program, "Foo", "baz");
        let removed: Vec<BlockId> = original
            .blocks
            .iter()
            .map(|block| block.id)
            .filter(|id| body(&rewritten, "Foo", "baz").block(*id).is_none())
            .collect();
        assert_eq!(removed, vec![1]);
        for argument in 1..32 {
            let execution = interpret(original, &[argument]);
            assert!(execution.completed);
            assert!(removed.iter().all(|id| !execution.visited.contains(id)));
        }
    }

    fn constant_field_program(keep_field: bool) -> Program {
        let class = if keep_field {
            ClassBuilder::new("Foo").kept_static_field("qux", "I")
        } else {
            ClassBuilder::new("Foo").static_field("qux", "I", None)
        };
        ProgramBuilder::new()
            .class(
                class
                    .method(
                        MethodBuilder::new("<clinit>", "()V")
                            .instruction(konst(0, 1))
                            .instruction(sput(0, "Foo", "qux", "I"))
                            .returning_void(),
                    )
                    .method(
                        MethodBuilder::new("read", "()I")
                            .keep()
                            .instruction(sget("Foo", "qux", "I"))
                            .instruction(move_result_pseudo(0))
                            .instruction(if_zero(IfCond::Ne, 0))
                            .block(1)
                            .instruction(ret(0))
                            .block(2)
                            .instruction(konst(0, 0))
                            .instruction(ret(0))
                            .branch(0, 1)
                            .goto(0, 2),
                    ),
            )
            .build()
    }

    #[test]
    fn constant_field_read_becomes_a_literal() {
        let program = constant_field_program(false);
        let (rewritten, stats) = transformed(&program, "Foo", "read");
        let cfg = body(&rewritten, "Foo", "read");

        assert_eq!(stats.materialized_consts, 1);
        assert_eq!(stats.branches_removed, 1);
        assert_eq!(cfg.block(0).expect("entry").instructions, vec![konst(0, 1)]);
        assert_eq!(cfg.block(1).expect("return").instructions, vec![ret(0)]);
        assert!(cfg.block(2).is_none());
    }

    #[test]
    fn kept_field_read_is_untouched() {
        let program = constant_field_program(true);
        let (rewritten, stats) = transformed(&program, "Foo", "read");
        assert!(stats.is_empty());
        assert_eq!(
            body(&rewritten, "Foo", "read").block(0).expect("entry").instructions.len(),
            3
        );
    }

    #[test]
    fn materialized_constants_match_the_analysis() {
        let program = ProgramBuilder::new()
            .class(
                ClassBuilder::new("Foo").method(
                    MethodBuilder::new("seven", "()I")
                        .keep()
                        .instruction(konst(0, 3))
                        .instruction(Instruction::BinopLit {
                            op: BinopKind::Add,
                            dest: Some(1),
                            src: 0,
                            literal: 4,
                        })
                        .instruction(Instruction::Move {
                            dest: 2,
                            src: 1,
                            kind: ValueKind::Int,
                        })
                        .instruction(ret(2)),
                ),
            )
            .build();
        let analysed = Analysed::new(&program);
        let result = analysed.result("Foo", "seven");
        let mut rewritten = program.clone();
        let stats = analysed.transform(&mut rewritten, "Foo", "seven", TransformOptions::default());
        assert_eq!(stats.materialized_consts, 2);

        let cfg = body(&rewritten, "Foo", "seven");
        for (index, instruction) in cfg.block(0).expect("entry").instructions.iter().enumerate() {
            if let Instruction::Const { dest, literal, .. } = instruction {
                assert_eq!(result.state_after(0, index).get(*dest), ConstantValue::of_int(*literal));
            }
        }
        assert_eq!(cfg.block(0).expect("entry").instructions[2], konst(2, 7));
    }

    #[test]
    fn moves_stay_when_the_option_is_off() {
        let program = ProgramBuilder::new()
            .class(
                ClassBuilder::new("Foo").method(
                    MethodBuilder::new("copy", "()I")
                        .keep()
                        .instruction(konst(0, 3))
                        .instruction(Instruction::Move {
                            dest: 1,
                            src: 0,
                            kind: ValueKind::Int,
                        })
                        .instruction(ret(1)),
                ),
            )
            .build();
        let analysed = Analysed::new(&program);
        let mut rewritten = program.clone();
        let stats = analysed.transform(
            &mut rewritten,
            "Foo",
            "copy",
            TransformOptions {
                replace_moves_with_consts: false,
            },
        );
        assert!(stats.is_empty());
    }

    fn store_program(clinit_calls_out: bool) -> Program {
        let mut clinit = MethodBuilder::new("<clinit>", "()V");
        if clinit_calls_out {
            clinit = clinit.instruction(invoke_static("Foo", "work", "()V", vec![]));
        }
        ProgramBuilder::new()
            .class(
                ClassBuilder::new("Foo")
                    .static_field("qux", "I", None)
                    .method(
                        clinit
                            .instruction(konst(0, 1))
                            .instruction(sput(0, "Foo", "qux", "I"))
                            .instruction(sput(0, "Foo", "qux", "I"))
                            .returning_void(),
                    )
                    .method(MethodBuilder::new("work", "()V").returning_void())
                    .method(
                        MethodBuilder::new("store", "()V")
                            .keep()
                            .instruction(konst(0, 1))
                            .instruction(sput(0, "Foo", "qux", "I"))
                            .returning_void(),
                    ),
            )
            .build()
    }

    #[test]
    fn stores_of_the_known_value_are_removed() {
        let program = store_program(false);
        let analysed = Analysed::new(&program);
        let mut rewritten = program.clone();
        let in_clinit = analysed.transform(&mut rewritten, "Foo", "<clinit>", TransformOptions::default());
        let elsewhere = analysed.transform(&mut rewritten, "Foo", "store", TransformOptions::default());

        // The first initialiser store changes the default 0, the second does not.
        assert_eq!(in_clinit.redundant_puts_removed, 1);
        assert_eq!(elsewhere.redundant_puts_removed, 1);
        assert_eq!(body(&rewritten, "Foo", "store").block(0).expect("entry").instructions.len(), 2);
    }

    #[test]
    fn stores_are_kept_while_the_initialiser_calls_out() {
        let program = store_program(true);
        let (_, stats) = transformed(&program, "Foo", "store");
        assert_eq!(stats.redundant_puts_removed, 0);
    }

    #[test]
    fn removing_stores_twice_finds_nothing_new() {
        let program = store_program(false);
        let (once, first) = transformed(&program, "Foo", "store");
        assert_eq!(first.redundant_puts_removed, 1);
        let (_, second) = transformed(&once, "Foo", "store");
        assert_eq!(second.redundant_puts_removed, 0);
    }

    #[test]
    fn reanalysis_of_rewritten_code_is_at_least_as_precise() {
        let program = program_with(positive_test_baz(), &[1, 2]);
        let analysed = Analysed::new(&program);
        let method = analysed.method("Foo", "baz");
        let before = &analysed.outcome.results[&method];
        let mut rewritten = program.clone();
        analysed.transform(&mut rewritten, "Foo", "baz", TransformOptions::default());

        let ctx = MethodContext::new(
            &analysed.index,
            &analysed.call_graph,
            &analysed.outcome.whole_program,
            method,
        );
        let cfg = body(&rewritten, "Foo", "baz");
        let after = analyze_method(ctx, cfg, before.arguments()).expect("reanalysis");
        for block in &cfg.blocks {
            assert!(after.entry_state_at(block.id).leq(&before.entry_state_at(block.id)));
        }
        assert!(after.return_value().leq(&before.return_value()));
    }

    #[test]
    fn decided_switch_becomes_a_goto() {
        let switch = MethodBuilder::new("baz", "(I)V")
            .instruction(param(0))
            .instruction(Instruction::Switch { src: 0 })
            .block(1)
            .instruction(Instruction::ReturnVoid)
            .block(2)
            .instruction(invoke_static("Foo", "work", "()V", vec![]))
            .instruction(Instruction::ReturnVoid)
            .block(3)
            .instruction(Instruction::ReturnVoid)
            .case(0, 1, 1)
            .case(0, 2, 2)
            .goto(0, 3);
        let program = program_with(switch, &[2]);
        let (rewritten, stats) = transformed(&program, "Foo", "baz");
        let cfg = body(&rewritten, "Foo", "baz");

        assert_eq!(stats.branches_removed, 1);
        assert_eq!(stats.dead_blocks_removed, 2);
        assert_eq!(
            cfg.edges,
            vec![FlowEdge {
                from: 0,
                to: 2,
                kind: EdgeKind::Goto
            }]
        );
    }

    /// `run() { const v0, 0; spin(); if-eqz v0 -> 1 | 2 }` where `spin` loops forever.
    fn branch_after_spin() -> Program {
        ProgramBuilder::new()
            .class(
                ClassBuilder::new("Foo")
                    .method(
                        MethodBuilder::new("spin", "()V")
                            .instruction(Instruction::Nop)
                            .goto(0, 0),
                    )
                    .method(
                        MethodBuilder::new("run", "()V")
                            .keep()
                            .instruction(konst(0, 0))
                            .instruction(invoke_static("Foo", "spin", "()V", vec![]))
                            .instruction(if_zero(IfCond::Eq, 0))
                            .block(1)
                            .instruction(Instruction::ReturnVoid)
                            .block(2)
                            .instruction(Instruction::ReturnVoid)
                            .branch(0, 1)
                            .goto(0, 2),
                    ),
            )
            .build()
    }

    #[test]
    fn branch_behind_a_call_that_never_returns_is_dropped_with_its_edges() {
        let program = branch_after_spin();
        let (rewritten, stats) = transformed(&program, "Foo", "run");
        let cfg = body(&rewritten, "Foo", "run");

        assert_eq!(stats.branches_removed, 1);
        assert_eq!(stats.dead_blocks_removed, 2);
        assert_eq!(
            cfg.block(0).expect("entry").instructions,
            vec![konst(0, 0), invoke_static("Foo", "spin", "()V", vec![])]
        );
        assert!(cfg.edges.is_empty());
        validate_program(&rewritten).expect("well formed");
    }

    #[test]
    fn switch_behind_a_call_that_never_returns_is_dropped_with_its_edges() {
        let switch = MethodBuilder::new("run", "()V")
            .keep()
            .instruction(konst(0, 1))
            .instruction(invoke_static("Foo", "spin", "()V", vec![]))
            .instruction(Instruction::Switch { src: 0 })
            .block(1)
            .instruction(Instruction::ReturnVoid)
            .block(2)
            .instruction(Instruction::ReturnVoid)
            .case(0, 1, 1)
            .goto(0, 2);
        let program = ProgramBuilder::new()
            .class(
                ClassBuilder::new("Foo")
                    .method(
                        MethodBuilder::new("spin", "()V")
                            .instruction(Instruction::Nop)
                            .goto(0, 0),
                    )
                    .method(switch),
            )
            .build();
        let (rewritten, stats) = transformed(&program, "Foo", "run");
        let cfg = body(&rewritten, "Foo", "run");

        assert_eq!(stats.branches_removed, 1);
        assert!(cfg.edges.is_empty());
        assert!(
            cfg.blocks
                .iter()
                .flat_map(|block| block.instructions.iter())
                .all(|instruction| !matches!(instruction, Instruction::Switch { .. }))
        );
        validate_program(&rewritten).expect("well formed");
    }

    #[test]
    fn unentered_methods_are_not_rewritten() {
        let program = program_with(zero_test_baz(), &[]);
        let analysed = Analysed::new(&program);
        assert!(analysed.result("Foo", "baz").arguments().is_bottom());
        let mut rewritten = program.clone();
        let stats = analysed.transform(&mut rewritten, "Foo", "baz", TransformOptions::default());
        assert!(stats.is_empty());
    }
}
