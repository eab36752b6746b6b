use std::collections::BTreeMap;

use tracing::trace;

use crate::callgraph::InvokeSite;
use crate::cfg::MethodGraph;
use crate::dataflow::analyzer::{
    AnalyzerCoverage, CANONICAL_CHAIN, InstructionAnalyzer, MethodContext, analyze_instruction,
};
use crate::dataflow::branch::{refine_if, refine_switch};
use crate::dataflow::clinit::initial_field_environment;
use crate::dataflow::worklist::{BlockOutcome, FixpointSemantics, solve};
use crate::error::CpError;
use crate::hierarchy::FieldId;
use crate::ir::{BasicBlock, BlockId, ControlFlowGraph, EdgeKind, FlowEdge, Instruction, ValueKind};
use crate::lattice::{
    ArgumentDomain, ArgumentPartition, CallSiteLabel, ConstantEnvironment, ConstantValue,
    Environment,
};

/// Constant-propagation transfer functions for one method body.
struct ConstantSemantics<'a> {
    ctx: MethodContext<'a>,
    chain: &'a [&'a dyn InstructionAnalyzer],
    graph: &'a MethodGraph<'a>,
    initial: ConstantEnvironment,
}

impl ConstantSemantics<'_> {
    /// Case constants of the switch ending `block`, read off its branch edges.
    fn switch_cases(&self, block: &BasicBlock) -> Vec<i64> {
        let Some(position) = self.graph.position(block.id) else {
            return Vec::new();
        };
        self.graph
            .out_edges(position)
            .iter()
            .filter_map(|edge| match self.graph.edge(*edge).kind {
                EdgeKind::Branch { case } => case,
                _ => None,
            })
            .collect()
    }

    /// Run the block and report the state before every instruction.
    fn replay(
        &self,
        block: &BasicBlock,
        entry: &ConstantEnvironment,
        coverage: &mut AnalyzerCoverage,
    ) -> (Vec<ConstantEnvironment>, BlockOutcome<ConstantEnvironment>) {
        let mut env = entry.clone();
        let mut exceptional = ConstantEnvironment::bottom();
        let mut before = Vec::with_capacity(block.instructions.len());
        for (index, instruction) in block.instructions.iter().enumerate() {
            before.push(env.clone());
            if instruction.may_throw() {
                exceptional.join_with(&env);
            }
            analyze_instruction(
                self.chain,
                &self.ctx,
                InvokeSite {
                    block: block.id,
                    index,
                },
                instruction,
                &mut env,
                coverage,
            );
        }
        (
            before,
            BlockOutcome {
                exit: env,
                exceptional,
            },
        )
    }
}

impl FixpointSemantics for ConstantSemantics<'_> {
    type State = ConstantEnvironment;

    fn bottom(&self) -> ConstantEnvironment {
        ConstantEnvironment::bottom()
    }

    fn initial_state(&self) -> ConstantEnvironment {
        self.initial.clone()
    }

    fn join(&self, left: &ConstantEnvironment, right: &ConstantEnvironment) -> ConstantEnvironment {
        left.join(right)
    }

    fn transfer_block(
        &self,
        block: &BasicBlock,
        entry: &ConstantEnvironment,
    ) -> BlockOutcome<ConstantEnvironment> {
        let mut scratch = AnalyzerCoverage::default();
        self.replay(block, entry, &mut scratch).1
    }

    fn transfer_edge(
        &self,
        edge: &FlowEdge,
        block: &BasicBlock,
        outcome: &BlockOutcome<ConstantEnvironment>,
    ) -> ConstantEnvironment {
        let exit = &outcome.exit;
        match (edge.kind, block.instructions.last()) {
            (EdgeKind::Throw, _) => outcome.exceptional.clone(),
            (EdgeKind::Ghost, _) => ConstantEnvironment::bottom(),
            (EdgeKind::Branch { .. }, Some(Instruction::If { cond, left, right })) => {
                refine_if(exit, *cond, *left, *right, true)
            }
            (EdgeKind::Goto, Some(Instruction::If { cond, left, right })) => {
                refine_if(exit, *cond, *left, *right, false)
            }
            (EdgeKind::Branch { case: Some(case) }, Some(Instruction::Switch { src })) => {
                refine_switch(exit, *src, Some(case), &self.switch_cases(block))
            }
            (EdgeKind::Goto, Some(Instruction::Switch { src })) => {
                refine_switch(exit, *src, None, &self.switch_cases(block))
            }
            _ => exit.clone(),
        }
    }
}

/// Fixpoint of one method: read-only snapshots of every block, instruction and
/// edge state, plus the summaries the whole-program layer consumes.
#[derive(Clone, Debug)]
pub(crate) struct IntraproceduralResult {
    positions: BTreeMap<BlockId, usize>,
    entry: Vec<ConstantEnvironment>,
    exit: Vec<ConstantEnvironment>,
    before: Vec<Vec<ConstantEnvironment>>,
    edges: Vec<(FlowEdge, ConstantEnvironment)>,
    arguments: ArgumentDomain,
    return_value: ConstantValue,
    exit_fields: Environment<FieldId>,
    partition: ArgumentPartition,
    coverage: AnalyzerCoverage,
    visits: usize,
}

impl IntraproceduralResult {
    /// State at block entry; Bottom for unreachable or unknown blocks.
    pub(crate) fn entry_state_at(&self, block: BlockId) -> ConstantEnvironment {
        self.positions
            .get(&block)
            .map(|position| self.entry[*position].clone())
            .unwrap_or_else(ConstantEnvironment::bottom)
    }

    pub(crate) fn is_reachable(&self, block: BlockId) -> bool {
        self.positions
            .get(&block)
            .is_some_and(|position| !self.entry[*position].is_bottom())
    }

    pub(crate) fn state_before(&self, block: BlockId, index: usize) -> ConstantEnvironment {
        self.positions
            .get(&block)
            .and_then(|position| self.before[*position].get(index))
            .cloned()
            .unwrap_or_else(ConstantEnvironment::bottom)
    }

    pub(crate) fn state_after(&self, block: BlockId, index: usize) -> ConstantEnvironment {
        let Some(position) = self.positions.get(&block) else {
            return ConstantEnvironment::bottom();
        };
        match self.before[*position].get(index + 1) {
            Some(state) => state.clone(),
            None => self.exit[*position].clone(),
        }
    }

    /// State carried along `edge`. Ghost edges carry no information, so they
    /// report Top even though they contribute nothing to their target.
    pub(crate) fn state_on_edge(&self, edge: &FlowEdge) -> ConstantEnvironment {
        if edge.kind == EdgeKind::Ghost {
            return ConstantEnvironment::top();
        }
        self.edges
            .iter()
            .find(|(candidate, _)| candidate == edge)
            .map(|(_, state)| state.clone())
            .unwrap_or_else(ConstantEnvironment::bottom)
    }

    /// Arguments the method was analysed with.
    pub(crate) fn arguments(&self) -> &ArgumentDomain {
        &self.arguments
    }

    /// Join of every reachable return; Top once a `return-void` is reachable,
    /// Bottom when the method never returns normally.
    pub(crate) fn return_value(&self) -> ConstantValue {
        self.return_value
    }

    /// Class-initialiser field environment joined over reachable returns.
    pub(crate) fn exit_fields(&self) -> &Environment<FieldId> {
        &self.exit_fields
    }

    pub(crate) fn partition(&self) -> &ArgumentPartition {
        &self.partition
    }

    pub(crate) fn coverage(&self) -> &AnalyzerCoverage {
        &self.coverage
    }

    pub(crate) fn visits(&self) -> usize {
        self.visits
    }
}

/// Bind each `load-param` of the entry prologue to its abstract argument.
fn entry_environment(
    ctx: &MethodContext<'_>,
    cfg: &ControlFlowGraph,
    arguments: &ArgumentDomain,
) -> ConstantEnvironment {
    if arguments.is_bottom() {
        return ConstantEnvironment::bottom();
    }
    let mut env = ConstantEnvironment::top();
    if let Some(class) = ctx.clinit_class {
        initial_field_environment(ctx.index, class, &mut env);
    }
    let prologue = cfg
        .block(cfg.entry)
        .into_iter()
        .flat_map(|block| block.instructions.iter())
        .map_while(|instruction| match instruction {
            Instruction::LoadParam { dest, kind } => Some((*dest, *kind)),
            _ => None,
        });
    for (index, (dest, kind)) in prologue.enumerate() {
        let value = arguments.get(index as u32);
        if kind == ValueKind::Wide {
            env.set_wide(dest, value);
        } else {
            env.set(dest, value);
        }
    }
    env
}

/// Run the constant-propagation fixpoint over one method body.
pub(crate) fn analyze_method(
    ctx: MethodContext<'_>,
    cfg: &ControlFlowGraph,
    arguments: &ArgumentDomain,
) -> Result<IntraproceduralResult, CpError> {
    analyze_method_with(&CANONICAL_CHAIN, ctx, cfg, arguments)
}

pub(crate) fn analyze_method_with(
    chain: &[&dyn InstructionAnalyzer],
    ctx: MethodContext<'_>,
    cfg: &ControlFlowGraph,
    arguments: &ArgumentDomain,
) -> Result<IntraproceduralResult, CpError> {
    let graph = MethodGraph::new(cfg)?;
    let semantics = ConstantSemantics {
        ctx,
        chain,
        graph: &graph,
        initial: entry_environment(&ctx, cfg, arguments),
    };
    let states = solve(&graph, &semantics);

    let mut coverage = AnalyzerCoverage::default();
    let mut before = Vec::with_capacity(graph.block_count());
    let mut exit = Vec::with_capacity(graph.block_count());
    let mut return_value = ConstantValue::bottom();
    let mut exit_fields = Environment::bottom();
    let mut partition = ArgumentPartition::bottom();
    partition.set(CallSiteLabel::CurrentFrame, arguments.clone());

    for (position, block) in cfg.blocks.iter().enumerate() {
        let (block_before, outcome) = semantics.replay(block, &states.entry[position], &mut coverage);
        for (index, (instruction, state)) in block.instructions.iter().zip(&block_before).enumerate() {
            if state.is_bottom() {
                continue;
            }
            match instruction {
                Instruction::Return { src, .. } => {
                    return_value = return_value.join(&state.get(*src));
                    exit_fields.join_with(state.fields());
                }
                Instruction::ReturnVoid => {
                    return_value = ConstantValue::top();
                    exit_fields.join_with(state.fields());
                }
                Instruction::Invoke { args, .. } => {
                    let mut domain = ArgumentDomain::top();
                    for (param, reg) in args.iter().enumerate() {
                        domain.set(param as u32, state.get(*reg));
                    }
                    let site = InvokeSite {
                        block: block.id,
                        index,
                    };
                    partition.join_at(CallSiteLabel::Invoke(site), &domain);
                }
                _ => {}
            }
        }
        before.push(block_before);
        exit.push(outcome.exit);
    }

    let edges = cfg
        .edges
        .iter()
        .copied()
        .zip(states.edges.iter().cloned())
        .collect();
    let positions = cfg
        .blocks
        .iter()
        .enumerate()
        .map(|(position, block)| (block.id, position))
        .collect();
    trace!(
        "{}: {} block visits, return {}",
        ctx.index.method_label(ctx.method),
        states.visits,
        return_value
    );
    Ok(IntraproceduralResult {
        positions,
        entry: states.entry,
        exit,
        before,
        edges,
        arguments: arguments.clone(),
        return_value,
        exit_fields,
        partition,
        coverage,
        visits: states.visits,
    })
}
