//! Instrumentation that turns the analysis' assumptions into runtime checks.
//! Each check branches to a block calling a configured handler when the
//! observed value disagrees with the binding the optimiser relied on.

use std::cmp::Reverse;

use tracing::debug;

use crate::callgraph::InvokeSite;
use crate::config::RuntimeAssertHandlers;
use crate::dataflow::analyzer::MethodContext;
use crate::dataflow::intraprocedural::IntraproceduralResult;
use crate::descriptor::TypeCategory;
use crate::error::CpError;
use crate::hierarchy::ProgramIndex;
use crate::ir::{
    BlockId, ControlFlowGraph, EdgeKind, IfCond, Instruction, InvokeKind, MethodRef, Reg,
    ValueKind,
};
use crate::lattice::{ConstantValue, SignInterval};

const PARAM_HANDLER_DESCRIPTOR: &str = "(I)V";
const NAMED_HANDLER_DESCRIPTOR: &str = "(Ljava/lang/String;)V";

/// Static methods called when a check fails.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AssertHandlers {
    pub(crate) param: MethodRef,
    pub(crate) field: MethodRef,
    pub(crate) return_value: MethodRef,
}

impl AssertHandlers {
    /// Resolve the configured `Owner.name(descriptor)` handlers against the
    /// program. Each must be a static method with the expected signature.
    pub(crate) fn resolve(
        configured: &RuntimeAssertHandlers,
        index: &ProgramIndex,
    ) -> Result<Self, CpError> {
        Ok(Self {
            param: resolve_handler(
                "param",
                configured.param.as_deref(),
                PARAM_HANDLER_DESCRIPTOR,
                index,
            )?,
            field: resolve_handler(
                "field",
                configured.field.as_deref(),
                NAMED_HANDLER_DESCRIPTOR,
                index,
            )?,
            return_value: resolve_handler(
                "return",
                configured.return_value.as_deref(),
                NAMED_HANDLER_DESCRIPTOR,
                index,
            )?,
        })
    }
}

fn parse_handler(text: &str) -> Option<MethodRef> {
    let open = text.find('(')?;
    let (owner, name) = text[..open].rsplit_once('.')?;
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some(MethodRef {
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: text[open..].to_string(),
    })
}

fn resolve_handler(
    role: &str,
    text: Option<&str>,
    descriptor: &str,
    index: &ProgramIndex,
) -> Result<MethodRef, CpError> {
    let text = text.ok_or_else(|| {
        CpError::ConfigMissing(format!("runtime asserts need a {role} handler"))
    })?;
    let reference = parse_handler(text).ok_or_else(|| {
        CpError::ConfigMissing(format!("{role} handler `{text}` is not Owner.name(descriptor)"))
    })?;
    if reference.descriptor != descriptor {
        return Err(CpError::ConfigMissing(format!(
            "{role} handler `{text}` must have descriptor {descriptor}"
        )));
    }
    let resolved = index
        .resolve_method(&reference, InvokeKind::Static)
        .filter(|method| index.method(*method).is_static);
    if resolved.is_none() {
        return Err(CpError::ConfigMissing(format!(
            "{role} handler `{text}` is not a static method of the program"
        )));
    }
    Ok(reference)
}

/// What one method's instrumentation added.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct AssertStats {
    pub(crate) asserts_inserted: usize,
    /// Call sites whose callees never return.
    pub(crate) throws: usize,
}

/// Condition under which the checked register agrees with the analysis.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Guard {
    /// The check can never pass; the handler runs unconditionally.
    Never,
    /// `if-<cond>z reg`
    Zero(IfCond),
    /// `const tmp, k; if-eq reg, tmp`
    Equals(i64),
}

#[derive(Clone, Copy, Debug)]
enum Role {
    Param,
    Field,
    Return,
}

#[derive(Clone, Debug)]
enum FailArgument {
    Index(i64),
    Name(String),
}

#[derive(Clone, Debug)]
struct PlannedCheck {
    block: BlockId,
    /// Instruction index the check goes in front of.
    at: usize,
    reg: Reg,
    guard: Guard,
    role: Role,
    argument: FailArgument,
}

fn zero_test(interval: SignInterval) -> Option<IfCond> {
    match interval {
        SignInterval::Ltz => Some(IfCond::Lt),
        SignInterval::Lez => Some(IfCond::Le),
        SignInterval::Eqz => Some(IfCond::Eq),
        SignInterval::Nez => Some(IfCond::Ne),
        SignInterval::Gez => Some(IfCond::Ge),
        SignInterval::Gtz => Some(IfCond::Gt),
        SignInterval::Empty | SignInterval::All => None,
    }
}

/// Test that holds exactly for the values `value` describes. References are
/// only checked for nullness.
fn guard_for(value: ConstantValue, category: TypeCategory) -> Option<Guard> {
    if value.is_top() || value.is_bottom() || !category.is_checkable() {
        return None;
    }
    if category == TypeCategory::Reference {
        return match value.get_interval() {
            SignInterval::Eqz => Some(Guard::Zero(IfCond::Eq)),
            SignInterval::Nez => Some(Guard::Zero(IfCond::Ne)),
            _ => None,
        };
    }
    match value {
        ConstantValue::Exact(0) => Some(Guard::Zero(IfCond::Eq)),
        ConstantValue::Exact(literal) => Some(Guard::Equals(literal)),
        ConstantValue::Interval(interval) => zero_test(interval).map(Guard::Zero),
        _ => None,
    }
}

fn plan_parameter_checks(
    ctx: &MethodContext<'_>,
    cfg: &ControlFlowGraph,
    result: &IntraproceduralResult,
) -> Vec<PlannedCheck> {
    let info = ctx.index.method(ctx.method);
    let receiver = usize::from(!info.is_static);
    let Some(entry) = cfg.block(cfg.entry) else {
        return Vec::new();
    };
    let prologue: Vec<Reg> = entry
        .instructions
        .iter()
        .map_while(|instruction| match instruction {
            Instruction::LoadParam { dest, .. } => Some(*dest),
            _ => None,
        })
        .collect();
    let at = prologue.len();
    prologue
        .iter()
        .enumerate()
        .skip(receiver)
        .filter_map(|(position, reg)| {
            let category = *info.params.get(position - receiver)?;
            let guard = guard_for(result.arguments().get(position as u32), category)?;
            Some(PlannedCheck {
                block: cfg.entry,
                at,
                reg: *reg,
                guard,
                role: Role::Param,
                argument: FailArgument::Index(position as i64),
            })
        })
        .collect()
}

fn plan_body_checks(
    ctx: &MethodContext<'_>,
    cfg: &ControlFlowGraph,
    result: &IntraproceduralResult,
    stats: &mut AssertStats,
) -> Vec<PlannedCheck> {
    let index = ctx.index;
    let mut planned = Vec::new();
    for block in &cfg.blocks {
        if !result.is_reachable(block.id) {
            continue;
        }
        let instructions = &block.instructions;
        for (position, instruction) in instructions.iter().enumerate() {
            let next = instructions.get(position + 1);
            match (instruction, next) {
                (Instruction::Sget { field, .. }, Some(Instruction::MoveResultPseudo { dest, .. })) => {
                    let Some(field) = index.resolve_field(field) else {
                        continue;
                    };
                    let info = index.field(field);
                    if ctx.clinit_class == Some(info.class) {
                        continue;
                    }
                    let value = ctx.whole_program.field_value(field);
                    if let Some(guard) = guard_for(value, info.category) {
                        planned.push(PlannedCheck {
                            block: block.id,
                            at: position + 2,
                            reg: *dest,
                            guard,
                            role: Role::Field,
                            argument: FailArgument::Name(info.name.clone()),
                        });
                    }
                }
                (Instruction::Invoke { kind, method, .. }, next) => {
                    let site = InvokeSite {
                        block: block.id,
                        index: position,
                    };
                    let callees = ctx.call_graph.callees(ctx.method, site);
                    let never_returns = !callees.is_empty()
                        && callees
                            .iter()
                            .all(|callee| ctx.whole_program.return_value(*callee).is_bottom());
                    let moved = match next {
                        Some(Instruction::MoveResult { dest, .. }) => Some(*dest),
                        _ => None,
                    };
                    if never_returns {
                        stats.throws += 1;
                        planned.push(PlannedCheck {
                            block: block.id,
                            at: position + 1 + usize::from(moved.is_some()),
                            reg: 0,
                            guard: Guard::Never,
                            role: Role::Return,
                            argument: FailArgument::Name(method.name.clone()),
                        });
                        continue;
                    }
                    if !matches!(kind, InvokeKind::Direct | InvokeKind::Static) {
                        continue;
                    }
                    let (Some(dest), Some(callee)) = (moved, index.resolve_method(method, *kind))
                    else {
                        continue;
                    };
                    let value = ctx.whole_program.return_value(callee);
                    if let Some(guard) = guard_for(value, index.method(callee).returns) {
                        planned.push(PlannedCheck {
                            block: block.id,
                            at: position + 2,
                            reg: dest,
                            guard,
                            role: Role::Return,
                            argument: FailArgument::Name(method.name.clone()),
                        });
                    }
                }
                _ => {}
            }
        }
    }
    planned
}

fn handler_call(cfg: &mut ControlFlowGraph, check: &PlannedCheck, handlers: &AssertHandlers) -> Vec<Instruction> {
    let reg = cfg.allocate_temp();
    let load = match &check.argument {
        FailArgument::Index(index) => Instruction::Const {
            dest: reg,
            literal: *index,
            kind: ValueKind::Int,
        },
        FailArgument::Name(name) => Instruction::ConstString {
            dest: reg,
            string: name.clone(),
        },
    };
    let handler = match check.role {
        Role::Param => &handlers.param,
        Role::Field => &handlers.field,
        Role::Return => &handlers.return_value,
    };
    vec![
        load,
        Instruction::Invoke {
            kind: InvokeKind::Static,
            method: handler.clone(),
            args: vec![reg],
        },
    ]
}

fn insert_check(
    cfg: &mut ControlFlowGraph,
    check: &PlannedCheck,
    handlers: &AssertHandlers,
) -> Result<(), CpError> {
    let call = handler_call(cfg, check, handlers);
    let test = match check.guard {
        Guard::Never => {
            let block = cfg
                .block_mut(check.block)
                .ok_or_else(|| crate::error::malformed_ir!("no block {} to instrument", check.block))?;
            block.instructions.splice(check.at..check.at, call);
            return Ok(());
        }
        Guard::Zero(cond) => vec![Instruction::If {
            cond,
            left: check.reg,
            right: None,
        }],
        Guard::Equals(literal) => {
            let expected = cfg.allocate_temp();
            vec![
                Instruction::Const {
                    dest: expected,
                    literal,
                    kind: ValueKind::Int,
                },
                Instruction::If {
                    cond: IfCond::Eq,
                    left: check.reg,
                    right: Some(expected),
                },
            ]
        }
    };
    let continuation = cfg.split_block(check.block, check.at)?;
    if let Some(block) = cfg.block_mut(check.block) {
        block.instructions.extend(test);
    }
    for edge in &mut cfg.edges {
        if edge.from == check.block && edge.to == continuation && edge.kind == EdgeKind::Goto {
            edge.kind = EdgeKind::Branch { case: None };
        }
    }
    let failure = cfg.add_block(call);
    cfg.add_edge(check.block, failure, EdgeKind::Goto);
    cfg.add_edge(failure, continuation, EdgeKind::Goto);
    Ok(())
}

/// Instrument one method with checks for every assumption the analysis made
/// about its parameters, static field reads and callee results. Methods the
/// analysis never entered are left alone.
pub(crate) fn inject_asserts(
    ctx: MethodContext<'_>,
    cfg: &mut ControlFlowGraph,
    result: &IntraproceduralResult,
    handlers: &AssertHandlers,
) -> Result<AssertStats, CpError> {
    let mut stats = AssertStats::default();
    if !result.is_reachable(cfg.entry) {
        return Ok(stats);
    }
    let mut planned = plan_parameter_checks(&ctx, cfg, result);
    planned.extend(plan_body_checks(&ctx, cfg, result, &mut stats));
    // Later positions first so earlier insertion points stay valid.
    planned.sort_by_key(|check| (check.block, Reverse(check.at)));
    for check in &planned {
        insert_check(cfg, check, handlers)?;
    }
    stats.asserts_inserted = planned.len();
    if !planned.is_empty() {
        debug!(
            "{}: {} runtime checks",
            ctx.index.method_label(ctx.method),
            planned.len()
        );
    }
    Ok(stats)
}
