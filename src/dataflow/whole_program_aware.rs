use crate::callgraph::InvokeSite;
use crate::dataflow::analyzer::{ApplyOutcome, InstructionAnalyzer, MethodContext};
use crate::dataflow::enum_field::enum_constant;
use crate::ir::Instruction;
use crate::lattice::{ConstantEnvironment, ConstantValue};

/// Answers field reads and call results from the previous round's
/// whole-program state.
pub(crate) struct WholeProgramAwareAnalyzer;

fn publish(env: &mut ConstantEnvironment, value: ConstantValue) -> ApplyOutcome {
    if value.is_top() {
        return ApplyOutcome::NotHandled;
    }
    // Bottom: the value is never produced, so nothing after this point runs.
    env.set_result(value);
    ApplyOutcome::Applied
}

impl InstructionAnalyzer for WholeProgramAwareAnalyzer {
    fn name(&self) -> &'static str {
        "whole-program"
    }

    fn analyze_sget(
        &self,
        ctx: &MethodContext<'_>,
        instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        let Instruction::Sget { field, .. } = instruction else {
            return ApplyOutcome::NotHandled;
        };
        let Some(field) = ctx.index.resolve_field(field) else {
            return ApplyOutcome::NotHandled;
        };
        if !ctx.index.field(field).is_static || enum_constant(ctx.index, field) {
            return ApplyOutcome::NotHandled;
        }
        publish(env, ctx.whole_program.field_value(field))
    }

    fn analyze_iget(
        &self,
        ctx: &MethodContext<'_>,
        instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        let Instruction::Iget { field, .. } = instruction else {
            return ApplyOutcome::NotHandled;
        };
        let Some(field) = ctx.index.resolve_field(field) else {
            return ApplyOutcome::NotHandled;
        };
        if ctx.index.field(field).is_static {
            return ApplyOutcome::NotHandled;
        }
        publish(env, ctx.whole_program.instance_field_value(field))
    }

    fn analyze_invoke(
        &self,
        ctx: &MethodContext<'_>,
        site: InvokeSite,
        _instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        let callees = ctx.call_graph.callees(ctx.method, site);
        if callees.is_empty() {
            return ApplyOutcome::NotHandled;
        }
        let value = callees
            .iter()
            .fold(ConstantValue::bottom(), |joined, callee| {
                joined.join(&ctx.whole_program.return_value(*callee))
            });
        publish(env, value)
    }
}
