use crate::callgraph::InvokeSite;
use crate::dataflow::analyzer::{ApplyOutcome, InstructionAnalyzer, MethodContext};
use crate::hierarchy::{ClassId, FieldId, ProgramIndex};
use crate::ir::{FieldRef, Instruction};
use crate::lattice::{ConstantEnvironment, ConstantValue};

/// Tracks the class's own static fields inside its `<clinit>` through the
/// local field environment, so reads observe in-order assignments instead of
/// the whole-program summary.
pub(crate) struct ClinitFieldAnalyzer;

fn own_static_field(ctx: &MethodContext<'_>, reference: &FieldRef) -> Option<FieldId> {
    let class = ctx.clinit_class?;
    let field = ctx.index.resolve_field(reference)?;
    let info = ctx.index.field(field);
    (info.is_static && info.class == class).then_some(field)
}

impl InstructionAnalyzer for ClinitFieldAnalyzer {
    fn name(&self) -> &'static str {
        "clinit-field"
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
        let Some(field) = own_static_field(ctx, field) else {
            return ApplyOutcome::NotHandled;
        };
        let value = env.field(field);
        env.set_result(value);
        ApplyOutcome::Applied
    }

    fn analyze_sput(
        &self,
        ctx: &MethodContext<'_>,
        instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        let Instruction::Sput { src, field, .. } = instruction else {
            return ApplyOutcome::NotHandled;
        };
        let Some(field) = own_static_field(ctx, field) else {
            return ApplyOutcome::NotHandled;
        };
        let value = env.get(*src);
        env.set_field(field, value);
        ApplyOutcome::Applied
    }

    /// A callee may write the class's fields while it is still initialising.
    /// The invalidation happens even though the invoke itself is passed on.
    fn analyze_invoke(
        &self,
        ctx: &MethodContext<'_>,
        _site: InvokeSite,
        _instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        if let Some(class) = ctx.clinit_class {
            for field in fields_written_elsewhere(ctx.index, class) {
                env.set_field(field, ConstantValue::top());
            }
        }
        ApplyOutcome::NotHandled
    }
}

/// Own static fields with a store outside the class initialiser.
pub(crate) fn fields_written_elsewhere(
    index: &ProgramIndex,
    class: ClassId,
) -> impl Iterator<Item = FieldId> + '_ {
    let clinit = index.class(class).clinit;
    index
        .class(class)
        .fields
        .iter()
        .copied()
        .filter(move |field| {
            index.field(*field).is_static
                && index
                    .writers(*field)
                    .iter()
                    .any(|writer| Some(*writer) != clinit)
        })
}

/// Field environment at `<clinit>` entry: every own static field holds its
/// constant-table value, or the type's zero value when there is none.
pub(crate) fn initial_field_environment(
    index: &ProgramIndex,
    class: ClassId,
    env: &mut ConstantEnvironment,
) {
    for field in &index.class(class).fields {
        let info = index.field(*field);
        if info.is_static {
            env.set_field(*field, info.initial_value);
        }
    }
}
