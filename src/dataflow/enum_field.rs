use crate::callgraph::InvokeSite;
use crate::dataflow::analyzer::{ApplyOutcome, InstructionAnalyzer, MethodContext};
use crate::hierarchy::{FieldId, ProgramIndex};
use crate::ir::Instruction;
use crate::lattice::{ConstantEnvironment, ConstantValue};

const JAVA_LANG_ENUM: &str = "java/lang/Enum";
const EQUALS: (&str, &str) = ("equals", "(Ljava/lang/Object;)Z");

/// Enum constants are singletons: `sget` of one yields a handle that equals
/// only itself.
pub(crate) struct EnumFieldAnalyzer;

/// Whether `field` is a constant of an enum class (static, typed as the class).
pub(crate) fn enum_constant(index: &ProgramIndex, field: FieldId) -> bool {
    let info = index.field(field);
    let class = index.class(info.class);
    info.is_static && class.is_enum && info.descriptor == format!("L{};", class.name)
}

impl InstructionAnalyzer for EnumFieldAnalyzer {
    fn name(&self) -> &'static str {
        "enum-field"
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
        if !enum_constant(ctx.index, field) {
            return ApplyOutcome::NotHandled;
        }
        env.set_result(ConstantValue::of_enum_field(field));
        ApplyOutcome::Applied
    }

    fn analyze_invoke(
        &self,
        ctx: &MethodContext<'_>,
        _site: InvokeSite,
        instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        let Instruction::Invoke { method, args, .. } = instruction else {
            return ApplyOutcome::NotHandled;
        };
        if (method.name.as_str(), method.descriptor.as_str()) != EQUALS || args.len() != 2 {
            return ApplyOutcome::NotHandled;
        }
        let owner_is_enum = method.owner == JAVA_LANG_ENUM
            || ctx
                .index
                .class_by_name(&method.owner)
                .is_some_and(|class| ctx.index.class(class).is_enum);
        let receiver = env.get(args[0]);
        if !owner_is_enum || !matches!(receiver, ConstantValue::EnumField(_)) {
            return ApplyOutcome::NotHandled;
        }
        match receiver.runtime_equals(&env.get(args[1])) {
            Some(equal) => {
                env.set_result(ConstantValue::of_int(i64::from(equal)));
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::NotHandled,
        }
    }
}
