use crate::callgraph::InvokeSite;
use crate::dataflow::analyzer::{ApplyOutcome, InstructionAnalyzer, MethodContext};
use crate::ir::Instruction;
use crate::lattice::{ConstantEnvironment, ConstantValue, SignInterval};

const BOOLEAN_CLASS: &str = "java/lang/Boolean";
const BOOLEAN_TYPE: &str = "Ljava/lang/Boolean;";

/// `Boolean.TRUE` and `Boolean.FALSE` are the only boxed booleans the
/// runtime hands out through `valueOf`.
pub(crate) struct BoxedBooleanAnalyzer;

impl InstructionAnalyzer for BoxedBooleanAnalyzer {
    fn name(&self) -> &'static str {
        "boxed-boolean"
    }

    fn analyze_sget(
        &self,
        _ctx: &MethodContext<'_>,
        instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        let Instruction::Sget { field, .. } = instruction else {
            return ApplyOutcome::NotHandled;
        };
        if field.owner != BOOLEAN_CLASS || field.descriptor != BOOLEAN_TYPE {
            return ApplyOutcome::NotHandled;
        }
        let value = match field.name.as_str() {
            "TRUE" => true,
            "FALSE" => false,
            _ => return ApplyOutcome::NotHandled,
        };
        env.set_result(ConstantValue::of_boxed_boolean(value));
        ApplyOutcome::Applied
    }

    fn analyze_invoke(
        &self,
        _ctx: &MethodContext<'_>,
        _site: InvokeSite,
        instruction: &Instruction,
        env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        let Instruction::Invoke { method, args, .. } = instruction else {
            return ApplyOutcome::NotHandled;
        };
        if method.owner != BOOLEAN_CLASS || args.len() != 1 {
            return ApplyOutcome::NotHandled;
        }
        let argument = env.get(args[0]);
        let result = match (method.name.as_str(), method.descriptor.as_str()) {
            ("valueOf", "(Z)Ljava/lang/Boolean;") => {
                let interval = argument.get_interval();
                if argument == ConstantValue::of_int(0) {
                    ConstantValue::of_boxed_boolean(false)
                } else if !interval.is_empty() && interval.leq(SignInterval::Nez) {
                    ConstantValue::of_boxed_boolean(true)
                } else {
                    return ApplyOutcome::NotHandled;
                }
            }
            ("booleanValue", "()Z") => match argument {
                ConstantValue::BoxedBoolean(value) => ConstantValue::of_int(i64::from(value)),
                _ => return ApplyOutcome::NotHandled,
            },
            _ => return ApplyOutcome::NotHandled,
        };
        env.set_result(result);
        ApplyOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::analyzer::{AnalyzerCoverage, CANONICAL_CHAIN, analyze_instruction};
    use crate::ir::InvokeKind;
    use crate::test_harness::{AnalysisFixture, invoke, konst, move_result, move_result_pseudo, sget};

    fn run(instructions: &[Instruction]) -> ConstantEnvironment {
        let fixture = AnalysisFixture::single_static_method();
        let ctx = fixture.context();
        let mut env = ConstantEnvironment::top();
        let mut coverage = AnalyzerCoverage::default();
        for (index, instruction) in instructions.iter().enumerate() {
            analyze_instruction(
                &CANONICAL_CHAIN,
                &ctx,
                InvokeSite { block: 7, index },
                instruction,
                &mut env,
                &mut coverage,
            );
        }
        env
    }

    #[test]
    fn value_of_known_argument_is_a_singleton() {
        let env = run(&[
            konst(0, 1),
            invoke(InvokeKind::Static, BOOLEAN_CLASS, "valueOf", "(Z)Ljava/lang/Boolean;", vec![0]),
            move_result(1),
            sget(BOOLEAN_CLASS, "TRUE", BOOLEAN_TYPE),
            move_result_pseudo(2),
            invoke(InvokeKind::Virtual, BOOLEAN_CLASS, "booleanValue", "()Z", vec![1]),
            move_result(3),
        ]);
        assert_eq!(env.get(1), ConstantValue::of_boxed_boolean(true));
        assert_eq!(env.get(1).runtime_equals(&env.get(2)), Some(true));
        assert_eq!(env.get(3), ConstantValue::of_int(1));
    }

    #[test]
    fn unknown_argument_stays_unknown() {
        let env = run(&[
            invoke(InvokeKind::Static, BOOLEAN_CLASS, "valueOf", "(Z)Ljava/lang/Boolean;", vec![0]),
            move_result(1),
        ]);
        assert!(env.get(1).is_top());
    }
}
