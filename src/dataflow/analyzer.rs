use std::collections::BTreeMap;

use tracing::debug;

use crate::callgraph::{CallGraph, InvokeSite};
use crate::dataflow::boxed_boolean::BoxedBooleanAnalyzer;
use crate::dataflow::clinit::ClinitFieldAnalyzer;
use crate::dataflow::enum_field::EnumFieldAnalyzer;
use crate::dataflow::primitive::PrimitiveAnalyzer;
use crate::dataflow::whole_program_aware::WholeProgramAwareAnalyzer;
use crate::hierarchy::{ClassId, MethodId, ProgramIndex};
use crate::interprocedural::whole_program::WholeProgramState;
use crate::ir::{Instruction, ValueKind};
use crate::lattice::{ConstantEnvironment, ConstantValue};

/// Result of offering an instruction to one analyzer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum ApplyOutcome {
    Applied,
    NotHandled,
}

/// Everything an analyzer may consult besides the environment.
#[derive(Clone, Copy)]
pub(crate) struct MethodContext<'a> {
    pub(crate) index: &'a ProgramIndex,
    pub(crate) call_graph: &'a CallGraph,
    pub(crate) whole_program: &'a WholeProgramState,
    pub(crate) method: MethodId,
    /// Set while analysing a class initialiser.
    pub(crate) clinit_class: Option<ClassId>,
}

impl<'a> MethodContext<'a> {
    pub(crate) fn new(
        index: &'a ProgramIndex,
        call_graph: &'a CallGraph,
        whole_program: &'a WholeProgramState,
        method: MethodId,
    ) -> Self {
        let info = index.method(method);
        Self {
            index,
            call_graph,
            whole_program,
            method,
            clinit_class: info.is_clinit().then_some(info.class),
        }
    }
}

/// Partial transfer function. Each hook either fully handles the instruction
/// or passes it to the next analyzer in the chain.
pub(crate) trait InstructionAnalyzer: Sync {
    fn name(&self) -> &'static str;

    fn analyze_sget(
        &self,
        _ctx: &MethodContext<'_>,
        _instruction: &Instruction,
        _env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        ApplyOutcome::NotHandled
    }

    fn analyze_sput(
        &self,
        _ctx: &MethodContext<'_>,
        _instruction: &Instruction,
        _env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        ApplyOutcome::NotHandled
    }

    fn analyze_iget(
        &self,
        _ctx: &MethodContext<'_>,
        _instruction: &Instruction,
        _env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        ApplyOutcome::NotHandled
    }

    fn analyze_invoke(
        &self,
        _ctx: &MethodContext<'_>,
        _site: InvokeSite,
        _instruction: &Instruction,
        _env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        ApplyOutcome::NotHandled
    }

    fn analyze_default(
        &self,
        _ctx: &MethodContext<'_>,
        _instruction: &Instruction,
        _env: &mut ConstantEnvironment,
    ) -> ApplyOutcome {
        ApplyOutcome::NotHandled
    }
}

/// The canonical chain. Order matters: own-class static fields inside a class
/// initialiser must never be answered from the whole-program state.
pub(crate) const CANONICAL_CHAIN: [&dyn InstructionAnalyzer; 5] = [
    &ClinitFieldAnalyzer,
    &WholeProgramAwareAnalyzer,
    &EnumFieldAnalyzer,
    &BoxedBooleanAnalyzer,
    &PrimitiveAnalyzer,
];

/// How often each analyzer handled an instruction, and how often nothing did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct AnalyzerCoverage {
    handled: BTreeMap<&'static str, usize>,
    pub(crate) fallback: usize,
}

impl AnalyzerCoverage {
    fn record(&mut self, analyzer: &'static str) {
        *self.handled.entry(analyzer).or_insert(0) += 1;
    }

    pub(crate) fn handled_by(&self, analyzer: &str) -> usize {
        self.handled.get(analyzer).copied().unwrap_or(0)
    }

    pub(crate) fn merge_from(&mut self, other: &AnalyzerCoverage) {
        self.fallback += other.fallback;
        for (analyzer, count) in &other.handled {
            *self.handled.entry(analyzer).or_insert(0) += count;
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.fallback + self.handled.values().sum::<usize>()
    }
}

/// Run `instruction` through `chain`, falling back to forgetting everything it writes.
pub(crate) fn analyze_instruction(
    chain: &[&dyn InstructionAnalyzer],
    ctx: &MethodContext<'_>,
    site: InvokeSite,
    instruction: &Instruction,
    env: &mut ConstantEnvironment,
    coverage: &mut AnalyzerCoverage,
) {
    if env.is_bottom() {
        return;
    }
    for analyzer in chain {
        let outcome = match instruction {
            Instruction::Sget { .. } => analyzer.analyze_sget(ctx, instruction, env),
            Instruction::Sput { .. } => analyzer.analyze_sput(ctx, instruction, env),
            Instruction::Iget { .. } => analyzer.analyze_iget(ctx, instruction, env),
            Instruction::Invoke { .. } => analyzer.analyze_invoke(ctx, site, instruction, env),
            _ => analyzer.analyze_default(ctx, instruction, env),
        };
        if outcome == ApplyOutcome::Applied {
            coverage.record(analyzer.name());
            return;
        }
    }
    coverage.fallback += 1;
    debug!("no analyzer handled {:?}; widening its outputs", instruction);
    forget_outputs(instruction, env);
}

/// Conservative semantics: every register the instruction writes becomes Top.
pub(crate) fn forget_outputs(instruction: &Instruction, env: &mut ConstantEnvironment) {
    if let Some((dest, kind)) = instruction.dest() {
        if kind == ValueKind::Wide {
            env.set_wide(dest, ConstantValue::top());
        } else {
            env.set(dest, ConstantValue::top());
        }
    }
    if instruction.writes_result() {
        env.set_result(ConstantValue::top());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::RESULT_REGISTER;
    use crate::test_harness::{AnalysisFixture, sget};

    struct Unhelpful;

    impl InstructionAnalyzer for Unhelpful {
        fn name(&self) -> &'static str {
            "unhelpful"
        }
    }

    struct ConstantSget;

    impl InstructionAnalyzer for ConstantSget {
        fn name(&self) -> &'static str {
            "constant-sget"
        }

        fn analyze_sget(
            &self,
            _ctx: &MethodContext<'_>,
            _instruction: &Instruction,
            env: &mut ConstantEnvironment,
        ) -> ApplyOutcome {
            env.set_result(ConstantValue::of_int(42));
            ApplyOutcome::Applied
        }
    }

    #[test]
    fn first_applied_analyzer_wins() {
        let fixture = AnalysisFixture::single_static_method();
        let ctx = fixture.context();
        let mut env = ConstantEnvironment::top();
        let mut coverage = AnalyzerCoverage::default();
        let chain: [&dyn InstructionAnalyzer; 2] = [&Unhelpful, &ConstantSget];
        analyze_instruction(
            &chain,
            &ctx,
            InvokeSite { block: 0, index: 0 },
            &sget("Foo", "qux", "I"),
            &mut env,
            &mut coverage,
        );
        assert_eq!(env.get(RESULT_REGISTER), ConstantValue::of_int(42));
        assert_eq!(coverage.handled_by("constant-sget"), 1);
        assert_eq!(coverage.fallback, 0);
    }

    #[test]
    fn fallback_forgets_written_registers() {
        let fixture = AnalysisFixture::single_static_method();
        let ctx = fixture.context();
        let mut env = ConstantEnvironment::top();
        env.set(0, ConstantValue::of_int(1));
        env.set(1, ConstantValue::of_int(2));
        env.set_result(ConstantValue::of_int(3));
        let mut coverage = AnalyzerCoverage::default();
        let chain: [&dyn InstructionAnalyzer; 1] = [&Unhelpful];
        analyze_instruction(
            &chain,
            &ctx,
            InvokeSite { block: 0, index: 0 },
            &Instruction::Move {
                dest: 0,
                src: 1,
                kind: ValueKind::Wide,
            },
            &mut env,
            &mut coverage,
        );
        assert!(env.get(0).is_top());
        assert!(env.get(1).is_top());
        assert_eq!(env.result(), ConstantValue::of_int(3));
        assert_eq!(coverage.fallback, 1);
        assert_eq!(coverage.total(), 1);
    }

    #[test]
    fn bottom_environment_is_left_alone() {
        let fixture = AnalysisFixture::single_static_method();
        let ctx = fixture.context();
        let mut env = ConstantEnvironment::bottom();
        let mut coverage = AnalyzerCoverage::default();
        analyze_instruction(
            &CANONICAL_CHAIN,
            &ctx,
            InvokeSite { block: 0, index: 0 },
            &Instruction::Const {
                dest: 0,
                literal: 1,
                kind: ValueKind::Int,
            },
            &mut env,
            &mut coverage,
        );
        assert!(env.is_bottom());
        assert_eq!(coverage.total(), 0);
    }
}
