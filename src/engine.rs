use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::callgraph::{CallGraph, build_call_graph};
use crate::cfg::validate_program;
use crate::config::Config;
use crate::dataflow::analyzer::MethodContext;
use crate::hierarchy::{ClassId, FieldId, MethodId, ProgramIndex};
use crate::interprocedural::MethodResults;
use crate::interprocedural::fixpoint::{CancellationToken, run_rounds};
use crate::interprocedural::whole_program::WholeProgramState;
use crate::ir::{ControlFlowGraph, Program};
use crate::lattice::ConstantValue;
use crate::metrics::Metrics;
use crate::runtime_assert::{AssertHandlers, AssertStats, inject_asserts};
use crate::telemetry::{Telemetry, with_span};
use crate::transform::{TransformOptions, TransformStats, classes_calling_out_of_clinit, transform_method};

/// Wall-clock breakdown of one analysis.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct AnalysisTimings {
    pub(crate) index_duration_ms: u128,
    pub(crate) call_graph_duration_ms: u128,
    pub(crate) rounds_duration_ms: u128,
}

/// Final whole-program summary together with the per-method results it was
/// computed against. Rewrites consult only this snapshot.
pub(crate) struct AnalysisResult {
    index: ProgramIndex,
    call_graph: CallGraph,
    whole_program: WholeProgramState,
    results: MethodResults,
    calling_out: BTreeSet<ClassId>,
    handlers: Option<AssertHandlers>,
    transform_options: TransformOptions,
    rounds: usize,
    converged: bool,
    timings: AnalysisTimings,
}

/// Validate, index and analyse `program` until the summary stops refining or
/// the round budget runs out.
pub(crate) fn analyze(
    program: &Program,
    config: &Config,
    token: &CancellationToken,
    telemetry: Option<&Telemetry>,
) -> Result<AnalysisResult> {
    config.validate()?;
    with_span(telemetry, "validate", &[KeyValue::new("ipcp.phase", "validate")], || {
        validate_program(program)
    })
    .context("invalid input program")?;

    let index_started_at = Instant::now();
    let index = with_span(telemetry, "index", &[KeyValue::new("ipcp.phase", "index")], || {
        ProgramIndex::build(program)
    })
    .context("failed to index program")?;
    let index_duration_ms = index_started_at.elapsed().as_millis();

    let handlers = if config.create_runtime_asserts {
        Some(AssertHandlers::resolve(&config.runtime_assert_handlers, &index)?)
    } else {
        None
    };

    let call_graph_started_at = Instant::now();
    let call_graph = with_span(
        telemetry,
        "call_graph",
        &[KeyValue::new("ipcp.phase", "call_graph")],
        || build_call_graph(program, &index, config.call_graph_options()),
    );
    let call_graph_duration_ms = call_graph_started_at.elapsed().as_millis();
    debug!("call graph has {} edges", call_graph.edges().len());

    let rounds_started_at = Instant::now();
    let outcome = run_rounds(
        program,
        &index,
        &call_graph,
        config.max_heap_analysis_iterations,
        token,
        telemetry,
    )?;
    let rounds_duration_ms = rounds_started_at.elapsed().as_millis();
    for (round, summary) in outcome.history.iter().enumerate() {
        debug!(
            "summary entering round {}: {} constant fields, {} constant methods",
            round,
            summary.constant_field_count(),
            summary.constant_method_count()
        );
    }
    info!(
        "{} constant fields and {} constant methods after {} rounds",
        outcome.whole_program.constant_field_count(),
        outcome.whole_program.constant_method_count(),
        outcome.rounds
    );

    let calling_out = classes_calling_out_of_clinit(program, &index, &outcome.results);
    Ok(AnalysisResult {
        index,
        call_graph,
        whole_program: outcome.whole_program,
        results: outcome.results,
        calling_out,
        handlers,
        transform_options: config.transform_options(),
        rounds: outcome.rounds,
        converged: outcome.converged,
        timings: AnalysisTimings {
            index_duration_ms,
            call_graph_duration_ms,
            rounds_duration_ms,
        },
    })
}

impl AnalysisResult {
    pub(crate) fn field_value(&self, field: FieldId) -> ConstantValue {
        self.whole_program.field_value(field)
    }

    pub(crate) fn return_value(&self, method: MethodId) -> ConstantValue {
        self.whole_program.return_value(method)
    }

    pub(crate) fn rounds(&self) -> usize {
        self.rounds
    }

    pub(crate) fn converged(&self) -> bool {
        self.converged
    }

    pub(crate) fn timings(&self) -> AnalysisTimings {
        self.timings
    }

    pub(crate) fn index(&self) -> &ProgramIndex {
        &self.index
    }

    fn context(&self, method: MethodId) -> MethodContext<'_> {
        MethodContext::new(&self.index, &self.call_graph, &self.whole_program, method)
    }

    /// Apply the constant-propagation rewrites to one method body.
    fn transform_body(&self, method: MethodId, cfg: &mut ControlFlowGraph) -> Result<TransformStats> {
        let Some(result) = self.results.get(&method) else {
            return Ok(TransformStats::default());
        };
        let stats = transform_method(
            self.context(method),
            cfg,
            result,
            &self.calling_out,
            &self.transform_options,
        )
        .with_context(|| format!("failed to transform {}", self.index.method_label(method)))?;
        if !stats.is_empty() {
            debug!("{}: {:?}", self.index.method_label(method), stats);
        }
        Ok(stats)
    }

    /// Instrument one method body with runtime checks of the analysis' claims.
    fn instrument_body(&self, method: MethodId, cfg: &mut ControlFlowGraph) -> Result<AssertStats> {
        let (Some(result), Some(handlers)) = (self.results.get(&method), self.handlers.as_ref()) else {
            return Ok(AssertStats::default());
        };
        inject_asserts(self.context(method), cfg, result, handlers)
            .with_context(|| format!("failed to instrument {}", self.index.method_label(method)))
    }

    /// Rewrite every method body: runtime checks in assert mode, otherwise
    /// the optimising transform. Classes are processed in parallel.
    pub(crate) fn rewrite_program(
        &self,
        program: &mut Program,
        telemetry: Option<&Telemetry>,
    ) -> Result<Metrics> {
        let ids: BTreeMap<(usize, usize), MethodId> = self
            .index
            .method_ids()
            .map(|method| (self.index.method(method).position(), method))
            .collect();
        let phase = if self.handlers.is_some() {
            "runtime_asserts"
        } else {
            "transform"
        };
        let per_class: Vec<Result<Metrics>> = with_span(
            telemetry,
            phase,
            &[KeyValue::new("ipcp.phase", phase)],
            || {
                program
                    .classes
                    .par_iter_mut()
                    .enumerate()
                    .map(|(class_position, class)| -> Result<Metrics> {
                        let mut metrics = Metrics::default();
                        for (method_position, method) in class.methods.iter_mut().enumerate() {
                            let (Some(id), Some(cfg)) =
                                (ids.get(&(class_position, method_position)), method.code.as_mut())
                            else {
                                continue;
                            };
                            if self.handlers.is_some() {
                                metrics.record_asserts(&self.instrument_body(*id, cfg)?);
                            } else {
                                metrics.record_transform(&self.transform_body(*id, cfg)?);
                            }
                        }
                        Ok(metrics)
                    })
                    .collect()
            },
        );
        let mut metrics = Metrics::from_analysis(&self.whole_program, self.rounds);
        for class_metrics in per_class {
            metrics.merge(&class_metrics?);
        }
        info!(
            "{}: {} branches removed, {} constants materialized, {} checks inserted",
            phase, metrics.branches_removed, metrics.materialized_consts, metrics.asserts_inserted
        );
        Ok(metrics)
    }
}
