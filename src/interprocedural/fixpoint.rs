use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use opentelemetry::{Context as OtelContext, KeyValue};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::callgraph::CallGraph;
use crate::dataflow::analyzer::{AnalyzerCoverage, MethodContext};
use crate::dataflow::intraprocedural::{IntraproceduralResult, analyze_method};
use crate::error::CpError;
use crate::hierarchy::{FieldId, MethodId, ProgramIndex};
use crate::interprocedural::MethodResults;
use crate::interprocedural::instance_fields::initialised_instance_fields;
use crate::interprocedural::whole_program::{WholeProgramState, build_whole_program_state};
use crate::ir::Program;
use crate::lattice::{ArgumentDomain, CallSiteLabel};
use crate::telemetry::{Telemetry, add_current_span_event, with_span};

/// Shared stop flag checked between rounds and between methods.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Final state of the interprocedural fixpoint.
#[derive(Debug)]
pub(crate) struct RoundsOutcome {
    /// The summary the final results were computed against.
    pub(crate) whole_program: WholeProgramState,
    pub(crate) results: MethodResults,
    /// Every summary used as an oracle, starting with the all-Top one.
    pub(crate) history: Vec<WholeProgramState>,
    /// Completed rounds, round 0 included.
    pub(crate) rounds: usize,
    pub(crate) converged: bool,
}

/// Inputs that stay fixed for a whole run.
struct RoundInputs<'a> {
    program: &'a Program,
    index: &'a ProgramIndex,
    call_graph: &'a CallGraph,
    telemetry: Option<&'a Telemetry>,
    token: &'a CancellationToken,
}

/// Join of what every incoming edge passes to `method`. The synthetic entry
/// passes unknown arguments; a caller without a result yet passes nothing.
fn incoming_arguments(
    call_graph: &CallGraph,
    results: &MethodResults,
    method: MethodId,
) -> ArgumentDomain {
    let mut arguments = ArgumentDomain::bottom();
    for edge in call_graph.incoming(method) {
        match (edge.caller, edge.site) {
            (None, _) => return ArgumentDomain::top(),
            (Some(caller), Some(site)) => {
                if let Some(result) = results.get(&caller) {
                    arguments.join_with(&result.partition().get(CallSiteLabel::Invoke(site)));
                }
            }
            (Some(_), None) => {}
        }
    }
    arguments
}

fn analyze_one(
    inputs: &RoundInputs<'_>,
    whole_program: &WholeProgramState,
    method: MethodId,
    arguments: &ArgumentDomain,
    parent: &OtelContext,
) -> Result<Option<IntraproceduralResult>, CpError> {
    if inputs.token.is_cancelled() {
        return Ok(None);
    }
    let Some(cfg) = inputs.index.code(inputs.program, method) else {
        return Ok(None);
    };
    let ctx = MethodContext::new(inputs.index, inputs.call_graph, whole_program, method);
    let run = || analyze_method(ctx, cfg, arguments).map(Some);
    match inputs.telemetry {
        Some(telemetry) => {
            let attributes = [KeyValue::new("ipcp.method", inputs.index.method_label(method))];
            telemetry.in_span_with_parent("method", &attributes, parent, run)
        }
        None => run(),
    }
}

/// Analyse every method against `whole_program`, re-running callees in
/// waves until the arguments flowing along call edges stop changing.
/// Returns `None` when cancelled part-way.
fn analyze_round(
    inputs: &RoundInputs<'_>,
    whole_program: &WholeProgramState,
) -> Result<Option<MethodResults>, CpError> {
    let methods: Vec<MethodId> = inputs
        .index
        .method_ids()
        .filter(|method| inputs.index.code(inputs.program, *method).is_some())
        .collect();
    let mut results = MethodResults::new();
    let mut pending: Vec<MethodId> = methods.clone();
    let mut waves = 0;
    while !pending.is_empty() {
        if inputs.token.is_cancelled() {
            return Ok(None);
        }
        waves += 1;
        let batch: Vec<(MethodId, ArgumentDomain)> = pending
            .iter()
            .map(|method| (*method, incoming_arguments(inputs.call_graph, &results, *method)))
            .collect();
        let parent = OtelContext::current();
        let analysed = batch
            .par_iter()
            .map(|(method, arguments)| {
                analyze_one(inputs, whole_program, *method, arguments, &parent)
                    .map(|result| result.map(|result| (*method, result)))
            })
            .collect::<Result<Vec<_>, CpError>>()?;
        if analysed.len() != batch.len() || analysed.iter().any(Option::is_none) {
            return Ok(None);
        }
        results.extend(analysed.into_iter().flatten());
        pending = methods
            .iter()
            .copied()
            .filter(|method| {
                results.get(method).is_none_or(|result| {
                    result.arguments() != &incoming_arguments(inputs.call_graph, &results, *method)
                })
            })
            .collect();
    }
    let mut coverage = AnalyzerCoverage::default();
    for result in results.values() {
        coverage.merge_from(result.coverage());
    }
    debug!(
        "round settled after {} waves over {} methods; {} of {} instruction visits unhandled",
        waves,
        methods.len(),
        coverage.fallback,
        coverage.total()
    );
    Ok(Some(results))
}

/// Run the interprocedural fixpoint: round 0 against an all-Top summary,
/// then at most `max_rounds` refinements, stopping early once the summary
/// no longer changes.
pub(crate) fn run_rounds(
    program: &Program,
    index: &ProgramIndex,
    call_graph: &CallGraph,
    max_rounds: usize,
    token: &CancellationToken,
    telemetry: Option<&Telemetry>,
) -> Result<RoundsOutcome, CpError> {
    let inputs = RoundInputs {
        program,
        index,
        call_graph,
        telemetry,
        token,
    };
    let initialised: BTreeSet<FieldId> = initialised_instance_fields(program, index)?;

    let mut whole_program = WholeProgramState::top();
    let mut history = vec![whole_program.clone()];
    let round_zero = with_span(telemetry, "round", &[KeyValue::new("ipcp.round", 0)], || {
        analyze_round(&inputs, &whole_program)
    })?;
    let Some(mut results) = round_zero else {
        return Err(CpError::Cancelled);
    };
    let mut rounds = 1;
    let mut converged = false;

    for round in 1..=max_rounds {
        if token.is_cancelled() {
            info!("cancelled before round {}; keeping round {}", round, round - 1);
            break;
        }
        let next = build_whole_program_state(program, index, call_graph, &results, &initialised);
        if next == whole_program {
            info!("converged after {} rounds", rounds);
            converged = true;
            break;
        }
        if !next.leq(&whole_program) {
            warn!("summary of round {} is not a refinement of the previous one", round);
        }
        let attributes = [KeyValue::new("ipcp.round", round as i64)];
        let outcome = with_span(telemetry, "round", &attributes, || {
            let outcome = analyze_round(&inputs, &next);
            add_current_span_event(
                "round finished",
                &[
                    KeyValue::new("ipcp.constant_fields", next.constant_field_count() as i64),
                    KeyValue::new("ipcp.constant_methods", next.constant_method_count() as i64),
                ],
            );
            outcome
        })?;
        match outcome {
            Some(next_results) => {
                whole_program = next;
                results = next_results;
                history.push(whole_program.clone());
                rounds += 1;
            }
            None => {
                info!("round {} cancelled; its partial results are discarded", round);
                break;
            }
        }
    }
    if !converged && !token.is_cancelled() {
        info!("round budget of {} exhausted; keeping the current summary", max_rounds);
    }
    Ok(RoundsOutcome {
        whole_program,
        results,
        history,
        rounds,
        converged,
    })
}
