mod callgraph;
mod cfg;
mod config;
mod dataflow;
mod descriptor;
mod engine;
mod error;
mod hierarchy;
mod interprocedural;
mod ir;
mod lattice;
mod metrics;
mod runtime_assert;
mod telemetry;
#[cfg(test)]
mod test_harness;
mod transform;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use tracing::{Level, debug, info, warn};

use crate::config::Config;
use crate::engine::{AnalysisResult, analyze};
use crate::interprocedural::fixpoint::CancellationToken;
use crate::ir::Program;
use crate::metrics::Metrics;
use crate::telemetry::{Telemetry, current_trace_id, init_logging, with_span};

/// CLI arguments for ipcp execution.
#[derive(Parser, Debug)]
#[command(
    name = "ipcp",
    about = "Whole-program interprocedural constant propagation over register-based bytecode.",
    version
)]
struct Cli {
    /// Program to optimise, as JSON.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Where to write the rewritten program; stdout when absent or `-`.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// JSON config file; switches below override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Refinement rounds after the first whole-program pass.
    #[arg(long, value_name = "N")]
    max_heap_analysis_iterations: Option<usize>,
    /// Instrument the program with checks instead of optimising it.
    #[arg(long)]
    runtime_asserts: bool,
    /// Keep register moves even when the moved value is a known constant.
    #[arg(long)]
    no_replace_moves_with_consts: bool,
    /// Link virtual call sites to every override they may dispatch to.
    #[arg(long)]
    multiple_callee_callgraph: bool,
    /// Do not treat kept methods as call graph entry points.
    #[arg(long)]
    no_keep_entries: bool,
    /// Write the metrics report as JSON.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// OTLP/HTTP collector endpoint for trace export.
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
    /// Stop refining after this many seconds and keep the last finished round.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,
    /// Only log warnings and errors.
    #[arg(long)]
    quiet: bool,
    /// Print per-phase durations to stderr when the run finishes.
    #[arg(long)]
    timing: bool,
}

impl Cli {
    /// Config file first, then command-line switches on top of it.
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(iterations) = self.max_heap_analysis_iterations {
            config.max_heap_analysis_iterations = iterations;
        }
        if self.runtime_asserts {
            config.create_runtime_asserts = true;
        }
        if self.no_replace_moves_with_consts {
            config.replace_moves_with_consts = false;
        }
        if self.multiple_callee_callgraph {
            config.use_multiple_callee_callgraph = true;
        }
        if self.no_keep_entries {
            config.keep_methods_are_entries = false;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet);
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }
    let config = cli.config()?;
    let telemetry = cli.otel.as_deref().map(Telemetry::new).transpose()?;

    let outcome = with_span(
        telemetry.as_ref(),
        "ipcp.run",
        &[KeyValue::new("ipcp.input", cli.input.display().to_string())],
        || {
            if let Some(trace_id) = current_trace_id() {
                info!("trace id {trace_id}");
            }
            optimize(&cli, &config, telemetry.as_ref())
        },
    );
    if let Some(telemetry) = telemetry {
        telemetry.shutdown()?;
    }
    outcome
}

fn optimize(cli: &Cli, config: &Config, telemetry: Option<&Telemetry>) -> Result<()> {
    let started_at = Instant::now();
    let mut program = load_program(&cli.input)?;
    let token = CancellationToken::new();
    if let Some(seconds) = cli.timeout {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(seconds));
            token.cancel();
        });
    }
    let analysis = analyze(&program, config, &token, telemetry)?;
    if !analysis.converged() {
        warn!(
            "analysis stopped after {} rounds without reaching a fixpoint",
            analysis.rounds()
        );
    }

    if tracing::enabled!(Level::DEBUG) {
        log_constants(&analysis);
    }

    let rewrite_started_at = Instant::now();
    let metrics = analysis.rewrite_program(&mut program, telemetry)?;
    let rewrite_duration_ms = rewrite_started_at.elapsed().as_millis();

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &program)
        .context("failed to serialize rewritten program")?;
    writer
        .write_all(b"\n")
        .context("failed to write rewritten program")?;
    writer.flush().context("failed to write rewritten program")?;

    if let Some(report) = &cli.report {
        write_report(report, &metrics)?;
    }

    if cli.timing && !cli.quiet {
        let timings = analysis.timings();
        eprintln!(
            "timing: total_ms={} index_ms={} call_graph_ms={} rounds_ms={} rewrite_ms={} rounds={}",
            started_at.elapsed().as_millis(),
            timings.index_duration_ms,
            timings.call_graph_duration_ms,
            timings.rounds_duration_ms,
            rewrite_duration_ms,
            metrics.rounds
        );
    }
    Ok(())
}

/// Dump every field and method the analysis pinned to a single value.
fn log_constants(analysis: &AnalysisResult) {
    let index = analysis.index();
    for field in index.field_ids() {
        if let Some(value) = analysis.field_value(field).get_constant() {
            let info = index.field(field);
            debug!("field {}.{} = {}", index.class(info.class).name, info.name, value);
        }
    }
    for method in index.method_ids() {
        if let Some(value) = analysis.return_value(method).get_constant() {
            debug!("method {} returns {}", index.method_label(method), value);
        }
    }
}

fn load_program(path: &Path) -> Result<Program> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
    serde_path_to_error::deserialize(&mut deserializer)
        .with_context(|| format!("failed to parse program {}", path.display()))
}

fn write_report(path: &Path, metrics: &Metrics) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), metrics)
        .with_context(|| format!("failed to write report {}", path.display()))
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        ))),
        None => Ok(Box::new(io::stdout())),
    }
}
