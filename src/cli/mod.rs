//! CLI command implementations
//!
//! This module contains all the business logic for CLI commands,
//! extracted from main.rs for testability.

// CLI glue code - relaxed lint requirements
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::case_sensitive_file_extension_comparisons)]

use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};

use crate::completeness::{ConfigKey, ConfigManifest};
use crate::determinism::{audit, DeterminismReport};
use crate::engine::{analyze, CellStreams, EngineConfig, ExperimentInput};
use crate::equivalence::AlignmentMode;
use crate::error::{BisectarError, Result};
use crate::loader::{load_source, TraceSource};
use crate::pairing::{KeyField, KeyProjection};
use crate::record::VectorField;
use crate::report::AnalysisReport;

/// Experiment directory discovery
pub mod discovery;

/// Exit code for environment errors (unreadable input, bad config)
pub const EXIT_ERROR: i32 = 2;

/// Bisectar - first-divergence bisection for paired transformer traces
#[derive(Parser, Debug)]
#[command(name = "bisectar")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: Level,

    /// Shortcut for --log-level debug
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Level the subscriber should be installed with
    #[must_use]
    pub fn effective_log_level(&self) -> Level {
        if self.verbose && self.log_level < Level::DEBUG {
            Level::DEBUG
        } else {
            self.log_level
        }
    }
}

/// Options shared by the analysis commands
#[derive(Args, Debug, Clone, Default)]
pub struct AnalysisArgs {
    /// Engine config JSON; flags below override its values
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write the report here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Vector compared for equivalence (sample, logits)
    #[arg(long)]
    pub vector_field: Option<String>,

    /// Only analyze these stages (comma-separated)
    #[arg(long)]
    pub stages: Option<String>,

    /// Only analyze this layer
    #[arg(long)]
    pub layer: Option<i64>,

    /// Pairing key fields (comma-separated, e.g. prompt_id,layer,tensor)
    #[arg(long)]
    pub key: Option<String>,

    /// Print a text summary instead of JSON
    #[arg(long)]
    pub summary: bool,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bisect two runs given as trace file lists
    ///
    /// Examples:
    ///   bisectar bisect --baseline base.jsonl --current cur.jsonl.gz
    ///   bisectar bisect --baseline prefill.jsonl --current decode.jsonl --cross-phase
    Bisect {
        /// Run A trace files
        #[arg(long, required = true, num_args = 1..)]
        baseline: Vec<PathBuf>,

        /// Run B trace files
        #[arg(long, required = true, num_args = 1..)]
        current: Vec<PathBuf>,

        /// Pair across phases (ignore the phase tag)
        #[arg(long)]
        cross_phase: bool,

        /// Runs are expected to drift; record metrics without gating
        #[arg(long)]
        drift_expected: bool,

        /// Shared analysis options
        #[command(flatten)]
        analysis: AnalysisArgs,
    },
    /// Check an experiment matrix directory against a manifest
    ///
    /// Layout: <traces-dir>/<dim>_<value>/.../{prefill,decode}/*.jsonl[.gz]
    Guardrail {
        /// Root of the experiment directory tree
        #[arg(long, value_name = "DIR")]
        traces_dir: PathBuf,

        /// Config manifest JSON; without it the verdict is best-effort
        #[arg(long, value_name = "FILE")]
        manifest: Option<PathBuf>,

        /// Configuration dimension holding the alignment flag
        #[arg(long)]
        alignment_dimension: Option<String>,

        /// Keep the phase tag in the pairing key (prefill and decode
        /// traces then only pair when their phases agree)
        #[arg(long)]
        keep_phase: bool,

        /// Shared analysis options
        #[command(flatten)]
        analysis: AnalysisArgs,
    },
    /// Compare repeated runs for bit-level determinism
    Determinism {
        /// One trace file per run; the run id is the file stem
        #[arg(required = true, num_args = 2..)]
        runs: Vec<PathBuf>,

        /// Write the report here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Print a text summary instead of JSON
        #[arg(long)]
        summary: bool,
    },
}

/// Engine config from the optional file plus flag overrides
pub fn build_config(args: &AnalysisArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    if let Some(field) = &args.vector_field {
        let field = VectorField::parse(field).ok_or_else(|| {
            BisectarError::InvalidConfiguration(format!("Unknown vector field '{field}'"))
        })?;
        config = config.with_vector_field(field);
    }
    if let Some(stages) = &args.stages {
        let stages = stages
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        config = config.with_stages(stages);
    }
    if args.layer.is_some() {
        config = config.with_layer(args.layer);
    }
    if let Some(key) = &args.key {
        config = config.with_projection(KeyProjection::parse(key)?);
    }
    Ok(config)
}

/// Bisect two flat file lists as a single cell
pub fn run_bisect(
    baseline: &[PathBuf],
    current: &[PathBuf],
    cross_phase: bool,
    drift_expected: bool,
    args: &AnalysisArgs,
) -> Result<AnalysisReport> {
    let mut config = build_config(args)?;
    if cross_phase {
        let projection = config.projection.clone().without(KeyField::Phase);
        config = config.with_projection(projection);
    }
    if drift_expected {
        config = config.with_default_alignment(AlignmentMode::DriftExpected);
    }
    let mut input = ExperimentInput::new();
    input.insert(
        ConfigKey::new(),
        CellStreams::new(
            baseline.iter().cloned().map(TraceSource::File).collect(),
            current.iter().cloned().map(TraceSource::File).collect(),
        ),
    );
    analyze(&input, None, &config)
}

/// Discover an experiment directory and check it
///
/// Run A comes from `prefill/` and run B from `decode/`, so the phase tag is
/// dropped from the pairing key unless `keep_phase` is set.
pub fn run_guardrail(
    traces_dir: &Path,
    manifest: Option<&Path>,
    alignment_dimension: Option<&str>,
    keep_phase: bool,
    args: &AnalysisArgs,
) -> Result<AnalysisReport> {
    let mut config = build_config(args)?;
    if !keep_phase {
        let projection = config.projection.clone().without(KeyField::Phase);
        config = config.with_projection(projection);
    }
    if let Some(dim) = alignment_dimension {
        config = config.with_alignment_dimension(dim);
    }
    let manifest = manifest.map(ConfigManifest::from_path).transpose()?;
    let input = discovery::discover(traces_dir)?;
    info!(cells = input.len(), root = %traces_dir.display(), "discovered experiment");
    analyze(&input, manifest.as_ref(), &config)
}

/// Run id of a trace file: its name without `.jsonl` / `.jsonl.gz`
#[must_use]
pub fn run_id(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    name.trim_end_matches(".gz")
        .trim_end_matches(".jsonl")
        .to_string()
}

/// Load each file as one run and audit them
pub fn run_determinism(runs: &[PathBuf]) -> Result<DeterminismReport> {
    let mut loaded = Vec::with_capacity(runs.len());
    for path in runs {
        let (records, _) = load_source(&TraceSource::file(path))?;
        loaded.push((run_id(path), records));
    }
    audit(&loaded)
}

fn emit<T: Serialize + Display>(value: &T, output: Option<&Path>, summary: bool) -> Result<()> {
    let text = if summary {
        value.to_string()
    } else {
        serde_json::to_string_pretty(value)?
    };
    match output {
        Some(path) => fs::write(path, text + "\n").map_err(|e| BisectarError::IoError {
            message: format!("Failed to write report {}: {e}", path.display()),
        }),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{text}")?;
            Ok(())
        },
    }
}

/// Main CLI entrypoint - dispatches commands and returns the exit code
pub fn entrypoint(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Bisect {
            baseline,
            current,
            cross_phase,
            drift_expected,
            analysis,
        } => {
            let report = run_bisect(&baseline, &current, cross_phase, drift_expected, &analysis)?;
            emit(&report, analysis.output.as_deref(), analysis.summary)?;
            Ok(report.exit_code())
        },
        Commands::Guardrail {
            traces_dir,
            manifest,
            alignment_dimension,
            keep_phase,
            analysis,
        } => {
            let report = run_guardrail(
                &traces_dir,
                manifest.as_deref(),
                alignment_dimension.as_deref(),
                keep_phase,
                &analysis,
            )?;
            emit(&report, analysis.output.as_deref(), analysis.summary)?;
            Ok(report.exit_code())
        },
        Commands::Determinism {
            runs,
            output,
            summary,
        } => {
            let report = run_determinism(&runs)?;
            emit(&report, output.as_deref(), summary)?;
            Ok(report.verdict.exit_code())
        },
    }
}
