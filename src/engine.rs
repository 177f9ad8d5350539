//! Analysis engine
//!
//! Takes an already-enumerated experiment (configuration → run A and run B
//! streams), analyzes every cell independently and reduces the results into
//! one [`AnalysisReport`]. Directory walking belongs to the caller.
//!
//! Per cell: load both runs, apply the record filters, pair under the key
//! projection, bisect every logical unit, evaluate equivalence over the
//! selected vector field, and count. Cells are mapped in parallel.
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use bisectar::engine::{analyze, CellStreams, EngineConfig};
//! use bisectar::loader::TraceSource;
//! use bisectar::GlobalVerdict;
//!
//! let line = br#"{"prompt_id":"p0","pos_id":0,"layer":0,"tensor":"attn_out","hash":"aa"}"#.to_vec();
//! let mut input = BTreeMap::new();
//! input.insert(
//!     BTreeMap::new(),
//!     CellStreams::new(
//!         vec![TraceSource::memory("a", line.clone())],
//!         vec![TraceSource::memory("b", line)],
//!     ),
//! );
//! let report = analyze(&input, None, &EngineConfig::default()).unwrap();
//! assert_eq!(report.verdict, GlobalVerdict::Pass);
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aggregate::{global_verdict, Aggregate, VerdictScope};
use crate::bisect::bisect_units;
use crate::completeness::{check, config_label, ConfigKey, ConfigManifest};
use crate::equivalence::{compute_metrics, AlignmentMode, EquivalenceOutcome, Thresholds};
use crate::error::{BisectarError, Result};
use crate::loader::{load_sources, SourceStats, TraceSource};
use crate::pairing::{pair_records, KeyProjection};
use crate::record::{TraceRecord, VectorField};
use crate::report::{AnalysisReport, CellReport, CellStatus};

/// Configuration dimension that carries the alignment flag by default
pub const DEFAULT_ALIGNMENT_DIMENSION: &str = "kv_aligned";

/// Streams of one configuration cell
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellStreams {
    /// Run A (baseline / prefill)
    pub a: Vec<TraceSource>,
    /// Run B (current / decode)
    pub b: Vec<TraceSource>,
}

impl CellStreams {
    /// Cell from both runs' sources
    #[must_use]
    pub fn new(a: Vec<TraceSource>, b: Vec<TraceSource>) -> Self {
        Self { a, b }
    }
}

/// Enumerated experiment: configuration → cell streams
pub type ExperimentInput = BTreeMap<ConfigKey, CellStreams>;

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identity fields used to pair records
    pub projection: KeyProjection,
    /// Equivalence gates
    pub thresholds: Thresholds,
    /// Configuration dimension holding the alignment flag
    pub alignment_dimension: String,
    /// Mode of cells that lack the alignment dimension
    pub default_alignment: AlignmentMode,
    /// Record vector compared for equivalence
    pub vector_field: VectorField,
    /// Only keep records of this layer
    pub layer: Option<i64>,
    /// Only keep records of these stages (empty keeps all)
    pub stages: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            projection: KeyProjection::strict(),
            thresholds: Thresholds::default(),
            alignment_dimension: DEFAULT_ALIGNMENT_DIMENSION.to_string(),
            default_alignment: AlignmentMode::Equivalent,
            vector_field: VectorField::Sample,
            layer: None,
            stages: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse from JSON; absent fields keep their defaults
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| BisectarError::FormatError {
            reason: format!("Invalid engine config: {e}"),
        })
    }

    /// Read from a JSON file
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| BisectarError::IoError {
            message: format!("Failed to read config {}: {e}", path.display()),
        })?;
        Self::from_json(&text)
    }

    /// Set the key projection
    #[must_use]
    pub fn with_projection(mut self, projection: KeyProjection) -> Self {
        self.projection = projection;
        self
    }

    /// Set the thresholds
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Set the alignment dimension name
    #[must_use]
    pub fn with_alignment_dimension(mut self, name: impl Into<String>) -> Self {
        self.alignment_dimension = name.into();
        self
    }

    /// Set the fallback alignment mode
    #[must_use]
    pub fn with_default_alignment(mut self, mode: AlignmentMode) -> Self {
        self.default_alignment = mode;
        self
    }

    /// Set the compared vector field
    #[must_use]
    pub fn with_vector_field(mut self, field: VectorField) -> Self {
        self.vector_field = field;
        self
    }

    /// Restrict to one layer
    #[must_use]
    pub fn with_layer(mut self, layer: Option<i64>) -> Self {
        self.layer = layer;
        self
    }

    /// Restrict to a set of stages
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Alignment mode of a cell
    pub fn alignment_for(&self, config: &ConfigKey) -> Result<AlignmentMode> {
        match config.get(&self.alignment_dimension) {
            None => Ok(self.default_alignment),
            Some(value) => AlignmentMode::parse(value).ok_or_else(|| {
                BisectarError::InvalidConfiguration(format!(
                    "Cell {} has unrecognized {} value '{value}'",
                    config_label(config),
                    self.alignment_dimension
                ))
            }),
        }
    }

    fn keeps(&self, record: &TraceRecord) -> bool {
        if let Some(layer) = self.layer {
            if record.identity().layer != Some(layer) {
                return false;
            }
        }
        self.stages.is_empty()
            || record
                .stage_name()
                .is_some_and(|name| self.stages.iter().any(|s| s.eq_ignore_ascii_case(name)))
    }
}

fn load_filtered(
    sources: &[TraceSource],
    config: &EngineConfig,
) -> Result<(Vec<TraceRecord>, Vec<SourceStats>)> {
    let mut loaded = load_sources(sources)?;
    loaded.records.retain(|r| config.keeps(r));
    Ok((loaded.records, loaded.sources))
}

/// Analyze one configuration cell
pub fn analyze_cell(key: &ConfigKey, streams: &CellStreams, config: &EngineConfig) -> Result<CellReport> {
    let alignment = config.alignment_for(key)?;
    let (a, sources_a) = load_filtered(&streams.a, config)?;
    let (b, sources_b) = load_filtered(&streams.b, config)?;

    let mut cell = CellReport {
        config: key.clone(),
        alignment,
        status: CellStatus::Analyzed,
        sources_a,
        sources_b,
        pairing: Default::default(),
        deltas: Default::default(),
        divergences: Vec::new(),
        equivalence: None,
        aggregate: Aggregate::cell(),
    };
    if a.is_empty() || b.is_empty() {
        debug!(
            cell = %config_label(key),
            records_a = a.len(),
            records_b = b.len(),
            "one-sided cell, skipping comparison"
        );
        cell.status = CellStatus::OneSided;
        return Ok(cell);
    }

    let pairing = pair_records(&a, &b, &config.projection);
    cell.pairing = pairing.summary();
    cell.deltas = pairing.delta_summary();
    cell.divergences = bisect_units(&pairing);

    let field = config.vector_field;
    let carries_vectors = a.iter().chain(&b).any(|r| field.select(r).is_some());
    if carries_vectors {
        let vectors = pairing
            .matched
            .iter()
            .filter_map(|m| Some((field.select(m.a)?, field.select(m.b)?)));
        let metrics = compute_metrics(vectors);
        cell.equivalence = Some(EquivalenceOutcome::new(metrics, alignment, &config.thresholds));
    }

    for result in &cell.divergences {
        cell.aggregate.record_divergence(result, alignment);
    }
    if let Some(outcome) = &cell.equivalence {
        cell.aggregate.record_equivalence(outcome);
    }

    debug!(
        cell = %config_label(key),
        units = cell.divergences.len(),
        failed = cell.failures().count(),
        equivalence = ?cell.equivalence.as_ref().map(|e| e.verdict),
        "analyzed cell"
    );
    Ok(cell)
}

/// Analyze a whole experiment
///
/// Only stream I/O and invalid cell configuration are errors; everything
/// else ends up in the report.
pub fn analyze(
    input: &ExperimentInput,
    manifest: Option<&ConfigManifest>,
    config: &EngineConfig,
) -> Result<AnalysisReport> {
    let entries: Vec<(&ConfigKey, &CellStreams)> = input.iter().collect();
    let cells = entries
        .into_par_iter()
        .map(|(key, streams)| analyze_cell(key, streams, config))
        .collect::<Result<Vec<_>>>()?;

    let aggregate = cells
        .par_iter()
        .map(|c| c.aggregate.clone())
        .reduce(Aggregate::default, Aggregate::merge);

    let found = cells
        .iter()
        .filter(|c| c.status == CellStatus::Analyzed)
        .map(|c| &c.config);
    let completeness = check(manifest, found);
    let verdict = global_verdict(&aggregate, &completeness);
    let scope = VerdictScope::of(&completeness);

    info!(
        cells = cells.len(),
        units = aggregate.units,
        verdict = verdict.name(),
        "analysis complete"
    );

    Ok(AnalysisReport {
        version: crate::VERSION.to_string(),
        thresholds: config.thresholds,
        cells,
        aggregate,
        completeness,
        verdict,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::GlobalVerdict;
    use crate::classify::RootCause;
    use crate::completeness::CompletenessStatus;
    use crate::equivalence::EquivalenceVerdict;
    use crate::stage::Stage;

    fn line(prompt: &str, tensor: &str, hash: &str) -> String {
        format!(
            r#"{{"prompt_id":"{prompt}","pos_id":0,"layer":0,"tensor":"{tensor}","hash":"{hash}"}}"#
        )
    }

    fn source(name: &str, lines: &[String]) -> TraceSource {
        TraceSource::memory(name, lines.join("\n").into_bytes())
    }

    fn key(pairs: &[(&str, &str)]) -> ConfigKey {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn single(a: &[String], b: &[String]) -> ExperimentInput {
        let mut input = ExperimentInput::new();
        input.insert(
            ConfigKey::new(),
            CellStreams::new(vec![source("a", a)], vec![source("b", b)]),
        );
        input
    }

    #[test]
    fn test_identical_runs_pass() {
        let lines: Vec<String> = Stage::ORDER
            .iter()
            .map(|s| line("p0", s.name(), "h"))
            .collect();
        let report = analyze(&single(&lines, &lines), None, &EngineConfig::default()).expect("analyze");
        assert_eq!(report.verdict, GlobalVerdict::Pass);
        assert_eq!(report.scope, VerdictScope::BestEffort);
        assert_eq!(report.cells[0].divergences.len(), 1);
        assert_eq!(report.cells[0].divergences[0].first_fail_stage(), None);
        assert!(report.cells[0].equivalence.is_none());
    }

    #[test]
    fn test_residual_divergence_fails() {
        let a = vec![line("p0", "attn_out", "x"), line("p0", "residual_post_attn", "r1")];
        let b = vec![line("p0", "attn_out", "x"), line("p0", "residual_post_attn", "r2")];
        let report = analyze(&single(&a, &b), None, &EngineConfig::default()).expect("analyze");
        let unit = &report.cells[0].divergences[0];
        assert_eq!(unit.first_fail_stage(), Some(Stage::ResidualPostAttn));
        assert_eq!(unit.root_cause(), RootCause::ResidualAdd);
        assert_eq!(report.verdict, GlobalVerdict::Fail);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_drift_cell_does_not_gate_divergence() {
        let a = vec![line("p0", "mlp_out", "m1")];
        let b = vec![line("p0", "mlp_out", "m2")];
        let mut input = ExperimentInput::new();
        input.insert(
            key(&[("kv_aligned", "0")]),
            CellStreams::new(vec![source("a0", &a)], vec![source("b0", &b)]),
        );
        input.insert(
            key(&[("kv_aligned", "1")]),
            CellStreams::new(vec![source("a1", &a)], vec![source("b1", &a)]),
        );
        let report = analyze(&input, None, &EngineConfig::default()).expect("analyze");
        assert_eq!(report.verdict, GlobalVerdict::PassWithDrift);
    }

    #[test]
    fn test_equivalence_on_samples() {
        let a = vec![r#"{"prompt_id":"p0","layer":0,"tensor":"mlp_out","sample":[0.1,0.5,0.2]}"#.to_string()];
        let b = vec![r#"{"prompt_id":"p0","layer":0,"tensor":"mlp_out","sample":[0.1,0.5,0.2]}"#.to_string()];
        let report = analyze(&single(&a, &b), None, &EngineConfig::default()).expect("analyze");
        let equiv = report.cells[0].equivalence.expect("equivalence");
        assert_eq!(equiv.verdict, EquivalenceVerdict::PassEquiv);
        assert_eq!(report.verdict, GlobalVerdict::Pass);
    }

    #[test]
    fn test_one_sided_cell_is_not_found() {
        let lines = vec![line("p0", "attn_out", "x")];
        let manifest = ConfigManifest::from_json(r#"{"dimensions":[{"name":"seed","values":[0,1]}]}"#)
            .expect("manifest");
        let mut input = ExperimentInput::new();
        input.insert(
            key(&[("seed", "0")]),
            CellStreams::new(vec![source("a", &lines)], vec![source("b", &lines)]),
        );
        input.insert(
            key(&[("seed", "1")]),
            CellStreams::new(vec![source("a", &lines)], Vec::new()),
        );
        let report = analyze(&input, Some(&manifest), &EngineConfig::default()).expect("analyze");
        assert_eq!(report.cells[1].status, CellStatus::OneSided);
        assert_eq!(report.completeness.status, CompletenessStatus::Incomplete);
        assert_eq!(report.verdict, GlobalVerdict::Incomplete);
        assert_eq!(report.scope, VerdictScope::Global);
    }

    #[test]
    fn test_filters_and_bad_alignment_value() {
        let a = vec![line("p0", "attn_out", "x"), line("p0", "logits", "l1")];
        let b = vec![line("p0", "attn_out", "x"), line("p0", "logits", "l2")];
        let config = EngineConfig::default().with_stages(vec!["ATTN_OUT".to_string()]);
        let report = analyze(&single(&a, &b), None, &config).expect("analyze");
        assert_eq!(report.verdict, GlobalVerdict::Pass);

        let config = EngineConfig::default().with_layer(Some(5));
        let report = analyze(&single(&a, &b), None, &config).expect("analyze");
        assert_eq!(report.cells[0].status, CellStatus::OneSided);

        let mut input = ExperimentInput::new();
        input.insert(key(&[("kv_aligned", "maybe")]), CellStreams::default());
        assert!(matches!(
            analyze(&input, None, &EngineConfig::default()),
            Err(BisectarError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_config_from_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{"vector_field":"logits","thresholds":{"max_abs_diff_max":0.01},"projection":["prompt_id","layer","tensor"]}"#,
        )
        .expect("config");
        assert_eq!(config.vector_field, VectorField::Logits);
        assert_eq!(config.thresholds.max_abs_diff_max, 0.01);
        assert_eq!(config.thresholds.p99_abs_diff_max, crate::equivalence::P99_ABS_DIFF_MAX);
        assert_eq!(config.alignment_dimension, DEFAULT_ALIGNMENT_DIMENSION);
        assert_eq!(config.projection.fields().count(), 3);
        assert!(EngineConfig::from_json("[").is_err());
    }
}
