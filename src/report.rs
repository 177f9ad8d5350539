//! Analysis output contract
//!
//! [`AnalysisReport`] is everything a renderer needs: per-cell load
//! statistics, pairing summaries, unit divergences and equivalence
//! outcomes, plus the aggregate, the completeness check and the global
//! verdict. It serializes to JSON; the `Display` impls give a terse text
//! summary for terminals.

use std::fmt;

use serde::Serialize;

use crate::aggregate::{Aggregate, GlobalVerdict, VerdictScope};
use crate::bisect::DivergenceResult;
use crate::completeness::{config_label, CompletenessReport, CompletenessStatus, ConfigKey};
use crate::equivalence::{AlignmentMode, EquivalenceOutcome, Thresholds};
use crate::error::Result;
use crate::loader::SourceStats;
use crate::pairing::{DeltaSummary, PairingSummary};

/// Whether a cell could be analyzed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CellStatus {
    /// Both runs produced records
    Analyzed,
    /// One run produced no records; the cell only counts as not found
    OneSided,
}

/// Results of one configuration cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellReport {
    /// Configuration of the cell
    pub config: ConfigKey,
    /// Alignment mode the cell was gated under
    pub alignment: AlignmentMode,
    /// Analysis status
    pub status: CellStatus,
    /// Run A load statistics
    pub sources_a: Vec<SourceStats>,
    /// Run B load statistics
    pub sources_b: Vec<SourceStats>,
    /// Pairing counts and duplicate keys
    pub pairing: PairingSummary,
    /// Value deltas over matched pairs
    pub deltas: DeltaSummary,
    /// Bisection result per logical unit
    pub divergences: Vec<DivergenceResult>,
    /// Equivalence outcome, when the cell carries comparison vectors
    pub equivalence: Option<EquivalenceOutcome>,
    /// Counts of this cell alone
    pub aggregate: Aggregate,
}

impl CellReport {
    /// Human label of the configuration
    #[must_use]
    pub fn label(&self) -> String {
        config_label(&self.config)
    }

    /// Dropped lines over both runs
    #[must_use]
    pub fn dropped_lines(&self) -> usize {
        self.sources_a
            .iter()
            .chain(&self.sources_b)
            .map(|s| s.dropped)
            .sum()
    }

    /// Units whose bisection failed
    pub fn failures(&self) -> impl Iterator<Item = &DivergenceResult> {
        self.divergences.iter().filter(|d| !d.passed())
    }
}

impl fmt::Display for CellReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let equiv = self
            .equivalence
            .as_ref()
            .map_or_else(|| "-".to_string(), |e| e.verdict.to_string());
        write!(
            f,
            "[{}] mode={} matched={} only_a={} only_b={} units={} failed={} equiv={}",
            self.label(),
            self.alignment.flag(),
            self.pairing.matched,
            self.pairing.only_a,
            self.pairing.only_b,
            self.divergences.len(),
            self.failures().count(),
            equiv,
        )?;
        if self.status == CellStatus::OneSided {
            write!(f, " (one-sided)")?;
        }
        Ok(())
    }
}

/// Complete result of one analysis call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    /// Crate version that produced the report
    pub version: String,
    /// Thresholds used for equivalence gating
    pub thresholds: Thresholds,
    /// Per-cell results, in configuration order
    pub cells: Vec<CellReport>,
    /// Counts over all cells
    pub aggregate: Aggregate,
    /// Completeness guardrail outcome
    pub completeness: CompletenessReport,
    /// Global verdict
    pub verdict: GlobalVerdict,
    /// Verdict scope
    pub scope: VerdictScope,
}

impl AnalysisReport {
    /// Process exit code for the verdict
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    /// Pretty JSON rendering
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Dropped lines over every cell
    #[must_use]
    pub fn dropped_lines(&self) -> usize {
        self.cells.iter().map(CellReport::dropped_lines).sum()
    }
}

impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Trace bisection report ===")?;
        for cell in &self.cells {
            writeln!(f, "  {cell}")?;
            for fail in cell.failures().take(3) {
                writeln!(
                    f,
                    "    first fail {} at {} ({})",
                    fail.unit(),
                    fail.first_fail_stage().map_or("-", |s| s.name()),
                    fail.root_cause(),
                )?;
            }
        }
        if !self.aggregate.by_root_cause.is_empty() {
            writeln!(f, "Root causes:")?;
            for (cause, n) in &self.aggregate.by_root_cause {
                writeln!(f, "  {cause:<22} {n}")?;
            }
        }
        match self.completeness.status {
            CompletenessStatus::Unknown => writeln!(f, "Completeness: UNKNOWN (no manifest)")?,
            CompletenessStatus::Complete => writeln!(
                f,
                "Completeness: COMPLETE ({} configs)",
                self.completeness.expected.len()
            )?,
            CompletenessStatus::Incomplete => {
                writeln!(
                    f,
                    "Completeness: INCOMPLETE ({} of {} missing)",
                    self.completeness.missing_pairs_count,
                    self.completeness.expected.len()
                )?;
                for missing in &self.completeness.missing {
                    writeln!(f, "  missing {}", config_label(missing))?;
                }
            },
        }
        if self.dropped_lines() > 0 {
            writeln!(f, "Dropped lines: {}", self.dropped_lines())?;
        }
        let scope = match self.scope {
            VerdictScope::Global => "global",
            VerdictScope::BestEffort => "best-effort",
        };
        write!(f, "VERDICT: {} ({scope})", self.verdict)
    }
}
