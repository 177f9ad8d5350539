//! Aggregation and the global verdict
//!
//! Per-unit bisection results and per-cell equivalence outcomes are folded
//! into an [`Aggregate`] of counts. Aggregates combine with
//! [`Aggregate::merge`], which is commutative and associative, so cells can
//! be reduced in any order (and in parallel) with the same result.
//!
//! The global verdict follows a fixed precedence:
//!
//! 1. any FAIL_EQUIV or FAIL_GUARDRAIL → FAIL
//! 2. incomplete experiment matrix → INCOMPLETE
//! 3. only passes and drifts, at least one of each → PASS_WITH_DRIFT
//! 4. only passes, at least one → PASS
//! 5. anything else → INCONCLUSIVE

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bisect::DivergenceResult;
use crate::classify::RootCause;
use crate::completeness::{CompletenessReport, CompletenessStatus};
use crate::equivalence::{AlignmentMode, EquivalenceOutcome, EquivalenceVerdict};
use crate::stage::Stage;

/// How one unit or cell counts toward the global verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitOutcome {
    /// Passed its gate
    Pass,
    /// Measured drift in a drift-expected cell
    Drift,
    /// Equivalence thresholds violated in an equivalent cell
    FailEquiv,
    /// Bisection found a divergence in an equivalent cell
    FailGuardrail,
    /// Not decidable
    Inconclusive,
}

impl UnitOutcome {
    /// Outcome of a bisected unit in a cell of the given mode
    #[must_use]
    pub fn of_divergence(result: &DivergenceResult, alignment: AlignmentMode) -> Self {
        match (result.passed(), alignment) {
            (true, _) => Self::Pass,
            (false, AlignmentMode::DriftExpected) => Self::Drift,
            (false, AlignmentMode::Equivalent) => Self::FailGuardrail,
        }
    }

    /// Outcome of an equivalence verdict
    #[must_use]
    pub fn of_verdict(verdict: EquivalenceVerdict) -> Self {
        match verdict {
            EquivalenceVerdict::PassEquiv => Self::Pass,
            EquivalenceVerdict::ExpectedDrift => Self::Drift,
            EquivalenceVerdict::FailEquiv => Self::FailEquiv,
            EquivalenceVerdict::Inconclusive | EquivalenceVerdict::MissingData => Self::Inconclusive,
        }
    }
}

/// Order-independent counts over units and cells
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Cells folded in
    pub cells: usize,
    /// Bisected units folded in
    pub units: usize,
    /// Units per root cause
    pub by_root_cause: BTreeMap<RootCause, usize>,
    /// Failing units per first-fail stage
    pub by_stage: BTreeMap<Stage, usize>,
    /// Cells per equivalence verdict
    pub by_verdict: BTreeMap<EquivalenceVerdict, usize>,
    /// Units and cells per gating outcome
    pub by_outcome: BTreeMap<UnitOutcome, usize>,
}

fn add<K: Ord>(map: &mut BTreeMap<K, usize>, key: K, n: usize) {
    if n > 0 {
        *map.entry(key).or_insert(0) += n;
    }
}

impl Aggregate {
    /// Empty aggregate for one cell
    #[must_use]
    pub fn cell() -> Self {
        Self {
            cells: 1,
            ..Default::default()
        }
    }

    /// Fold in one bisected unit
    pub fn record_divergence(&mut self, result: &DivergenceResult, alignment: AlignmentMode) {
        self.units += 1;
        add(&mut self.by_root_cause, result.root_cause(), 1);
        if let Some(stage) = result.first_fail_stage() {
            add(&mut self.by_stage, stage, 1);
        }
        add(&mut self.by_outcome, UnitOutcome::of_divergence(result, alignment), 1);
    }

    /// Fold in one cell's equivalence outcome
    pub fn record_equivalence(&mut self, outcome: &EquivalenceOutcome) {
        add(&mut self.by_verdict, outcome.verdict, 1);
        add(&mut self.by_outcome, UnitOutcome::of_verdict(outcome.verdict), 1);
    }

    /// Combine two aggregates
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.cells += other.cells;
        self.units += other.units;
        for (k, n) in other.by_root_cause {
            add(&mut self.by_root_cause, k, n);
        }
        for (k, n) in other.by_stage {
            add(&mut self.by_stage, k, n);
        }
        for (k, n) in other.by_verdict {
            add(&mut self.by_verdict, k, n);
        }
        for (k, n) in other.by_outcome {
            add(&mut self.by_outcome, k, n);
        }
        self
    }

    /// Count of a gating outcome
    #[must_use]
    pub fn outcome(&self, outcome: UnitOutcome) -> usize {
        self.by_outcome.get(&outcome).copied().unwrap_or(0)
    }
}

/// Verdict over the whole experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalVerdict {
    /// Every unit passed
    Pass,
    /// Passes plus acknowledged drift
    PassWithDrift,
    /// At least one gating failure
    Fail,
    /// Experiment matrix has holes
    Incomplete,
    /// Not enough signal
    Inconclusive,
}

impl GlobalVerdict {
    /// Report name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::PassWithDrift => "PASS_WITH_DRIFT",
            Self::Fail => "FAIL",
            Self::Incomplete => "INCOMPLETE",
            Self::Inconclusive => "INCONCLUSIVE",
        }
    }

    /// Process exit code: 0 for PASS and PASS_WITH_DRIFT, 1 otherwise
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Pass | Self::PassWithDrift => 0,
            Self::Fail | Self::Incomplete | Self::Inconclusive => 1,
        }
    }
}

impl fmt::Display for GlobalVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How far a global verdict can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictScope {
    /// Checked against a manifest
    Global,
    /// No manifest; never claims completeness
    BestEffort,
}

impl VerdictScope {
    /// Scope implied by a completeness report
    #[must_use]
    pub fn of(completeness: &CompletenessReport) -> Self {
        match completeness.status {
            CompletenessStatus::Unknown => Self::BestEffort,
            CompletenessStatus::Complete | CompletenessStatus::Incomplete => Self::Global,
        }
    }
}

/// Apply the fixed precedence
#[must_use]
pub fn global_verdict(aggregate: &Aggregate, completeness: &CompletenessReport) -> GlobalVerdict {
    let fails = aggregate.outcome(UnitOutcome::FailEquiv) + aggregate.outcome(UnitOutcome::FailGuardrail);
    if fails > 0 {
        return GlobalVerdict::Fail;
    }
    if completeness.status == CompletenessStatus::Incomplete {
        return GlobalVerdict::Incomplete;
    }
    let pass = aggregate.outcome(UnitOutcome::Pass);
    let drift = aggregate.outcome(UnitOutcome::Drift);
    let inconclusive = aggregate.outcome(UnitOutcome::Inconclusive);
    match (pass > 0, drift > 0, inconclusive > 0) {
        (true, true, false) => GlobalVerdict::PassWithDrift,
        (true, false, false) => GlobalVerdict::Pass,
        _ => GlobalVerdict::Inconclusive,
    }
}
