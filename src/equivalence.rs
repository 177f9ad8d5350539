//! Numerical equivalence evaluator
//!
//! Compares batches of vector pairs (hidden-state samples or logits) and
//! reduces the metrics to one verdict against [`Thresholds`]. Every analysis
//! variant goes through [`evaluate`]; the verdict depends only on the
//! metrics, the cell's [`AlignmentMode`] and the thresholds.
//!
//! Vectors of different length are compared after zero-padding the shorter
//! one. That is lossy on purpose: padded elements are counted and the
//! metrics carry [`MetricsStatus::LengthMismatch`].
//!
//! ```rust
//! use bisectar::equivalence::{compute_metrics, evaluate, AlignmentMode, EquivalenceVerdict, Thresholds};
//!
//! let a = vec![0.1, 0.5, 0.2];
//! let b = vec![0.1, 0.5004, 0.2];
//! let metrics = compute_metrics([(a.as_slice(), b.as_slice())]);
//! let verdict = evaluate(&metrics, AlignmentMode::Equivalent, &Thresholds::default());
//! assert_eq!(verdict, EquivalenceVerdict::PassEquiv);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default ceiling for the 99th-percentile absolute difference
pub const P99_ABS_DIFF_MAX: f64 = 1e-3;
/// Default ceiling for the maximum absolute difference
pub const MAX_ABS_DIFF_MAX: f64 = 5e-3;
/// Default floor for the top-1 agreement ratio
pub const TOP1_AGREEMENT_MIN: f64 = 0.999;

/// Gating thresholds for equivalent cells
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// `p99_abs_diff` must not exceed this
    pub p99_abs_diff_max: f64,
    /// `max_abs_diff` must not exceed this
    pub max_abs_diff_max: f64,
    /// `top1_agreement` must be at least this
    pub top1_agreement_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            p99_abs_diff_max: P99_ABS_DIFF_MAX,
            max_abs_diff_max: MAX_ABS_DIFF_MAX,
            top1_agreement_min: TOP1_AGREEMENT_MIN,
        }
    }
}

impl Thresholds {
    /// Whether all three gates hold for the metrics
    #[must_use]
    pub fn admits(&self, m: &EquivalenceMetrics) -> bool {
        m.p99_abs_diff <= self.p99_abs_diff_max
            && m.max_abs_diff <= self.max_abs_diff_max
            && m.top1_agreement >= self.top1_agreement_min
    }
}

/// Whether a cell's two runs are expected to agree numerically
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMode {
    /// Drift is expected; metrics are recorded but never gate (flag 0)
    DriftExpected,
    /// Runs must be numerically equivalent (flag 1)
    #[default]
    Equivalent,
}

impl AlignmentMode {
    /// Parse a configuration value (`1`/`0`, `true`/`false`, or the mode name)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "equivalent" | "aligned" => Some(Self::Equivalent),
            "0" | "false" | "no" | "drift_expected" | "drift" => Some(Self::DriftExpected),
            _ => None,
        }
    }

    /// Numeric flag as used in configuration directories
    #[must_use]
    pub fn flag(self) -> u8 {
        match self {
            Self::DriftExpected => 0,
            Self::Equivalent => 1,
        }
    }
}

/// Shape status of a metrics batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricsStatus {
    /// All pairs had equal lengths
    #[default]
    Ok,
    /// At least one pair was zero-padded
    LengthMismatch,
    /// Pairs were given but every vector was empty
    Empty,
    /// No pairs at all
    NoPairs,
}

/// Magnitude and agreement metrics of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EquivalenceMetrics {
    /// Vector pairs in the batch
    pub pairs: usize,
    /// Element comparisons after padding
    pub comparisons: usize,
    /// Comparisons against a padding zero
    pub padded_comparisons: usize,
    /// Maximum element-wise absolute difference (NaN counts as infinity)
    pub max_abs_diff: f64,
    /// Exact 99th-percentile absolute difference
    pub p99_abs_diff: f64,
    /// Fraction of pairs whose argmax agrees
    pub top1_agreement: f64,
    /// Mean per-pair cosine similarity
    pub cos_sim_mean: f64,
    /// Shape status
    pub status: MetricsStatus,
}

/// Verdict of one cell's equivalence check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EquivalenceVerdict {
    /// Within every threshold
    PassEquiv,
    /// Outside at least one threshold
    FailEquiv,
    /// Drift-expected cell; not gated
    ExpectedDrift,
    /// Data present but not comparable
    Inconclusive,
    /// Nothing to compare
    MissingData,
}

impl EquivalenceVerdict {
    /// Report name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PassEquiv => "PASS_EQUIV",
            Self::FailEquiv => "FAIL_EQUIV",
            Self::ExpectedDrift => "EXPECTED_DRIFT",
            Self::Inconclusive => "INCONCLUSIVE",
            Self::MissingData => "MISSING_DATA",
        }
    }
}

impl fmt::Display for EquivalenceVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metrics and verdict of one cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquivalenceOutcome {
    /// Alignment mode the verdict was computed under
    pub alignment: AlignmentMode,
    /// Batch metrics
    pub metrics: EquivalenceMetrics,
    /// Verdict
    pub verdict: EquivalenceVerdict,
}

impl EquivalenceOutcome {
    /// Compute the verdict for a metrics batch
    #[must_use]
    pub fn new(metrics: EquivalenceMetrics, alignment: AlignmentMode, thresholds: &Thresholds) -> Self {
        Self {
            alignment,
            metrics,
            verdict: evaluate(&metrics, alignment, thresholds),
        }
    }
}

/// Index of the first maximum, ignoring NaN
#[must_use]
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// Cosine similarity; 0.0 when either vector has zero norm
#[must_use]
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let (mut dot, mut na, mut nb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Index of the 99th percentile in an ascending array of `n` values
///
/// `max(0, min(ceil(0.99 n) - 1, n - 1))`, in integer arithmetic.
#[must_use]
pub fn p99_index(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let ceil = (99 * n).div_ceil(100);
    ceil.saturating_sub(1).min(n - 1)
}

fn abs_diff(x: f64, y: f64) -> f64 {
    let d = (x - y).abs();
    // NaN differences show as infinity
    if d.is_nan() {
        f64::INFINITY
    } else {
        d
    }
}

/// Compute batch metrics over vector pairs
pub fn compute_metrics<'a, I>(pairs: I) -> EquivalenceMetrics
where
    I: IntoIterator<Item = (&'a [f64], &'a [f64])>,
{
    let mut n_pairs = 0usize;
    let mut padded = 0usize;
    let mut diffs: Vec<f64> = Vec::new();
    let mut top1_matches = 0usize;
    let mut cos_sum = 0.0;
    let mut compared = 0usize;

    let mut pa: Vec<f64> = Vec::new();
    let mut pb: Vec<f64> = Vec::new();
    for (a, b) in pairs {
        n_pairs += 1;
        let len = a.len().max(b.len());
        if len == 0 {
            continue;
        }
        padded += len - a.len().min(b.len());

        pa.clear();
        pa.extend_from_slice(a);
        pa.resize(len, 0.0);
        pb.clear();
        pb.extend_from_slice(b);
        pb.resize(len, 0.0);

        diffs.extend(pa.iter().zip(&pb).map(|(&x, &y)| abs_diff(x, y)));
        if argmax(&pa) == argmax(&pb) {
            top1_matches += 1;
        }
        cos_sum += cosine_similarity(&pa, &pb);
        compared += 1;
    }

    let status = if n_pairs == 0 {
        MetricsStatus::NoPairs
    } else if compared == 0 {
        MetricsStatus::Empty
    } else if padded > 0 {
        MetricsStatus::LengthMismatch
    } else {
        MetricsStatus::Ok
    };
    if compared == 0 {
        return EquivalenceMetrics {
            pairs: n_pairs,
            status,
            ..Default::default()
        };
    }

    diffs.sort_unstable_by(f64::total_cmp);
    EquivalenceMetrics {
        pairs: n_pairs,
        comparisons: diffs.len(),
        padded_comparisons: padded,
        max_abs_diff: diffs.last().copied().unwrap_or(0.0),
        p99_abs_diff: diffs[p99_index(diffs.len())],
        top1_agreement: top1_matches as f64 / compared as f64,
        cos_sim_mean: cos_sum / compared as f64,
        status,
    }
}

/// Reduce metrics to a verdict
#[must_use]
pub fn evaluate(
    metrics: &EquivalenceMetrics,
    alignment: AlignmentMode,
    thresholds: &Thresholds,
) -> EquivalenceVerdict {
    match metrics.status {
        MetricsStatus::NoPairs => EquivalenceVerdict::MissingData,
        MetricsStatus::Empty => EquivalenceVerdict::Inconclusive,
        MetricsStatus::Ok | MetricsStatus::LengthMismatch => match alignment {
            AlignmentMode::DriftExpected => EquivalenceVerdict::ExpectedDrift,
            AlignmentMode::Equivalent if thresholds.admits(metrics) => EquivalenceVerdict::PassEquiv,
            AlignmentMode::Equivalent => EquivalenceVerdict::FailEquiv,
        },
    }
}
