//! Determinism audit over repeated runs
//!
//! Each run is summarized by its final logits record: the top-1 token and a
//! logits digest. All runs are compared pairwise. Bit-identical digests
//! everywhere mean the decode is deterministic; one shared top-1 token with
//! differing digests is numerical jitter; anything else is
//! non-deterministic.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{BisectarError, Result};
use crate::record::TraceRecord;
use crate::stage::Stage;

/// Hex characters kept from a computed SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 16;

/// Verdict of the audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeterminismVerdict {
    /// Bit-identical logits across all runs
    PassDeterministic,
    /// Same top-1 token, differing logits digests
    NumericalJitter,
    /// Top-1 tokens differ
    NonDeterministic,
}

impl DeterminismVerdict {
    /// Report name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PassDeterministic => "PASS_DETERMINISTIC",
            Self::NumericalJitter => "NUMERICAL_JITTER",
            Self::NonDeterministic => "NON_DETERMINISTIC",
        }
    }

    /// Exit code: 0 only for bit-identical runs
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PassDeterministic => 0,
            Self::NumericalJitter | Self::NonDeterministic => 1,
        }
    }
}

impl fmt::Display for DeterminismVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Final-logits summary of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: String,
    /// Top-1 token of the last logits record
    pub top1_token: Option<i64>,
    /// Digest of the last logits record
    pub logits_digest: Option<String>,
}

/// Comparison of two runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairwiseResult {
    /// First run
    pub run_a: String,
    /// Second run
    pub run_b: String,
    /// Top-1 tokens agree
    pub top1_match: bool,
    /// Logits digests agree
    pub digest_match: bool,
}

/// Audit result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismReport {
    /// Per-run summaries, in input order
    pub runs: Vec<RunSummary>,
    /// Every pair `i < j`
    pub pairwise: Vec<PairwiseResult>,
    /// Pairs whose top-1 tokens differ
    pub divergence_count: usize,
    /// Pairs whose digests differ
    pub hash_drift_count: usize,
    /// Distinct top-1 tokens seen
    pub unique_tokens: usize,
    /// Distinct digests seen
    pub unique_digests: usize,
    /// Verdict
    pub verdict: DeterminismVerdict,
}

/// Truncated SHA-256 hex digest of a logits vector
#[must_use]
pub fn logits_digest(logits: &[f64]) -> String {
    let mut hasher = Sha256::new();
    for v in logits {
        hasher.update(v.to_le_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(DIGEST_HEX_LEN)
        .collect()
}

fn is_logits_record(r: &TraceRecord) -> bool {
    r.values().logits.is_some()
        || r.values().topk.is_some()
        || r.stage_name().and_then(Stage::parse) == Some(Stage::Logits)
}

/// Summarize one run by its last logits record
#[must_use]
pub fn summarize_run(run_id: &str, records: &[TraceRecord]) -> RunSummary {
    let last = records.iter().rev().find(|r| is_logits_record(r));
    RunSummary {
        run_id: run_id.to_string(),
        top1_token: last.and_then(TraceRecord::top1_token),
        logits_digest: last.and_then(|r| {
            r.digest()
                .map(str::to_string)
                .or_else(|| r.values().logits.as_deref().map(logits_digest))
        }),
    }
}

/// Audit repeated runs, each given as `(run_id, records)`
pub fn audit(runs: &[(String, Vec<TraceRecord>)]) -> Result<DeterminismReport> {
    if runs.len() < 2 {
        return Err(BisectarError::InvalidConfiguration(format!(
            "Determinism audit needs at least 2 runs, got {}",
            runs.len()
        )));
    }

    let summaries: Vec<RunSummary> = runs
        .iter()
        .map(|(id, records)| summarize_run(id, records))
        .collect();

    let mut pairwise = Vec::new();
    for (i, a) in summaries.iter().enumerate() {
        for b in &summaries[i + 1..] {
            pairwise.push(PairwiseResult {
                run_a: a.run_id.clone(),
                run_b: b.run_id.clone(),
                top1_match: a.top1_token == b.top1_token,
                digest_match: a.logits_digest == b.logits_digest,
            });
        }
    }
    let divergence_count = pairwise.iter().filter(|p| !p.top1_match).count();
    let hash_drift_count = pairwise.iter().filter(|p| !p.digest_match).count();

    let tokens: BTreeSet<Option<i64>> = summaries.iter().map(|s| s.top1_token).collect();
    let digests: BTreeSet<Option<&str>> = summaries
        .iter()
        .map(|s| s.logits_digest.as_deref())
        .collect();
    let unique_tokens = tokens.len();
    let unique_digests = digests.len();

    let verdict = if digests.len() == 1 && !digests.contains(&None) {
        DeterminismVerdict::PassDeterministic
    } else if tokens.len() == 1 && !tokens.contains(&None) {
        DeterminismVerdict::NumericalJitter
    } else {
        DeterminismVerdict::NonDeterministic
    };

    debug!(runs = summaries.len(), pairs = pairwise.len(), "compared runs");
    info!(
        verdict = verdict.name(),
        divergences = divergence_count,
        hash_drifts = hash_drift_count,
        "determinism audit complete"
    );

    Ok(DeterminismReport {
        runs: summaries,
        pairwise,
        divergence_count,
        hash_drift_count,
        unique_tokens,
        unique_digests,
        verdict,
    })
}

impl fmt::Display for DeterminismReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Determinism audit ({} runs) ===", self.runs.len())?;
        for run in &self.runs {
            writeln!(
                f,
                "  {:<16} top1={:<8} digest={}",
                run.run_id,
                run.top1_token.map_or_else(|| "N/A".to_string(), |t| t.to_string()),
                run.logits_digest.as_deref().unwrap_or("N/A"),
            )?;
        }
        writeln!(
            f,
            "Token divergences: {}  Hash drifts: {}",
            self.divergence_count, self.hash_drift_count
        )?;
        write!(f, "VERDICT: {}", self.verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ObservedValues, RecordIdentity, TopK};

    fn logits_rec(hash: Option<&str>, logits: Vec<f64>) -> TraceRecord {
        TraceRecord::new(
            RecordIdentity {
                tensor: Some("logits".to_string()),
                ..Default::default()
            },
            ObservedValues {
                hash: hash.map(str::to_string),
                logits: Some(logits),
                ..Default::default()
            },
        )
    }

    fn run(id: &str, records: Vec<TraceRecord>) -> (String, Vec<TraceRecord>) {
        (id.to_string(), records)
    }

    #[test]
    fn test_needs_two_runs() {
        let err = audit(&[run("r0", vec![])]).unwrap_err();
        assert!(matches!(err, BisectarError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_identical_runs_are_deterministic() {
        let runs: Vec<_> = (0..3)
            .map(|i| run(&format!("r{i}"), vec![logits_rec(None, vec![0.1, 0.9, 0.3])]))
            .collect();
        let report = audit(&runs).expect("audit");
        assert_eq!(report.verdict, DeterminismVerdict::PassDeterministic);
        assert_eq!(report.pairwise.len(), 3);
        assert_eq!(report.hash_drift_count, 0);
        assert_eq!(report.verdict.exit_code(), 0);
    }

    #[test]
    fn test_jitter_same_token_different_digest() {
        let runs = vec![
            run("r0", vec![logits_rec(Some("aaaa"), vec![0.1, 0.9])]),
            run("r1", vec![logits_rec(Some("bbbb"), vec![0.1, 0.9000001])]),
        ];
        let report = audit(&runs).expect("audit");
        assert_eq!(report.verdict, DeterminismVerdict::NumericalJitter);
        assert_eq!(report.hash_drift_count, 1);
        assert_eq!(report.divergence_count, 0);
        assert_eq!(report.unique_tokens, 1);
        assert_eq!(report.unique_digests, 2);
        assert_eq!(report.runs.len(), 2);
    }

    #[test]
    fn test_token_divergence() {
        let runs = vec![
            run("r0", vec![logits_rec(None, vec![0.9, 0.1])]),
            run("r1", vec![logits_rec(None, vec![0.1, 0.9])]),
        ];
        let report = audit(&runs).expect("audit");
        assert_eq!(report.verdict, DeterminismVerdict::NonDeterministic);
        assert_eq!(report.divergence_count, 1);
    }

    #[test]
    fn test_last_logits_record_wins() {
        let records = vec![
            logits_rec(Some("early"), vec![1.0, 0.0]),
            TraceRecord::new(
                RecordIdentity {
                    tensor: Some("mlp_out".to_string()),
                    ..Default::default()
                },
                ObservedValues::default(),
            ),
            TraceRecord::new(
                RecordIdentity::default(),
                ObservedValues {
                    hash: Some("late".to_string()),
                    topk: Some(TopK {
                        top1_id: Some(42),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
        ];
        let summary = summarize_run("r0", &records);
        assert_eq!(summary.top1_token, Some(42));
        assert_eq!(summary.logits_digest.as_deref(), Some("late"));
    }

    #[test]
    fn test_runs_without_logits_are_not_deterministic() {
        let runs = vec![run("r0", vec![]), run("r1", vec![])];
        let report = audit(&runs).expect("audit");
        assert_eq!(report.verdict, DeterminismVerdict::NonDeterministic);
    }

    #[test]
    fn test_computed_digest_shape() {
        let d = logits_digest(&[0.5, -1.0]);
        assert_eq!(d.len(), DIGEST_HEX_LEN);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d, logits_digest(&[0.5, -1.0]));
        assert_ne!(d, logits_digest(&[0.5, -1.0000001]));
    }
}
