//! Ordered-stage bisector
//!
//! For one logical unit (a pairing key without its stage) the two runs each
//! contribute a stage → digest map. The scan walks [`Stage::ORDER`] and stops
//! at the first stage where exactly one side has a digest (a tracing offset)
//! or both do and they differ. Stages neither side traced are skipped.
//!
//! ```rust
//! use bisectar::bisect::{first_fail, FailKind, StageDigests};
//! use bisectar::stage::Stage;
//!
//! let mut a = StageDigests::new();
//! let mut b = StageDigests::new();
//! a.insert(Stage::AttnOut, "aa".into());
//! b.insert(Stage::AttnOut, "aa".into());
//! a.insert(Stage::ResidualPostAttn, "bb".into());
//! b.insert(Stage::ResidualPostAttn, "cc".into());
//!
//! let fail = first_fail(&a, &b).unwrap();
//! assert_eq!(fail.stage, Stage::ResidualPostAttn);
//! assert_eq!(fail.kind, FailKind::DigestMismatch);
//! ```

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::classify::{classify_stage, RootCause};
use crate::pairing::{PairKey, PairedRecord, Pairing, Side};
use crate::record::TraceRecord;
use crate::stage::Stage;

/// Stage → digest map of one run for one logical unit
pub type StageDigests = BTreeMap<Stage, String>;

/// Why a stage was reported as the first failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailKind {
    /// Both sides traced the stage with different digests
    DigestMismatch,
    /// Only run B traced the stage
    MissingA,
    /// Only run A traced the stage
    MissingB,
}

/// The first failing stage of a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstFail {
    /// Failing stage
    pub stage: Stage,
    /// Failure kind
    pub kind: FailKind,
    /// Run A digest at the stage
    pub digest_a: Option<String>,
    /// Run B digest at the stage
    pub digest_b: Option<String>,
}

impl FirstFail {
    /// Root cause of this failure
    #[must_use]
    pub fn root_cause(&self) -> RootCause {
        match self.kind {
            FailKind::DigestMismatch => classify_stage(self.stage),
            FailKind::MissingA | FailKind::MissingB => RootCause::TraceOffset,
        }
    }
}

/// Scan both maps in stage order and return the first failure, if any
#[must_use]
pub fn first_fail(a: &StageDigests, b: &StageDigests) -> Option<FirstFail> {
    Stage::ORDER
        .iter()
        .find_map(|&stage| match (a.get(&stage), b.get(&stage)) {
            (None, None) => None,
            (Some(da), Some(db)) if da == db => None,
            (da, db) => Some(FirstFail {
                stage,
                kind: match (da, db) {
                    (Some(_), None) => FailKind::MissingB,
                    (None, Some(_)) => FailKind::MissingA,
                    _ => FailKind::DigestMismatch,
                },
                digest_a: da.cloned(),
                digest_b: db.cloned(),
            }),
        })
}

/// Bisection outcome of one logical unit
///
/// The root cause is derived from the first failure, so it is PASS exactly
/// when no stage failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceResult {
    unit: PairKey,
    first_fail: Option<FirstFail>,
}

impl DivergenceResult {
    /// Bisect one unit
    #[must_use]
    pub fn scan(unit: PairKey, digests: &UnitDigests) -> Self {
        Self {
            unit,
            first_fail: first_fail(&digests.a, &digests.b),
        }
    }

    /// The logical unit
    #[must_use]
    pub fn unit(&self) -> &PairKey {
        &self.unit
    }

    /// Details of the first failure
    #[must_use]
    pub fn first_fail(&self) -> Option<&FirstFail> {
        self.first_fail.as_ref()
    }

    /// First failing stage
    #[must_use]
    pub fn first_fail_stage(&self) -> Option<Stage> {
        self.first_fail.as_ref().map(|f| f.stage)
    }

    /// Root cause; [`RootCause::Pass`] when nothing failed
    #[must_use]
    pub fn root_cause(&self) -> RootCause {
        self.first_fail
            .as_ref()
            .map_or(RootCause::Pass, FirstFail::root_cause)
    }

    /// True when every traced stage matched
    #[must_use]
    pub fn passed(&self) -> bool {
        self.first_fail.is_none()
    }
}

impl Serialize for DivergenceResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fail = self.first_fail.as_ref();
        let mut s = serializer.serialize_struct("DivergenceResult", 6)?;
        s.serialize_field("unit", &self.unit)?;
        s.serialize_field("first_fail_stage", &self.first_fail_stage())?;
        s.serialize_field("root_cause", &self.root_cause())?;
        s.serialize_field("fail_kind", &fail.map(|f| f.kind))?;
        s.serialize_field("digest_a", &fail.and_then(|f| f.digest_a.as_deref()))?;
        s.serialize_field("digest_b", &fail.and_then(|f| f.digest_b.as_deref()))?;
        s.end()
    }
}

/// Both runs' stage digests for one unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitDigests {
    /// Run A
    pub a: StageDigests,
    /// Run B
    pub b: StageDigests,
}

impl UnitDigests {
    fn insert(&mut self, side: Side, record: &TraceRecord) {
        let (Some(stage), Some(digest)) = (record.stage_name().and_then(Stage::parse), record.digest())
        else {
            return;
        };
        let map = match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        };
        map.entry(stage).or_insert_with(|| digest.to_string());
    }
}

/// Group paired records into logical units
///
/// Only records with a known stage and a digest contribute. Units come out
/// sorted by key.
#[must_use]
pub fn collect_units(pairing: &Pairing<'_>) -> BTreeMap<PairKey, UnitDigests> {
    let mut units: BTreeMap<PairKey, UnitDigests> = BTreeMap::new();
    for paired in pairing.iter() {
        match paired {
            PairedRecord::Matched(m) => {
                let unit = units.entry(m.key.unit()).or_default();
                unit.insert(Side::A, m.a);
                unit.insert(Side::B, m.b);
            },
            PairedRecord::MissingOtherSide(u) => {
                units.entry(u.key.unit()).or_default().insert(u.side, u.record);
            },
        }
    }
    units.retain(|_, d| !d.a.is_empty() || !d.b.is_empty());
    units
}

/// Bisect every unit of a pairing, in unit key order
#[must_use]
pub fn bisect_units(pairing: &Pairing<'_>) -> Vec<DivergenceResult> {
    collect_units(pairing)
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(unit, digests)| DivergenceResult::scan(unit, &digests))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::{pair_records, KeyProjection};
    use crate::record::{ObservedValues, RecordIdentity};

    fn digests(entries: &[(Stage, &str)]) -> StageDigests {
        entries.iter().map(|(s, d)| (*s, d.to_string())).collect()
    }

    fn rec(prompt: &str, tensor: &str, hash: &str) -> TraceRecord {
        TraceRecord::new(
            RecordIdentity {
                prompt_id: Some(prompt.to_string()),
                pos_id: Some(0),
                layer: Some(0),
                tensor: Some(tensor.to_string()),
                ..Default::default()
            },
            ObservedValues {
                hash: Some(hash.to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_all_equal_passes() {
        let a = digests(&[(Stage::EmbedOut, "e"), (Stage::Logits, "l")]);
        assert!(first_fail(&a, &a.clone()).is_none());
        assert!(first_fail(&StageDigests::new(), &StageDigests::new()).is_none());
    }

    #[test]
    fn test_first_mismatch_wins_over_later() {
        let a = digests(&[
            (Stage::AttnIn, "x"),
            (Stage::MlpOut, "m1"),
            (Stage::Logits, "l1"),
        ]);
        let b = digests(&[
            (Stage::AttnIn, "x"),
            (Stage::MlpOut, "m2"),
            (Stage::Logits, "l2"),
        ]);
        let fail = first_fail(&a, &b).expect("fail");
        assert_eq!(fail.stage, Stage::MlpOut);
        assert_eq!(fail.root_cause(), RootCause::MlpOutput);
        assert_eq!(fail.digest_a.as_deref(), Some("m1"));
        assert_eq!(fail.digest_b.as_deref(), Some("m2"));
    }

    #[test]
    fn test_one_sided_stage_is_trace_offset() {
        let a = digests(&[(Stage::EmbedOut, "e"), (Stage::QPreRope, "q")]);
        let b = digests(&[(Stage::EmbedOut, "e"), (Stage::Logits, "l")]);
        let fail = first_fail(&a, &b).expect("fail");
        assert_eq!(fail.stage, Stage::QPreRope);
        assert_eq!(fail.kind, FailKind::MissingB);
        assert_eq!(fail.root_cause(), RootCause::TraceOffset);

        let fail = first_fail(&b, &a).expect("fail");
        assert_eq!(fail.kind, FailKind::MissingA);
    }

    #[test]
    fn test_skipped_stages_are_not_signals() {
        let a = digests(&[(Stage::EmbedOut, "e"), (Stage::Logits, "l")]);
        let b = digests(&[(Stage::EmbedOut, "e"), (Stage::Logits, "l")]);
        assert!(first_fail(&a, &b).is_none());
    }

    #[test]
    fn test_divergence_result_invariant() {
        let unit = PairKey::default();
        let same = UnitDigests {
            a: digests(&[(Stage::AttnOut, "x")]),
            b: digests(&[(Stage::AttnOut, "x")]),
        };
        let r = DivergenceResult::scan(unit.clone(), &same);
        assert!(r.passed());
        assert_eq!(r.root_cause(), RootCause::Pass);
        assert_eq!(r.first_fail_stage(), None);

        let diff = UnitDigests {
            a: digests(&[(Stage::AttnOut, "x")]),
            b: digests(&[(Stage::AttnOut, "y")]),
        };
        let r = DivergenceResult::scan(unit, &diff);
        assert_eq!(r.first_fail_stage(), Some(Stage::AttnOut));
        assert_eq!(r.root_cause(), RootCause::AttentionMechanism);
    }

    #[test]
    fn test_serialized_shape() {
        let diff = UnitDigests {
            a: digests(&[(Stage::ResidualPostAttn, "x")]),
            b: digests(&[(Stage::ResidualPostAttn, "y")]),
        };
        let r = DivergenceResult::scan(PairKey::default(), &diff);
        let v = serde_json::to_value(&r).expect("serialize");
        assert_eq!(v["first_fail_stage"], "residual_post_attn");
        assert_eq!(v["root_cause"], "RESIDUAL_ADD");
        assert_eq!(v["fail_kind"], "DIGEST_MISMATCH");
        assert_eq!(v["digest_b"], "y");
    }

    #[test]
    fn test_bisect_units_from_pairing() {
        let a = vec![
            rec("p0", "embed_out", "e"),
            rec("p0", "attn_out", "a"),
            rec("p1", "embed_out", "e"),
            rec("p1", "attn_out", "a"),
            rec("p1", "not_a_stage", "z"),
        ];
        let b = vec![
            rec("p0", "embed_out", "e"),
            rec("p0", "attn_out", "a"),
            rec("p1", "embed_out", "e"),
            rec("p1", "attn_out", "DIFFERENT"),
        ];
        let pairing = pair_records(&a, &b, &KeyProjection::strict());
        let results = bisect_units(&pairing);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].unit().prompt_id.as_deref(), Some("p0"));
        assert!(results[0].passed());
        assert_eq!(results[1].first_fail_stage(), Some(Stage::AttnOut));
    }

    #[test]
    fn test_unit_with_one_sided_records() {
        let a = vec![rec("p0", "embed_out", "e"), rec("p0", "attn_in", "i")];
        let b = vec![rec("p0", "embed_out", "e")];
        let pairing = pair_records(&a, &b, &KeyProjection::strict());
        let results = bisect_units(&pairing);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].root_cause(), RootCause::TraceOffset);
        assert_eq!(results[0].first_fail().map(|f| f.kind), Some(FailKind::MissingB));
    }
}
