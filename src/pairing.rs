//! Pairing engine: match run A records against run B by composite key
//!
//! A [`KeyProjection`] picks which identity fields form the key. Strict
//! pairing uses all of them; cross-phase pairing (prefill vs decode of the
//! same logical token) drops the phase tag. Matching is key equality only;
//! values are compared after pairing.
//!
//! When several records of one side project onto the same key, the first
//! one in input order is the representative and every such key is reported
//! as a [`DuplicateKey`]. Unmatched keys are results, not errors.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BisectarError, Result};
use crate::record::{RecordIdentity, TraceRecord};

/// One identity field that can take part in a pairing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyField {
    /// Run / prompt identifier
    PromptId,
    /// Position index
    PosId,
    /// Layer index
    Layer,
    /// Stage / tensor name
    Tensor,
    /// Phase tag
    Phase,
    /// Token identifier
    TokenId,
    /// Logical token index
    LogicalTokIdx,
}

impl KeyField {
    /// All identity fields, in key order
    pub const ALL: [KeyField; 7] = [
        Self::PromptId,
        Self::PosId,
        Self::Layer,
        Self::Tensor,
        Self::Phase,
        Self::TokenId,
        Self::LogicalTokIdx,
    ];

    /// Parse a field name as written in trace JSON
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "prompt_id" | "prompt" => Some(Self::PromptId),
            "pos_id" | "pos" => Some(Self::PosId),
            "layer" => Some(Self::Layer),
            "tensor" | "tensor_name" | "stage" => Some(Self::Tensor),
            "phase" => Some(Self::Phase),
            "token_id" => Some(Self::TokenId),
            "logical_tok_idx" | "token_index" => Some(Self::LogicalTokIdx),
            _ => None,
        }
    }
}

/// The subset of identity fields used as the pairing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyProjection {
    fields: BTreeSet<KeyField>,
}

impl Default for KeyProjection {
    fn default() -> Self {
        Self::strict()
    }
}

impl KeyProjection {
    /// Full composite key
    #[must_use]
    pub fn strict() -> Self {
        Self {
            fields: KeyField::ALL.into_iter().collect(),
        }
    }

    /// Full key minus the phase tag, for prefill-vs-decode pairing
    #[must_use]
    pub fn cross_phase() -> Self {
        Self::strict().without(KeyField::Phase)
    }

    /// Projection over exactly the given fields
    pub fn from_fields(fields: impl IntoIterator<Item = KeyField>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    /// Parse a comma-separated field list (e.g. `prompt_id,layer,tensor`)
    pub fn parse(s: &str) -> Result<Self> {
        let mut fields = BTreeSet::new();
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            let field = KeyField::parse(part).ok_or_else(|| {
                BisectarError::InvalidConfiguration(format!("Unknown key field '{}'", part.trim()))
            })?;
            fields.insert(field);
        }
        if fields.is_empty() {
            return Err(BisectarError::InvalidConfiguration(
                "Key projection needs at least one field".to_string(),
            ));
        }
        Ok(Self { fields })
    }

    /// Same projection without one field
    #[must_use]
    pub fn without(mut self, field: KeyField) -> Self {
        self.fields.remove(&field);
        self
    }

    /// Whether the projection keeps a field
    #[must_use]
    pub fn contains(&self, field: KeyField) -> bool {
        self.fields.contains(&field)
    }

    /// Fields in key order
    pub fn fields(&self) -> impl Iterator<Item = KeyField> + '_ {
        self.fields.iter().copied()
    }

    /// Project a record identity onto this key
    #[must_use]
    pub fn project(&self, id: &RecordIdentity) -> PairKey {
        let keep = |f: KeyField| self.fields.contains(&f);
        PairKey {
            prompt_id: if keep(KeyField::PromptId) { id.prompt_id.clone() } else { None },
            pos_id: if keep(KeyField::PosId) { id.pos_id } else { None },
            layer: if keep(KeyField::Layer) { id.layer } else { None },
            tensor: if keep(KeyField::Tensor) { id.tensor.clone() } else { None },
            phase: if keep(KeyField::Phase) { id.phase.clone() } else { None },
            token_id: if keep(KeyField::TokenId) { id.token_id } else { None },
            logical_tok_idx: if keep(KeyField::LogicalTokIdx) {
                id.logical_tok_idx
            } else {
                None
            },
        }
    }
}

/// A projected pairing key
///
/// Fields outside the projection are `None`. Absent identity fields are
/// also `None` and compare equal to each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    /// Run / prompt identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    /// Position index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_id: Option<i64>,
    /// Layer index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<i64>,
    /// Stage / tensor name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor: Option<String>,
    /// Phase tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Token identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<i64>,
    /// Logical token index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_tok_idx: Option<i64>,
}

impl PairKey {
    /// The logical unit this key belongs to (the key without its stage)
    #[must_use]
    pub fn unit(&self) -> PairKey {
        PairKey {
            tensor: None,
            ..self.clone()
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(p) = &self.prompt_id {
            parts.push(format!("prompt={p}"));
        }
        if let Some(p) = self.pos_id {
            parts.push(format!("pos={p}"));
        }
        if let Some(l) = self.layer {
            parts.push(format!("layer={l}"));
        }
        if let Some(t) = &self.tensor {
            parts.push(format!("tensor={t}"));
        }
        if let Some(p) = &self.phase {
            parts.push(format!("phase={p}"));
        }
        if let Some(t) = self.token_id {
            parts.push(format!("token={t}"));
        }
        if let Some(i) = self.logical_tok_idx {
            parts.push(format!("tok_idx={i}"));
        }
        if parts.is_empty() {
            write!(f, "<empty key>")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Which run a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    /// Baseline / prefill run
    A,
    /// Current / decode run
    B,
}

impl Side {
    /// The opposite side
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Records of both runs sharing one key
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair<'a> {
    /// Shared key
    pub key: PairKey,
    /// Record from run A
    pub a: &'a TraceRecord,
    /// Record from run B
    pub b: &'a TraceRecord,
}

/// A record whose key is absent on the other run
#[derive(Debug, Clone, PartialEq)]
pub struct UnmatchedRecord<'a> {
    /// The record's key
    pub key: PairKey,
    /// The side that has the record
    pub side: Side,
    /// The record itself
    pub record: &'a TraceRecord,
}

/// A paired record in either of its two states
#[derive(Debug, Clone, PartialEq)]
pub enum PairedRecord<'a> {
    /// Both sides present
    Matched(MatchedPair<'a>),
    /// Key absent on the other side
    MissingOtherSide(UnmatchedRecord<'a>),
}

/// A key that several records of one side projected onto
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateKey {
    /// Side holding the duplicates
    pub side: Side,
    /// The colliding key
    pub key: PairKey,
    /// Number of records with this key (first one kept)
    pub occurrences: usize,
}

/// First-seen index of one side
struct SideIndex<'a> {
    order: Vec<(PairKey, &'a TraceRecord)>,
    position: HashMap<PairKey, usize>,
    duplicates: Vec<DuplicateKey>,
}

impl<'a> SideIndex<'a> {
    fn build(records: &'a [TraceRecord], projection: &KeyProjection, side: Side) -> Self {
        let mut order: Vec<(PairKey, &'a TraceRecord)> = Vec::new();
        let mut position = HashMap::new();
        let mut counts: HashMap<usize, usize> = HashMap::new();

        for record in records {
            let key = projection.project(record.identity());
            match position.get(&key) {
                Some(&idx) => *counts.entry(idx).or_insert(1) += 1,
                None => {
                    position.insert(key.clone(), order.len());
                    order.push((key, record));
                },
            }
        }

        let mut dup_idx: Vec<_> = counts.into_iter().collect();
        dup_idx.sort_unstable();
        let duplicates = dup_idx
            .into_iter()
            .map(|(idx, occurrences)| DuplicateKey {
                side,
                key: order[idx].0.clone(),
                occurrences,
            })
            .collect();

        Self {
            order,
            position,
            duplicates,
        }
    }

    fn get(&self, key: &PairKey) -> Option<&'a TraceRecord> {
        self.position.get(key).map(|&i| self.order[i].1)
    }
}

/// Result of pairing two record collections
#[derive(Debug, Clone, Default)]
pub struct Pairing<'a> {
    /// Matched pairs, in A's first-seen order
    pub matched: Vec<MatchedPair<'a>>,
    /// A records without a B counterpart, in A's first-seen order
    pub only_a: Vec<UnmatchedRecord<'a>>,
    /// B records without an A counterpart, in B's first-seen order
    pub only_b: Vec<UnmatchedRecord<'a>>,
    /// Keys with more than one record on a side, A's first
    pub duplicates: Vec<DuplicateKey>,
}

impl<'a> Pairing<'a> {
    /// Every paired record: matched first, then A-only, then B-only
    pub fn iter(&self) -> impl Iterator<Item = PairedRecord<'a>> + '_ {
        self.matched
            .iter()
            .cloned()
            .map(PairedRecord::Matched)
            .chain(
                self.only_a
                    .iter()
                    .chain(&self.only_b)
                    .cloned()
                    .map(PairedRecord::MissingOtherSide),
            )
    }

    /// Counts for reporting
    #[must_use]
    pub fn summary(&self) -> PairingSummary {
        PairingSummary {
            matched: self.matched.len(),
            only_a: self.only_a.len(),
            only_b: self.only_b.len(),
            duplicates: self.duplicates.clone(),
        }
    }
}

/// Serializable pairing counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSummary {
    /// Matched keys
    pub matched: usize,
    /// Keys only present in run A
    pub only_a: usize,
    /// Keys only present in run B
    pub only_b: usize,
    /// Keys with duplicate records
    pub duplicates: Vec<DuplicateKey>,
}

/// Pair run A against run B under a key projection
#[must_use]
pub fn pair_records<'a>(
    a: &'a [TraceRecord],
    b: &'a [TraceRecord],
    projection: &KeyProjection,
) -> Pairing<'a> {
    let index_a = SideIndex::build(a, projection, Side::A);
    let index_b = SideIndex::build(b, projection, Side::B);

    let mut matched = Vec::new();
    let mut only_a = Vec::new();
    for (key, record) in &index_a.order {
        match index_b.get(key) {
            Some(other) => matched.push(MatchedPair {
                key: key.clone(),
                a: record,
                b: other,
            }),
            None => only_a.push(UnmatchedRecord {
                key: key.clone(),
                side: Side::A,
                record,
            }),
        }
    }
    let only_b = index_b
        .order
        .iter()
        .filter(|(key, _)| index_a.get(key).is_none())
        .map(|(key, record)| UnmatchedRecord {
            key: key.clone(),
            side: Side::B,
            record,
        })
        .collect();

    let mut duplicates = index_a.duplicates;
    duplicates.extend(index_b.duplicates);

    let pairing = Pairing {
        matched,
        only_a,
        only_b,
        duplicates,
    };
    debug!(
        matched = pairing.matched.len(),
        only_a = pairing.only_a.len(),
        only_b = pairing.only_b.len(),
        duplicates = pairing.duplicates.len(),
        "paired trace records"
    );
    pairing
}

/// Value-level comparison of one matched pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordDelta {
    /// Digest equality, when both sides carry one
    pub digest_match: Option<bool>,
    /// `nz_count(a) - nz_count(b)`, when both sides carry one
    pub nz_delta: Option<i64>,
    /// `abs_sum(a) - abs_sum(b)`, when both sides carry one
    pub abs_sum_delta: Option<f64>,
    /// Top-1 token agreement, when both sides carry logits or top-k
    pub top1_match: Option<bool>,
}

impl MatchedPair<'_> {
    /// Compare the observed values of the pair
    #[must_use]
    pub fn delta(&self) -> RecordDelta {
        let (va, vb) = (self.a.values(), self.b.values());
        RecordDelta {
            digest_match: self.a.digest().zip(self.b.digest()).map(|(x, y)| x == y),
            nz_delta: va
                .nz_count
                .zip(vb.nz_count)
                .map(|(x, y)| x as i64 - y as i64),
            abs_sum_delta: va.abs_sum.zip(vb.abs_sum).map(|(x, y)| x - y),
            top1_match: self
                .a
                .top1_token()
                .zip(self.b.top1_token())
                .map(|(x, y)| x == y),
        }
    }
}

/// Value deltas over all matched pairs of a cell
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaSummary {
    /// Matched pairs inspected
    pub compared: usize,
    /// Pairs whose digests differ
    pub digest_mismatches: usize,
    /// Pairs whose non-zero counts differ
    pub nz_mismatches: usize,
    /// Pairs whose top-1 tokens differ
    pub top1_mismatches: usize,
    /// Mean absolute `abs_sum` delta, over pairs carrying both sums
    pub abs_sum_mae: Option<f64>,
    /// Largest absolute `abs_sum` delta
    pub abs_sum_max_delta: Option<f64>,
}

impl Pairing<'_> {
    /// Summarize the value deltas of every matched pair
    #[must_use]
    pub fn delta_summary(&self) -> DeltaSummary {
        let mut summary = DeltaSummary::default();
        let mut abs_sum_total = 0.0;
        let mut abs_sum_n = 0usize;
        for pair in &self.matched {
            let delta = pair.delta();
            summary.compared += 1;
            if delta.digest_match == Some(false) {
                summary.digest_mismatches += 1;
            }
            if delta.nz_delta.is_some_and(|d| d != 0) {
                summary.nz_mismatches += 1;
            }
            if delta.top1_match == Some(false) {
                summary.top1_mismatches += 1;
            }
            if let Some(d) = delta.abs_sum_delta {
                let d = d.abs();
                abs_sum_total += d;
                abs_sum_n += 1;
                summary.abs_sum_max_delta = Some(summary.abs_sum_max_delta.map_or(d, |m| m.max(d)));
            }
        }
        if abs_sum_n > 0 {
            summary.abs_sum_mae = Some(abs_sum_total / abs_sum_n as f64);
        }
        summary
    }
}
