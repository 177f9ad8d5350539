//! Trace record model
//!
//! One [`TraceRecord`] per instrumentation event. A record pairs an
//! [`RecordIdentity`] (which prompt/position/layer/stage/phase it observed)
//! with [`ObservedValues`] (digest, counts, raw vectors). Records are built
//! once by the loader and only read afterwards: fields are private and the
//! type exposes no mutating API.
//!
//! Wire format (one JSON object per line, unknown fields ignored):
//!
//! ```json
//! {"prompt_id":"p0","pos_id":37,"layer":0,"tensor":"attn_out",
//!  "phase":"prefill_last","token_id":116,"hash":"9f3c...","nz_count":4096}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity fields of a trace record (the composite key)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordIdentity {
    /// Run / prompt identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    /// Position index in the sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos_id: Option<i64>,
    /// Transformer layer index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<i64>,
    /// Stage / tensor name (e.g. `attn_out`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor: Option<String>,
    /// Phase tag (e.g. `prefill_last`, `decode0`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Token identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<i64>,
    /// Logical token index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_tok_idx: Option<i64>,
}

/// Top-k summary emitted alongside logits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopK {
    /// Highest-scoring token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top1_id: Option<i64>,
    /// Logit of the highest-scoring token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top1_logit: Option<f64>,
    /// Five highest-scoring token ids
    #[serde(default)]
    pub top5_ids: Vec<i64>,
    /// Logits of the five highest-scoring tokens
    #[serde(default)]
    pub top5_logits: Vec<f64>,
}

/// Observed values of a trace record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedValues {
    /// Fixed-length content digest used for cheap equality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Number of non-zero elements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nz_count: Option<u64>,
    /// Sum of absolute values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abs_sum: Option<f64>,
    /// Raw numeric sample of the tensor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<f64>>,
    /// Full logits vector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logits: Option<Vec<f64>>,
    /// Top-k summary of the logits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topk: Option<TopK>,
}

/// One instrumentation sample, immutable after construction
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceRecord {
    identity: RecordIdentity,
    values: ObservedValues,
}

impl TraceRecord {
    /// Build a record from its identity and observed values
    #[must_use]
    pub fn new(identity: RecordIdentity, values: ObservedValues) -> Self {
        Self { identity, values }
    }

    /// Identity fields
    #[must_use]
    pub fn identity(&self) -> &RecordIdentity {
        &self.identity
    }

    /// Observed values
    #[must_use]
    pub fn values(&self) -> &ObservedValues {
        &self.values
    }

    /// Stage / tensor name, if recorded
    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        self.identity.tensor.as_deref()
    }

    /// Content digest, if recorded
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.values.hash.as_deref()
    }

    /// Top-1 token: the emitted top-k summary wins, else argmax of logits
    #[must_use]
    pub fn top1_token(&self) -> Option<i64> {
        if let Some(id) = self.values.topk.as_ref().and_then(|t| t.top1_id) {
            return Some(id);
        }
        self.values
            .logits
            .as_deref()
            .and_then(crate::equivalence::argmax)
            .map(|i| i as i64)
    }
}

/// The on-wire shape of a record, before validation
///
/// Every field is optional; a line whose object sets none of them is not a
/// record at all and is dropped by the loader.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawRecord {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    pos_id: Option<i64>,
    #[serde(default)]
    layer: Option<i64>,
    #[serde(default, alias = "tensor_name", alias = "point")]
    tensor: Option<String>,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    token_id: Option<i64>,
    #[serde(default, alias = "token_index")]
    logical_tok_idx: Option<i64>,
    #[serde(default, alias = "digest")]
    hash: Option<String>,
    #[serde(default)]
    nz_count: Option<u64>,
    #[serde(default)]
    abs_sum: Option<f64>,
    #[serde(default)]
    sample: Option<Vec<f64>>,
    #[serde(default)]
    logits: Option<Vec<f64>>,
    #[serde(default)]
    topk: Option<TopK>,
}

impl RawRecord {
    /// True when no recognized field was present
    pub(crate) fn is_empty(&self) -> bool {
        self.prompt_id.is_none()
            && self.pos_id.is_none()
            && self.layer.is_none()
            && self.tensor.is_none()
            && self.phase.is_none()
            && self.token_id.is_none()
            && self.logical_tok_idx.is_none()
            && self.hash.is_none()
            && self.nz_count.is_none()
            && self.abs_sum.is_none()
            && self.sample.is_none()
            && self.logits.is_none()
            && self.topk.is_none()
    }
}

impl From<RawRecord> for TraceRecord {
    fn from(raw: RawRecord) -> Self {
        Self {
            identity: RecordIdentity {
                prompt_id: raw.prompt_id,
                pos_id: raw.pos_id,
                layer: raw.layer,
                tensor: raw.tensor,
                phase: raw.phase,
                token_id: raw.token_id,
                logical_tok_idx: raw.logical_tok_idx,
            },
            values: ObservedValues {
                hash: raw.hash,
                nz_count: raw.nz_count,
                abs_sum: raw.abs_sum,
                sample: raw.sample,
                logits: raw.logits,
                topk: raw.topk,
            },
        }
    }
}

/// Which numeric vector of a record feeds the equivalence evaluator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorField {
    /// Raw hidden-state sample
    #[default]
    Sample,
    /// Full logits vector
    Logits,
}

impl VectorField {
    /// Parse from a CLI string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sample" | "hidden" | "hidden_state" => Some(Self::Sample),
            "logits" => Some(Self::Logits),
            _ => None,
        }
    }

    /// Select this field from a record
    #[must_use]
    pub fn select(self, record: &TraceRecord) -> Option<&[f64]> {
        match self {
            Self::Sample => record.values.sample.as_deref(),
            Self::Logits => record.values.logits.as_deref(),
        }
    }
}

impl fmt::Display for VectorField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sample => write!(f, "sample"),
            Self::Logits => write!(f, "logits"),
        }
    }
}
