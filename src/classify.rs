//! Root-cause classifier
//!
//! Maps the first failing stage to the subsystem bucket triage works from.
//! The grouping is a fixed table; bucket names are consumed by downstream
//! tooling and serialize exactly as [`RootCause::name`] returns them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Coarse subsystem a divergence is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RootCause {
    /// No divergence
    #[serde(rename = "PASS")]
    Pass,
    /// Embedding lookup or pre-attention residual routing
    #[serde(rename = "ROUTING/SELECTION")]
    RoutingSelection,
    /// Attention inputs and pre-rotary projections
    #[serde(rename = "ATTN_KERNEL_INPUTS")]
    AttnKernelInputs,
    /// Rotary encoding and attention output
    #[serde(rename = "ATTENTION_MECHANISM")]
    AttentionMechanism,
    /// Residual additions
    #[serde(rename = "RESIDUAL_ADD")]
    ResidualAdd,
    /// FFN normalization input
    #[serde(rename = "FFN_NORM_PATH")]
    FfnNormPath,
    /// MLP output
    #[serde(rename = "MLP_OUTPUT")]
    MlpOutput,
    /// LM head
    #[serde(rename = "LOGITS_DIVERGENCE")]
    LogitsDivergence,
    /// A stage traced on one side only
    #[serde(rename = "TRACE_OFFSET")]
    TraceOffset,
    /// Stage not in the table
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl RootCause {
    /// Bucket name as emitted in reports
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::RoutingSelection => "ROUTING/SELECTION",
            Self::AttnKernelInputs => "ATTN_KERNEL_INPUTS",
            Self::AttentionMechanism => "ATTENTION_MECHANISM",
            Self::ResidualAdd => "RESIDUAL_ADD",
            Self::FfnNormPath => "FFN_NORM_PATH",
            Self::MlpOutput => "MLP_OUTPUT",
            Self::LogitsDivergence => "LOGITS_DIVERGENCE",
            Self::TraceOffset => "TRACE_OFFSET",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage → bucket table
pub const ROOT_CAUSE_TABLE: [(Stage, RootCause); 13] = [
    (Stage::EmbedOut, RootCause::RoutingSelection),
    (Stage::ResidualPreAttn, RootCause::RoutingSelection),
    (Stage::AttnIn, RootCause::AttnKernelInputs),
    (Stage::QPreRope, RootCause::AttnKernelInputs),
    (Stage::KPreRope, RootCause::AttnKernelInputs),
    (Stage::QPostRope, RootCause::AttentionMechanism),
    (Stage::KPostRope, RootCause::AttentionMechanism),
    (Stage::AttnOut, RootCause::AttentionMechanism),
    (Stage::ResidualPostAttn, RootCause::ResidualAdd),
    (Stage::ResidualPostMlp, RootCause::ResidualAdd),
    (Stage::FfnNormIn, RootCause::FfnNormPath),
    (Stage::MlpOut, RootCause::MlpOutput),
    (Stage::Logits, RootCause::LogitsDivergence),
];

/// Bucket of a known stage
#[must_use]
pub fn classify_stage(stage: Stage) -> RootCause {
    ROOT_CAUSE_TABLE
        .iter()
        .find(|(s, _)| *s == stage)
        .map_or(RootCause::Unknown, |(_, cause)| *cause)
}

/// Bucket of a stage name; names outside the table are [`RootCause::Unknown`]
#[must_use]
pub fn classify(stage_name: &str) -> RootCause {
    Stage::parse(stage_name).map_or(RootCause::Unknown, classify_stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_stage_is_in_table() {
        for stage in Stage::ORDER {
            assert_ne!(classify_stage(stage), RootCause::Unknown, "{stage}");
        }
    }

    #[test]
    fn test_groupings() {
        assert_eq!(classify("embed_out"), RootCause::RoutingSelection);
        assert_eq!(classify("residual_pre_attn"), RootCause::RoutingSelection);
        assert_eq!(classify("k_pre_rope"), RootCause::AttnKernelInputs);
        assert_eq!(classify("q_post_rope"), RootCause::AttentionMechanism);
        assert_eq!(classify("attn_out"), RootCause::AttentionMechanism);
        assert_eq!(classify("residual_post_attn"), RootCause::ResidualAdd);
        assert_eq!(classify("residual_post_mlp"), RootCause::ResidualAdd);
        assert_eq!(classify("ffn_norm_in"), RootCause::FfnNormPath);
        assert_eq!(classify("mlp_out"), RootCause::MlpOutput);
        assert_eq!(classify("logits"), RootCause::LogitsDivergence);
    }

    #[test]
    fn test_unknown_stage() {
        assert_eq!(classify("v_proj"), RootCause::Unknown);
        assert_eq!(classify(""), RootCause::Unknown);
        assert_eq!(classify("LOGITS"), RootCause::LogitsDivergence);
    }

    #[test]
    fn test_serialized_names() {
        let json = serde_json::to_string(&RootCause::RoutingSelection).expect("serialize");
        assert_eq!(json, "\"ROUTING/SELECTION\"");
        for cause in [RootCause::Pass, RootCause::TraceOffset, RootCause::MlpOutput] {
            let json = serde_json::to_string(&cause).expect("serialize");
            assert_eq!(json, format!("\"{}\"", cause.name()));
        }
    }
}
