//! Pipeline stages in data-flow order
//!
//! The order of [`Stage::ORDER`] is the order values flow through one
//! transformer layer and is what makes "first divergence" meaningful. It is
//! never permuted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named checkpoint in the forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Token embedding output
    EmbedOut,
    /// Residual stream entering attention
    ResidualPreAttn,
    /// Normalized attention input
    AttnIn,
    /// Query projection before rotary encoding
    QPreRope,
    /// Key projection before rotary encoding
    KPreRope,
    /// Query after rotary encoding
    QPostRope,
    /// Key after rotary encoding
    KPostRope,
    /// Attention output projection
    AttnOut,
    /// Residual stream after attention add
    ResidualPostAttn,
    /// Normalized FFN input
    FfnNormIn,
    /// MLP output
    MlpOut,
    /// Residual stream after MLP add
    ResidualPostMlp,
    /// LM head output
    Logits,
}

impl Stage {
    /// Every stage, in scan order
    pub const ORDER: [Stage; 13] = [
        Self::EmbedOut,
        Self::ResidualPreAttn,
        Self::AttnIn,
        Self::QPreRope,
        Self::KPreRope,
        Self::QPostRope,
        Self::KPostRope,
        Self::AttnOut,
        Self::ResidualPostAttn,
        Self::FfnNormIn,
        Self::MlpOut,
        Self::ResidualPostMlp,
        Self::Logits,
    ];

    /// Parse a canonical stage name, ignoring ASCII case
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ORDER
            .into_iter()
            .find(|stage| stage.name().eq_ignore_ascii_case(s))
    }

    /// Canonical trace name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::EmbedOut => "embed_out",
            Self::ResidualPreAttn => "residual_pre_attn",
            Self::AttnIn => "attn_in",
            Self::QPreRope => "q_pre_rope",
            Self::KPreRope => "k_pre_rope",
            Self::QPostRope => "q_post_rope",
            Self::KPostRope => "k_post_rope",
            Self::AttnOut => "attn_out",
            Self::ResidualPostAttn => "residual_post_attn",
            Self::FfnNormIn => "ffn_norm_in",
            Self::MlpOut => "mlp_out",
            Self::ResidualPostMlp => "residual_post_mlp",
            Self::Logits => "logits",
        }
    }

    /// Position in [`Stage::ORDER`]
    #[must_use]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
