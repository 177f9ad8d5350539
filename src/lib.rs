//! # Bisectar
//!
//! First-divergence bisection and numerical equivalence verdicts for paired
//! transformer traces.
//!
//! Two runs of the same forward pass (baseline vs modified code, or prefill
//! vs incremental decode of the same token) each emit per-stage
//! instrumentation records. Bisectar pairs them by identity, walks the fixed
//! stage order to find the *first* stage where they disagree, attributes the
//! disagreement to a subsystem, and gates numerical drift against calibrated
//! thresholds. A completeness guardrail refuses to trust a verdict over an
//! experiment matrix with holes.
//!
//! ## Example
//!
//! ```rust
//! use bisectar::bisect::{first_fail, StageDigests};
//! use bisectar::classify::RootCause;
//! use bisectar::stage::Stage;
//!
//! let mut a = StageDigests::new();
//! let mut b = StageDigests::new();
//! for stage in [Stage::EmbedOut, Stage::AttnOut] {
//!     a.insert(stage, "same".into());
//!     b.insert(stage, "same".into());
//! }
//! a.insert(Stage::ResidualPostAttn, "x".into());
//! b.insert(Stage::ResidualPostAttn, "y".into());
//!
//! let fail = first_fail(&a, &b).unwrap();
//! assert_eq!(fail.stage, Stage::ResidualPostAttn);
//! assert_eq!(fail.root_cause(), RootCause::ResidualAdd);
//! ```
//!
//! ## Pipeline
//!
//! - [`loader`]: NDJSON (optionally gzip) streams to [`TraceRecord`]s
//! - [`pairing`]: composite-key matching of run A vs run B
//! - [`bisect`]: short-circuit first-fail scan per logical unit
//! - [`classify`]: stage → root-cause bucket
//! - [`equivalence`]: exact metrics and PASS/FAIL/DRIFT verdicts
//! - [`completeness`]: manifest cross-product vs observed configurations
//! - [`aggregate`]: order-independent counts and the global verdict
//! - [`engine`]: drives all of the above over an enumerated experiment

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap)] // u64 nz counts -> i64 deltas
#![allow(clippy::cast_precision_loss)] // usize counts -> f64 ratios
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::float_cmp)] // Exact comparisons in tests

/// Aggregation, global verdict and exit codes
pub mod aggregate;
/// Ordered-stage first-divergence bisection
pub mod bisect;
/// Root-cause classification of failing stages
pub mod classify;
/// CLI command implementations (extracted for testability)
pub mod cli;
/// Experiment matrix completeness guardrail
pub mod completeness;
/// Determinism audit over repeated runs
pub mod determinism;
/// Analysis engine over enumerated experiments
pub mod engine;
/// Numerical equivalence metrics and verdicts
pub mod equivalence;
pub mod error;
/// Trace stream loading
pub mod loader;
/// Composite-key pairing of two runs
pub mod pairing;
/// Trace record model
pub mod record;
/// Analysis report contract
pub mod report;
/// Pipeline stages in data-flow order
pub mod stage;

// Re-exports for convenience
pub use aggregate::{Aggregate, GlobalVerdict, VerdictScope};
pub use classify::{classify, RootCause};
pub use completeness::{CompletenessReport, CompletenessStatus, ConfigKey, ConfigManifest};
pub use engine::{analyze, CellStreams, EngineConfig, ExperimentInput};
pub use equivalence::{AlignmentMode, EquivalenceMetrics, EquivalenceVerdict, Thresholds};
pub use error::{BisectarError, Result};
pub use record::TraceRecord;
pub use report::AnalysisReport;
pub use stage::Stage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
