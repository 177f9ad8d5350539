//! Completeness guardrail
//!
//! A [`ConfigManifest`] declares the experiment matrix as named dimensions
//! with their expected values. The expected set is the Cartesian product of
//! the dimensions; a configuration counts as found only when both runs of
//! its cell produced data. Any missing configuration makes the matrix
//! INCOMPLETE, and without a manifest completeness is UNKNOWN.
//!
//! Manifest format:
//!
//! ```json
//! {"dimensions": [
//!   {"name": "kv_aligned", "values": [0, 1]},
//!   {"name": "seed", "values": [0, 1, 2]}
//! ]}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{BisectarError, Result};

/// One experiment configuration: dimension name → value
pub type ConfigKey = BTreeMap<String, String>;

/// Render a configuration as `name=value` pairs
#[must_use]
pub fn config_label(key: &ConfigKey) -> String {
    if key.is_empty() {
        return "<default>".to_string();
    }
    key.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// A declared experiment dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    /// Dimension name (e.g. `seed`)
    pub name: String,
    /// Expected values; numbers are kept in their decimal form
    #[serde(deserialize_with = "values_as_strings")]
    pub values: Vec<String>,
}

fn values_as_strings<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|v| match v {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "dimension values must be strings or numbers, got {other}"
            ))),
        })
        .collect()
}

/// The declared experiment matrix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigManifest {
    /// Dimensions of the matrix
    pub dimensions: Vec<Dimension>,
}

impl ConfigManifest {
    /// Build from dimensions, validating them
    pub fn new(dimensions: Vec<Dimension>) -> Result<Self> {
        let manifest = Self { dimensions };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a JSON manifest
    pub fn from_json(s: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(s).map_err(|e| BisectarError::FormatError {
            reason: format!("Invalid config manifest: {e}"),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and parse a JSON manifest file
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| BisectarError::IoError {
            message: format!("Failed to read manifest {}: {e}", path.display()),
        })?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for dim in &self.dimensions {
            if !seen.insert(dim.name.as_str()) {
                return Err(BisectarError::InvalidConfiguration(format!(
                    "Duplicate manifest dimension '{}'",
                    dim.name
                )));
            }
            if dim.values.is_empty() {
                return Err(BisectarError::InvalidConfiguration(format!(
                    "Manifest dimension '{}' has no values",
                    dim.name
                )));
            }
        }
        Ok(())
    }

    /// Cartesian product of all dimensions
    ///
    /// A manifest with no dimensions expects exactly the empty configuration.
    #[must_use]
    pub fn expected(&self) -> BTreeSet<ConfigKey> {
        let mut product = vec![ConfigKey::new()];
        for dim in &self.dimensions {
            product = product
                .into_iter()
                .flat_map(|partial| {
                    dim.values.iter().map(move |value| {
                        let mut next = partial.clone();
                        next.insert(dim.name.clone(), value.clone());
                        next
                    })
                })
                .collect();
        }
        product.into_iter().collect()
    }

    /// Restrict a configuration to the manifest's dimensions
    #[must_use]
    pub fn project(&self, key: &ConfigKey) -> ConfigKey {
        self.dimensions
            .iter()
            .filter_map(|d| key.get(&d.name).map(|v| (d.name.clone(), v.clone())))
            .collect()
    }
}

/// Outcome of the guardrail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletenessStatus {
    /// No manifest; completeness cannot be claimed
    #[default]
    Unknown,
    /// Every expected configuration was found
    Complete,
    /// Some expected configuration is missing
    Incomplete,
}

/// Expected vs found configurations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessReport {
    /// Guardrail outcome
    pub status: CompletenessStatus,
    /// Expected configurations (empty without a manifest)
    pub expected: Vec<ConfigKey>,
    /// Configurations found with data on both sides
    pub found: Vec<ConfigKey>,
    /// `expected - found`
    pub missing: Vec<ConfigKey>,
    /// `found - expected`, for diagnostics only
    pub unexpected: Vec<ConfigKey>,
    /// Number of missing configurations
    pub missing_pairs_count: usize,
}

impl CompletenessReport {
    /// True only when a manifest was checked and nothing is missing
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == CompletenessStatus::Complete
    }
}

/// Check found configurations against an optional manifest
pub fn check<'a>(
    manifest: Option<&ConfigManifest>,
    found: impl IntoIterator<Item = &'a ConfigKey>,
) -> CompletenessReport {
    let Some(manifest) = manifest else {
        let found: BTreeSet<ConfigKey> = found.into_iter().cloned().collect();
        debug!(found = found.len(), "no manifest, completeness unknown");
        return CompletenessReport {
            status: CompletenessStatus::Unknown,
            found: found.into_iter().collect(),
            ..Default::default()
        };
    };

    let expected = manifest.expected();
    let found: BTreeSet<ConfigKey> = found.into_iter().map(|k| manifest.project(k)).collect();
    let missing: Vec<ConfigKey> = expected.difference(&found).cloned().collect();
    let unexpected: Vec<ConfigKey> = found.difference(&expected).cloned().collect();

    let status = if missing.is_empty() {
        CompletenessStatus::Complete
    } else {
        CompletenessStatus::Incomplete
    };
    if !missing.is_empty() {
        warn!(
            missing = missing.len(),
            expected = expected.len(),
            "experiment matrix is incomplete"
        );
    }

    CompletenessReport {
        status,
        missing_pairs_count: missing.len(),
        expected: expected.into_iter().collect(),
        found: found.into_iter().collect(),
        missing,
        unexpected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pairs: &[(&str, &str)]) -> ConfigKey {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn kv_seed() -> ConfigManifest {
        ConfigManifest::from_json(
            r#"{"dimensions":[{"name":"kv_aligned","values":[0,1]},{"name":"seed","values":["0","1"]}]}"#,
        )
        .expect("manifest")
    }

    #[test]
    fn test_expected_cross_product() {
        let expected = kv_seed().expected();
        assert_eq!(expected.len(), 4);
        assert!(expected.contains(&key(&[("kv_aligned", "1"), ("seed", "0")])));
    }

    #[test]
    fn test_zero_dimensions_expect_empty_config() {
        let expected = ConfigManifest::default().expected();
        assert_eq!(expected.len(), 1);
        assert!(expected.contains(&ConfigKey::new()));
    }

    #[test]
    fn test_missing_one_of_four() {
        let found = [
            key(&[("kv_aligned", "0"), ("seed", "0")]),
            key(&[("kv_aligned", "0"), ("seed", "1")]),
            key(&[("kv_aligned", "1"), ("seed", "0")]),
        ];
        let report = check(Some(&kv_seed()), &found);
        assert_eq!(report.status, CompletenessStatus::Incomplete);
        assert_eq!(report.missing_pairs_count, 1);
        assert_eq!(report.missing, vec![key(&[("kv_aligned", "1"), ("seed", "1")])]);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_complete_and_unexpected() {
        let mut found: Vec<ConfigKey> = kv_seed().expected().into_iter().collect();
        found.push(key(&[("kv_aligned", "1"), ("seed", "7")]));
        let report = check(Some(&kv_seed()), &found);
        assert!(report.is_complete());
        assert_eq!(report.unexpected.len(), 1);
    }

    #[test]
    fn test_found_projected_onto_dimensions() {
        let found = [key(&[("kv_aligned", "0"), ("seed", "0"), ("dtype", "bf16")])];
        let manifest = ConfigManifest::from_json(
            r#"{"dimensions":[{"name":"kv_aligned","values":[0]},{"name":"seed","values":[0]}]}"#,
        )
        .expect("manifest");
        let report = check(Some(&manifest), &found);
        assert!(report.is_complete());
    }

    #[test]
    fn test_no_manifest_is_unknown() {
        let found = [key(&[("seed", "0")])];
        let report = check(None, &found);
        assert_eq!(report.status, CompletenessStatus::Unknown);
        assert!(!report.is_complete());
        assert!(report.missing.is_empty());
        assert_eq!(report.found.len(), 1);
    }

    #[test]
    fn test_invalid_manifests() {
        assert!(matches!(
            ConfigManifest::from_json("{not json"),
            Err(BisectarError::FormatError { .. })
        ));
        assert!(matches!(
            ConfigManifest::from_json(r#"{"dimensions":[{"name":"seed","values":[]}]}"#),
            Err(BisectarError::InvalidConfiguration(_))
        ));
        assert!(ConfigManifest::from_json(
            r#"{"dimensions":[{"name":"seed","values":[0]},{"name":"seed","values":[1]}]}"#
        )
        .is_err());
        assert!(ConfigManifest::from_json(r#"{"dimensions":[{"name":"seed","values":[true]}]}"#).is_err());
    }

    #[test]
    fn test_manifest_from_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, r#"{"dimensions":[{"name":"seed","values":[0,1,2]}]}"#).expect("write");
        let manifest = ConfigManifest::from_path(&path).expect("load");
        assert_eq!(manifest.expected().len(), 3);
        assert!(ConfigManifest::from_path(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_config_label() {
        assert_eq!(config_label(&key(&[("seed", "1"), ("kv_aligned", "0")])), "kv_aligned=0,seed=1");
        assert_eq!(config_label(&ConfigKey::new()), "<default>");
    }
}
