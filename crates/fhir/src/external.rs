//! Pre-registered external resources that bundle references may point at.
//!
//! Entries are absolute URLs or relative `Type/id` references, for example
//! `Organization/hip-001` for the HIP's own registry record. The YAML form is:
//!
//! ```yaml
//! references:
//!   - Organization/hip-001
//!   - https://facility.abdm.gov.in/fhir/Organization/IN2710000123
//! ```

use crate::{parse_yaml, FhirResult};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExternalReferencesFile {
    #[serde(default)]
    references: Vec<String>,
}

/// Reloadable set of resolvable external references.
#[derive(Debug, Default)]
pub struct ExternalReferenceRegistry {
    references: ArcSwap<HashSet<String>>,
}

impl ExternalReferenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_references<I, S>(references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        registry.reload(references);
        registry
    }

    /// Atomically replaces the registered references.
    pub fn reload<I, S>(&self, references: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = references
            .into_iter()
            .map(|r| r.into().trim().to_owned())
            .filter(|r| !r.is_empty())
            .collect();
        tracing::info!(count = set.len(), "external reference registry loaded");
        self.references.store(Arc::new(set));
    }

    pub fn load_file(&self, path: &Path) -> FhirResult<usize> {
        let text = std::fs::read_to_string(path)?;
        let file: ExternalReferencesFile = parse_yaml("external references", &text)?;
        let count = file.references.len();
        self.reload(file.references);
        Ok(count)
    }

    /// Whether `reference` (ignoring any `_history` suffix) is registered.
    pub fn contains(&self, reference: &str) -> bool {
        let unversioned = reference
            .split_once("/_history/")
            .map_or(reference, |(head, _)| head);
        self.references.load().contains(unversioned)
    }

    pub fn len(&self) -> usize {
        self.references.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
