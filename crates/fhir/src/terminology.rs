//! Reloadable terminology sets used for coded-value membership checks.
//!
//! Sets are keyed by code system (or value set) URL. The FHIR R4 value sets bound by the
//! built-in profiles ship with the registry; large external code systems such as SNOMED CT,
//! ICD-10 and LOINC are loaded from a YAML file exported by the terminology service:
//!
//! ```yaml
//! systems:
//!   - url: http://snomed.info/sct
//!     codes: ["38341003", "44054006"]
//! ```
//!
//! A code system with no loaded set cannot be checked; [`TerminologyRegistry::lookup`]
//! reports that distinctly so callers can decide how strict to be.

use crate::{parse_yaml, FhirResult};
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Well-known code system and value set URLs.
pub mod systems {
    pub const SNOMED_CT: &str = "http://snomed.info/sct";
    pub const ICD_10: &str = "http://hl7.org/fhir/sid/icd-10";
    pub const LOINC: &str = "http://loinc.org";

    pub const ADMINISTRATIVE_GENDER: &str = "http://hl7.org/fhir/administrative-gender";
    pub const COMPOSITION_STATUS: &str = "http://hl7.org/fhir/composition-status";
    pub const ENCOUNTER_STATUS: &str = "http://hl7.org/fhir/encounter-status";
    pub const OBSERVATION_STATUS: &str = "http://hl7.org/fhir/observation-status";
    pub const OBSERVATION_CATEGORY: &str =
        "http://terminology.hl7.org/CodeSystem/observation-category";
    pub const DIAGNOSTIC_REPORT_STATUS: &str = "http://hl7.org/fhir/diagnostic-report-status";
    pub const MEDICATION_REQUEST_STATUS: &str =
        "http://hl7.org/fhir/CodeSystem/medicationrequest-status";
    pub const MEDICATION_REQUEST_INTENT: &str =
        "http://hl7.org/fhir/CodeSystem/medicationrequest-intent";
    pub const DOCUMENT_REFERENCE_STATUS: &str = "http://hl7.org/fhir/document-reference-status";
    pub const FINANCIAL_RESOURCE_STATUS: &str = "http://hl7.org/fhir/fm-status";
    pub const CLAIM_USE: &str = "http://hl7.org/fhir/claim-use";
}

fn builtin_sets() -> HashMap<String, HashSet<String>> {
    let sets: [(&str, &[&str]); 11] = [
        (
            systems::ADMINISTRATIVE_GENDER,
            &["male", "female", "other", "unknown"],
        ),
        (
            systems::COMPOSITION_STATUS,
            &["preliminary", "final", "amended", "entered-in-error"],
        ),
        (
            systems::ENCOUNTER_STATUS,
            &[
                "planned",
                "arrived",
                "triaged",
                "in-progress",
                "onleave",
                "finished",
                "cancelled",
                "entered-in-error",
                "unknown",
            ],
        ),
        (
            systems::OBSERVATION_STATUS,
            &[
                "registered",
                "preliminary",
                "final",
                "amended",
                "corrected",
                "cancelled",
                "entered-in-error",
                "unknown",
            ],
        ),
        (
            systems::OBSERVATION_CATEGORY,
            &[
                "social-history",
                "vital-signs",
                "imaging",
                "laboratory",
                "procedure",
                "survey",
                "exam",
                "therapy",
                "activity",
            ],
        ),
        (
            systems::DIAGNOSTIC_REPORT_STATUS,
            &[
                "registered",
                "partial",
                "preliminary",
                "final",
                "amended",
                "corrected",
                "appended",
                "cancelled",
                "entered-in-error",
                "unknown",
            ],
        ),
        (
            systems::MEDICATION_REQUEST_STATUS,
            &[
                "active",
                "on-hold",
                "cancelled",
                "completed",
                "entered-in-error",
                "stopped",
                "draft",
                "unknown",
            ],
        ),
        (
            systems::MEDICATION_REQUEST_INTENT,
            &[
                "proposal",
                "plan",
                "order",
                "original-order",
                "reflex-order",
                "filler-order",
                "instance-order",
                "option",
            ],
        ),
        (
            systems::DOCUMENT_REFERENCE_STATUS,
            &["current", "superseded", "entered-in-error"],
        ),
        (
            systems::FINANCIAL_RESOURCE_STATUS,
            &["active", "cancelled", "draft", "entered-in-error"],
        ),
        (
            systems::CLAIM_USE,
            &["claim", "preauthorization", "predetermination"],
        ),
    ];
    sets.into_iter()
        .map(|(url, codes)| {
            (
                url.to_owned(),
                codes.iter().map(|c| (*c).to_owned()).collect(),
            )
        })
        .collect()
}

/// Result of checking one code against the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    Member,
    NotMember,
    /// No set is loaded for the system.
    UnknownSystem,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TerminologyFile {
    #[serde(default)]
    systems: Vec<SystemEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SystemEntry {
    url: String,
    codes: Vec<String>,
}

/// Process-wide terminology sets, swapped atomically on reload.
#[derive(Debug)]
pub struct TerminologyRegistry {
    sets: ArcSwap<HashMap<String, HashSet<String>>>,
}

impl Default for TerminologyRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl TerminologyRegistry {
    /// Registry holding only the built-in FHIR value sets.
    pub fn with_builtin() -> Self {
        Self {
            sets: ArcSwap::from_pointee(builtin_sets()),
        }
    }

    /// Replaces all externally loaded systems. Built-in sets are always retained.
    pub fn reload<I, C>(&self, systems: I)
    where
        I: IntoIterator<Item = (String, C)>,
        C: IntoIterator<Item = String>,
    {
        let mut sets = builtin_sets();
        for (url, codes) in systems {
            sets.entry(url).or_default().extend(codes);
        }
        tracing::info!(systems = sets.len(), "terminology registry loaded");
        self.sets.store(Arc::new(sets));
    }

    /// Replaces the externally loaded systems with those listed in `yaml_text`.
    pub fn load_yaml(&self, yaml_text: &str) -> FhirResult<usize> {
        let file: TerminologyFile = parse_yaml("terminology", yaml_text)?;
        let count = file.systems.len();
        self.reload(file.systems.into_iter().map(|s| (s.url, s.codes)));
        Ok(count)
    }

    /// Replaces the externally loaded systems with those listed in a YAML file.
    ///
    /// On error the previous contents remain in place.
    pub fn load_file(&self, path: &Path) -> FhirResult<usize> {
        let text = std::fs::read_to_string(path)?;
        self.load_yaml(&text)
    }

    pub fn lookup(&self, system: &str, code: &str) -> Membership {
        match self.sets.load().get(system) {
            Some(codes) if codes.contains(code) => Membership::Member,
            Some(_) => Membership::NotMember,
            None => Membership::UnknownSystem,
        }
    }

    pub fn has_system(&self, system: &str) -> bool {
        self.sets.load().contains_key(system)
    }
}
