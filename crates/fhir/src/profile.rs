//! Built-in R4 resource profiles.
//!
//! A profile lists, for one resource type, the elements that must be present, the elements
//! that may appear at most once, and the elements bound to terminology. It deliberately says
//! nothing about clinical meaning.

use crate::terminology::systems;
use std::collections::HashMap;

const NRCES_BASE: &str = "https://nrces.in/ndhm/fhir/r4/StructureDefinition";
const HL7_BASE: &str = "http://hl7.org/fhir/StructureDefinition";

/// Shape of a bound element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    /// Primitive `code`; `systems[0]` names the value set.
    Code,
    /// A single `Coding`.
    Coding,
    /// A `CodeableConcept`; at least one coding must come from an allowed system.
    CodeableConcept,
}

/// Terminology binding of one element.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub element: &'static str,
    pub kind: BindingKind,
    pub systems: &'static [&'static str],
}

const fn code(element: &'static str, systems: &'static [&'static str]) -> Binding {
    Binding {
        element,
        kind: BindingKind::Code,
        systems,
    }
}

const fn coding(element: &'static str, systems: &'static [&'static str]) -> Binding {
    Binding {
        element,
        kind: BindingKind::Coding,
        systems,
    }
}

const fn concept(element: &'static str, systems: &'static [&'static str]) -> Binding {
    Binding {
        element,
        kind: BindingKind::CodeableConcept,
        systems,
    }
}

/// Structural profile of one resource type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub resource_type: &'static str,
    pub required: &'static [&'static str],
    pub max_one: &'static [&'static str],
    pub bindings: &'static [Binding],
}

impl Profile {
    /// Canonical URL of the national profile.
    pub fn url(&self) -> String {
        format!("{NRCES_BASE}/{}", self.resource_type)
    }

    /// Canonical URL of the base R4 definition.
    pub fn base_url(&self) -> String {
        format!("{HL7_BASE}/{}", self.resource_type)
    }
}

const CLINICAL_CODES: &[&str] = &[systems::SNOMED_CT, systems::ICD_10, systems::LOINC];

const R4_PROFILES: &[Profile] = &[
    Profile {
        resource_type: "Patient",
        required: &["identifier", "name", "gender"],
        max_one: &["active", "gender", "birthDate", "deceasedBoolean", "deceasedDateTime"],
        bindings: &[code("gender", &[systems::ADMINISTRATIVE_GENDER])],
    },
    Profile {
        resource_type: "Practitioner",
        required: &["identifier", "name"],
        max_one: &["active", "gender", "birthDate"],
        bindings: &[code("gender", &[systems::ADMINISTRATIVE_GENDER])],
    },
    Profile {
        resource_type: "Organization",
        required: &["name"],
        max_one: &["active", "name", "partOf"],
        bindings: &[],
    },
    Profile {
        resource_type: "Encounter",
        required: &["status", "class", "subject"],
        max_one: &["status", "class", "subject", "period", "serviceProvider", "partOf"],
        bindings: &[
            code("status", &[systems::ENCOUNTER_STATUS]),
            coding("class", &["http://terminology.hl7.org/CodeSystem/v3-ActCode"]),
        ],
    },
    Profile {
        resource_type: "Composition",
        required: &["status", "type", "subject", "date", "author", "title"],
        max_one: &["status", "type", "subject", "encounter", "date", "title", "custodian"],
        bindings: &[
            code("status", &[systems::COMPOSITION_STATUS]),
            concept("type", &[systems::SNOMED_CT, systems::LOINC]),
        ],
    },
    Profile {
        resource_type: "Condition",
        required: &["code", "subject"],
        max_one: &["clinicalStatus", "verificationStatus", "code", "subject", "encounter"],
        bindings: &[concept("code", CLINICAL_CODES)],
    },
    Profile {
        resource_type: "Observation",
        required: &["status", "code", "subject"],
        max_one: &["status", "code", "subject", "encounter", "effectiveDateTime", "issued"],
        bindings: &[
            code("status", &[systems::OBSERVATION_STATUS]),
            concept("category", &[systems::OBSERVATION_CATEGORY]),
            concept("code", &[systems::LOINC, systems::SNOMED_CT]),
        ],
    },
    Profile {
        resource_type: "MedicationRequest",
        required: &["status", "intent", "subject", "authoredOn"],
        max_one: &["status", "intent", "subject", "encounter", "authoredOn", "requester"],
        bindings: &[
            code("status", &[systems::MEDICATION_REQUEST_STATUS]),
            code("intent", &[systems::MEDICATION_REQUEST_INTENT]),
            concept("medicationCodeableConcept", &[systems::SNOMED_CT]),
        ],
    },
    Profile {
        resource_type: "DiagnosticReport",
        required: &["status", "code", "subject"],
        max_one: &["status", "code", "subject", "encounter", "issued", "conclusion"],
        bindings: &[
            code("status", &[systems::DIAGNOSTIC_REPORT_STATUS]),
            concept("code", &[systems::LOINC, systems::SNOMED_CT]),
        ],
    },
    Profile {
        resource_type: "MessageHeader",
        required: &["eventCoding", "source"],
        max_one: &["eventCoding", "eventUri", "source", "sender", "focus"],
        bindings: &[],
    },
    Profile {
        resource_type: "DocumentReference",
        required: &["status", "content", "subject"],
        max_one: &["status", "type", "subject", "date"],
        bindings: &[
            code("status", &[systems::DOCUMENT_REFERENCE_STATUS]),
            concept("type", &[systems::SNOMED_CT, systems::LOINC]),
        ],
    },
    Profile {
        resource_type: "Claim",
        required: &[
            "status",
            "type",
            "use",
            "patient",
            "created",
            "provider",
            "priority",
            "insurance",
        ],
        max_one: &["status", "type", "use", "patient", "created", "provider", "priority", "total"],
        bindings: &[
            code("status", &[systems::FINANCIAL_RESOURCE_STATUS]),
            code("use", &[systems::CLAIM_USE]),
        ],
    },
];

/// Profiles indexed by resource type and by canonical URL.
#[derive(Clone, Debug)]
pub struct ProfileRegistry {
    by_type: HashMap<&'static str, Profile>,
    by_url: HashMap<String, &'static str>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::r4()
    }
}

impl ProfileRegistry {
    /// The built-in R4 profile set.
    pub fn r4() -> Self {
        let mut by_type = HashMap::new();
        let mut by_url = HashMap::new();
        for profile in R4_PROFILES.iter().cloned() {
            by_url.insert(profile.url(), profile.resource_type);
            by_url.insert(profile.base_url(), profile.resource_type);
            by_type.insert(profile.resource_type, profile);
        }
        Self { by_type, by_url }
    }

    pub fn for_resource_type(&self, resource_type: &str) -> Option<&Profile> {
        self.by_type.get(resource_type)
    }

    /// Looks up a profile by canonical URL, ignoring any `|version` suffix.
    pub fn by_url(&self, url: &str) -> Option<&Profile> {
        let url = url.split_once('|').map_or(url, |(head, _)| head);
        self.by_url
            .get(url)
            .and_then(|resource_type| self.by_type.get(resource_type))
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_type.keys().copied()
    }
}
