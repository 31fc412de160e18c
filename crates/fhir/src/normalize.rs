//! Canonical form of validated bundles.
//!
//! Normalisation fixes the entry order and the JSON rendering so that logically identical
//! bundles produce identical bytes, and therefore identical digests and bundle ids:
//! - the leading entry of `document` and `message` bundles stays first
//! - remaining entries are ordered by `resourceType`, then `id`, then `fullUrl`, then content
//! - the JSON is rendered canonically (sorted keys, no whitespace, stable numbers)

use crate::validator::{BundleType, ValidatedBundle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use uhi_codec::canonical::to_canonical_string;
use uhi_uuid::BundleId;

/// Canonical rendering of a validated bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalBundle {
    /// Content-derived identifier (first 16 bytes of the digest).
    pub bundle_id: BundleId,
    pub bundle_type: BundleType,
    /// Canonical JSON text.
    pub json: String,
    /// Lowercase hex SHA-256 of `json`.
    pub sha256: String,
}

/// Produces the canonical form of `bundle`.
pub fn normalize(bundle: &ValidatedBundle) -> CanonicalBundle {
    let mut value = bundle.value().clone();

    if let Some(Value::Array(entries)) = value.get_mut("entry") {
        let pinned = match bundle.bundle_type() {
            BundleType::Document | BundleType::Message => 1.min(entries.len()),
            BundleType::Collection => 0,
        };
        let mut keyed: Vec<(EntryKey, Value)> = entries
            .drain(pinned..)
            .map(|entry| (EntryKey::of(&entry), entry))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        entries.extend(keyed.into_iter().map(|(_, entry)| entry));
    }

    let json = to_canonical_string(&value);
    let digest: [u8; 32] = Sha256::digest(json.as_bytes()).into();
    CanonicalBundle {
        bundle_id: BundleId::from_digest(&digest),
        bundle_type: bundle.bundle_type(),
        json,
        sha256: hex::encode(digest),
    }
}

#[derive(PartialEq, Eq)]
struct EntryKey {
    resource_type: String,
    id: String,
    full_url: String,
    rendered: String,
}

impl EntryKey {
    fn of(entry: &Value) -> Self {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_owned();
        let resource = entry.get("resource");
        Self {
            resource_type: text(resource.and_then(|r| r.get("resourceType"))),
            id: text(resource.and_then(|r| r.get("id"))),
            full_url: text(entry.get("fullUrl")),
            rendered: to_canonical_string(entry),
        }
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.resource_type, &self.id, &self.full_url, &self.rendered).cmp(&(
            &other.resource_type,
            &other.id,
            &other.full_url,
            &other.rendered,
        ))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BundleValidator, ExternalReferenceRegistry, TerminologyRegistry};
    use serde_json::json;
    use std::sync::Arc;

    fn validate(bundle: Value) -> ValidatedBundle {
        BundleValidator::new(
            Arc::new(TerminologyRegistry::with_builtin()),
            Arc::new(ExternalReferenceRegistry::new()),
        )
        .validate(&bundle)
        .expect("valid bundle")
    }

    fn org(id: &str, name: &str) -> Value {
        json!({"resource": {"resourceType": "Organization", "id": id, "name": name}})
    }

    #[test]
    fn entry_order_and_formatting_do_not_change_the_digest() {
        let a = validate(json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [org("b", "Beta Clinic"), org("a", "Alpha Labs")]
        }));
        let text = r#"{ "type": "collection", "resourceType": "Bundle",
            "entry": [ {"resource": {"name": "Alpha Labs", "id": "a", "resourceType": "Organization"}},
                       {"resource": {"resourceType": "Organization", "name": "Beta Clinic", "id": "b"}} ] }"#;
        let b = validate(serde_json::from_str(text).unwrap());

        let (ca, cb) = (normalize(&a), normalize(&b));
        assert_eq!(ca, cb);
        assert_eq!(ca.sha256.len(), 64);
        assert!(ca.json.find("Alpha Labs") < ca.json.find("Beta Clinic"));
    }

    #[test]
    fn leading_entry_stays_first() {
        let header = json!({"resource": {
            "resourceType": "MessageHeader",
            "eventCoding": {"system": "https://nhcx.abdm.gov.in/event", "code": "claim-request"},
            "source": {"endpoint": "https://hip.example.org"}
        }});
        let bundle = validate(json!({
            "resourceType": "Bundle",
            "type": "message",
            "entry": [header, org("z", "Zeta"), org("a", "Alpha")]
        }));
        let canonical = normalize(&bundle);
        let parsed: Value = serde_json::from_str(&canonical.json).unwrap();
        let types: Vec<&str> = parsed["entry"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["resource"]["resourceType"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["MessageHeader", "Organization", "Organization"]);
        assert_eq!(parsed["entry"][1]["resource"]["id"], "a");
    }

    #[test]
    fn integral_floats_are_rendered_as_integers() {
        let mut o = org("a", "Alpha");
        o["resource"]["extension"] = json!([{"url": "https://example.org/beds", "valueDecimal": 12.0}]);
        let canonical = normalize(&validate(json!({
            "resourceType": "Bundle", "type": "collection", "entry": [o]
        })));
        assert!(canonical.json.contains("\"valueDecimal\":12}"));
    }
}
