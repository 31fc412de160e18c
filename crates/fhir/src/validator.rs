//! Bundle validation.
//!
//! [`BundleValidator::validate`] walks a bundle once and collects every violation it finds:
//! bundle-level conformance (type and required entries), per-entry structure, profile
//! conformance (required elements, cardinality, terminology bindings) and reference
//! resolution. Nothing short-circuits after the bundle is known to be a JSON `Bundle`.

use crate::arena::{ArenaResource, Resolution, ResourceArena};
use crate::external::ExternalReferenceRegistry;
use crate::profile::{Binding, BindingKind, Profile, ProfileRegistry};
use crate::terminology::{Membership, TerminologyRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Machine-readable category of a validation error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Structure,
    Required,
    Cardinality,
    CodeInvalid,
    ReferenceUnresolved,
    DuplicateEntry,
    BundleType,
    ProfileUnknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Structure => "structure",
            ErrorCode::Required => "required",
            ErrorCode::Cardinality => "cardinality",
            ErrorCode::CodeInvalid => "code-invalid",
            ErrorCode::ReferenceUnresolved => "reference-unresolved",
            ErrorCode::DuplicateEntry => "duplicate-entry",
            ErrorCode::BundleType => "bundle-type",
            ErrorCode::ProfileUnknown => "profile-unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violation: where it is, what kind it is, and a human-readable explanation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// FHIRPath-style location, e.g. `Bundle.entry[2].resource.subject.reference`.
    pub path: String,
    pub code: ErrorCode,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.path, self.code, self.message)
    }
}

/// Bundle types the gateway accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleType {
    Document,
    Message,
    Collection,
}

impl BundleType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document" => Some(BundleType::Document),
            "message" => Some(BundleType::Message),
            "collection" => Some(BundleType::Collection),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleType::Document => "document",
            BundleType::Message => "message",
            BundleType::Collection => "collection",
        }
    }

    /// Resource type that must open the bundle, if any.
    fn leading_resource(&self) -> Option<&'static str> {
        match self {
            BundleType::Document => Some("Composition"),
            BundleType::Message => Some("MessageHeader"),
            BundleType::Collection => None,
        }
    }
}

/// Summary of one entry of a validated bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedResource {
    pub index: usize,
    pub full_url: Option<String>,
    pub resource_type: String,
    pub id: Option<String>,
}

/// A bundle that passed validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedBundle {
    bundle_type: BundleType,
    value: Value,
    resources: Vec<ValidatedResource>,
}

impl ValidatedBundle {
    pub fn bundle_type(&self) -> BundleType {
        self.bundle_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn resources(&self) -> &[ValidatedResource] {
        &self.resources
    }

    /// `Bundle.id`, if the sender supplied one.
    pub fn resource_id(&self) -> Option<&str> {
        self.value.get("id").and_then(Value::as_str)
    }
}

/// Validates bundles against the built-in profiles and the shared registries.
#[derive(Clone, Debug)]
pub struct BundleValidator {
    profiles: ProfileRegistry,
    terminology: Arc<TerminologyRegistry>,
    external: Arc<ExternalReferenceRegistry>,
}

impl BundleValidator {
    pub fn new(
        terminology: Arc<TerminologyRegistry>,
        external: Arc<ExternalReferenceRegistry>,
    ) -> Self {
        Self {
            profiles: ProfileRegistry::r4(),
            terminology,
            external,
        }
    }

    pub fn terminology(&self) -> &Arc<TerminologyRegistry> {
        &self.terminology
    }

    pub fn external_references(&self) -> &Arc<ExternalReferenceRegistry> {
        &self.external
    }

    /// Parses JSON text and validates it.
    pub fn validate_str(&self, json_text: &str) -> Result<ValidatedBundle, Vec<ValidationError>> {
        let value: Value = serde_json::from_str(json_text).map_err(|e| {
            vec![ValidationError::new(
                "Bundle",
                ErrorCode::Structure,
                format!("invalid JSON: {e}"),
            )]
        })?;
        self.validate(&value)
    }

    /// Validates `bundle`, returning every violation found.
    ///
    /// # Errors
    ///
    /// Returns the complete list of [`ValidationError`]s when the bundle is not valid.
    pub fn validate(&self, bundle: &Value) -> Result<ValidatedBundle, Vec<ValidationError>> {
        let Some(root) = bundle.as_object() else {
            return Err(vec![ValidationError::new(
                "Bundle",
                ErrorCode::Structure,
                "bundle must be a JSON object",
            )]);
        };
        match root.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => {}
            other => {
                return Err(vec![ValidationError::new(
                    "Bundle.resourceType",
                    ErrorCode::Structure,
                    format!("expected resourceType 'Bundle', got {other:?}"),
                )])
            }
        }

        let mut errors = Vec::new();
        let bundle_type = self.check_bundle_type(bundle, &mut errors);

        let entries: &[Value] = match bundle.get("entry") {
            None | Some(Value::Null) => &[],
            Some(Value::Array(items)) => items,
            Some(_) => {
                errors.push(ValidationError::new(
                    "Bundle.entry",
                    ErrorCode::Structure,
                    "entry must be an array",
                ));
                &[]
            }
        };

        let arena = build_arena(entries, &mut errors);

        if let Some(bundle_type) = bundle_type {
            check_bundle_conformance(bundle, bundle_type, &arena, &mut errors);
        }
        for resource in arena.iter() {
            self.check_resource(resource, &mut errors);
            self.check_references(resource, &arena, &mut errors);
        }

        tracing::debug!(
            entries = entries.len(),
            errors = errors.len(),
            "bundle validated"
        );

        match (errors.is_empty(), bundle_type) {
            (true, Some(bundle_type)) => Ok(ValidatedBundle {
                bundle_type,
                value: bundle.clone(),
                resources: arena
                    .iter()
                    .map(|r| ValidatedResource {
                        index: r.index,
                        full_url: r.full_url.map(str::to_owned),
                        resource_type: r.resource_type.to_owned(),
                        id: r.id.map(str::to_owned),
                    })
                    .collect(),
            }),
            _ => Err(errors),
        }
    }

    fn check_bundle_type(
        &self,
        bundle: &Value,
        errors: &mut Vec<ValidationError>,
    ) -> Option<BundleType> {
        match bundle.get("type") {
            None | Some(Value::Null) => {
                errors.push(ValidationError::new(
                    "Bundle.type",
                    ErrorCode::Required,
                    "bundle type is required",
                ));
                None
            }
            Some(Value::String(s)) => {
                let parsed = BundleType::parse(s);
                if parsed.is_none() {
                    errors.push(ValidationError::new(
                        "Bundle.type",
                        ErrorCode::BundleType,
                        format!("bundle type '{s}' is not one of document, message, collection"),
                    ));
                }
                parsed
            }
            Some(_) => {
                errors.push(ValidationError::new(
                    "Bundle.type",
                    ErrorCode::Structure,
                    "bundle type must be a string",
                ));
                None
            }
        }
    }

    fn check_resource(&self, resource: &ArenaResource<'_>, errors: &mut Vec<ValidationError>) {
        let base = resource_path(resource.index);
        self.check_conformance(resource.value, resource.resource_type, &base, errors);

        // Contained resources carry their own profiles and bindings.
        if let Some(Value::Array(contained)) = resource.value.get("contained") {
            for (k, inner) in contained.iter().enumerate() {
                let path = format!("{base}.contained[{k}]");
                match inner.get("resourceType").and_then(Value::as_str) {
                    Some(resource_type) => {
                        self.check_conformance(inner, resource_type, &path, errors)
                    }
                    None => errors.push(ValidationError::new(
                        format!("{path}.resourceType"),
                        ErrorCode::Structure,
                        "contained resource needs a resourceType",
                    )),
                }
            }
        }
    }

    /// Checks one resource body against its declared or default profile.
    fn check_conformance(
        &self,
        value: &Value,
        resource_type: &str,
        base: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        let mut profile: Option<&Profile> = None;
        match value.get("meta").and_then(|m| m.get("profile")) {
            None | Some(Value::Null) => {}
            Some(Value::Array(urls)) => {
                for (k, url) in urls.iter().enumerate() {
                    let path = format!("{base}.meta.profile[{k}]");
                    let Some(url) = url.as_str() else {
                        errors.push(ValidationError::new(
                            path,
                            ErrorCode::Structure,
                            "profile must be a canonical URL string",
                        ));
                        continue;
                    };
                    match self.profiles.by_url(url) {
                        None => errors.push(ValidationError::new(
                            path,
                            ErrorCode::ProfileUnknown,
                            format!("profile '{url}' is not registered"),
                        )),
                        Some(p) if p.resource_type != resource_type => {
                            errors.push(ValidationError::new(
                                path,
                                ErrorCode::ProfileUnknown,
                                format!(
                                    "profile '{url}' constrains {}, not {}",
                                    p.resource_type, resource_type
                                ),
                            ))
                        }
                        Some(p) => profile = Some(p),
                    }
                }
            }
            Some(_) => errors.push(ValidationError::new(
                format!("{base}.meta.profile"),
                ErrorCode::Structure,
                "meta.profile must be an array",
            )),
        }

        // Unprofiled types still get the entry-level structural checks done by the arena.
        let Some(profile) = profile.or_else(|| self.profiles.for_resource_type(resource_type))
        else {
            return;
        };

        for element in profile.required {
            if is_absent(value.get(*element)) {
                errors.push(ValidationError::new(
                    format!("{base}.{element}"),
                    ErrorCode::Required,
                    format!("{}.{element} is required", profile.resource_type),
                ));
            }
        }

        for element in profile.max_one {
            if let Some(Value::Array(items)) = value.get(*element) {
                errors.push(ValidationError::new(
                    format!("{base}.{element}"),
                    ErrorCode::Cardinality,
                    format!(
                        "{}.{element} allows at most one value, found {}",
                        profile.resource_type,
                        items.len()
                    ),
                ));
            }
        }

        for binding in profile.bindings {
            match value.get(binding.element) {
                None | Some(Value::Null) => {}
                Some(Value::Array(items)) => {
                    for (k, item) in items.iter().enumerate() {
                        let path = format!("{base}.{}[{k}]", binding.element);
                        self.check_binding(binding, item, &path, errors);
                    }
                }
                Some(element) => {
                    let path = format!("{base}.{}", binding.element);
                    self.check_binding(binding, element, &path, errors);
                }
            }
        }
    }

    fn check_binding(
        &self,
        binding: &Binding,
        value: &Value,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        match binding.kind {
            BindingKind::Code => {
                let Some(code) = value.as_str() else {
                    errors.push(ValidationError::new(
                        path,
                        ErrorCode::Structure,
                        "code must be a string",
                    ));
                    return;
                };
                if let Some(value_set) = binding.systems.first() {
                    if self.terminology.lookup(value_set, code) == Membership::NotMember {
                        errors.push(ValidationError::new(
                            path,
                            ErrorCode::CodeInvalid,
                            format!("'{code}' is not in {value_set}"),
                        ));
                    }
                }
            }
            BindingKind::Coding => {
                if let Some(err) = self.check_coding(binding, value, path, true) {
                    errors.push(err);
                }
            }
            BindingKind::CodeableConcept => {
                let codings = match value.get("coding") {
                    Some(Value::Array(items)) if !items.is_empty() => items,
                    Some(Value::Array(_)) | None | Some(Value::Null) => {
                        errors.push(ValidationError::new(
                            format!("{path}.coding"),
                            ErrorCode::CodeInvalid,
                            format!("a coding from {} is required", binding.systems.join(" or ")),
                        ));
                        return;
                    }
                    Some(_) => {
                        errors.push(ValidationError::new(
                            format!("{path}.coding"),
                            ErrorCode::Structure,
                            "coding must be an array",
                        ));
                        return;
                    }
                };

                let mut structural = false;
                let mut found_allowed = false;
                for (k, item) in codings.iter().enumerate() {
                    let item_path = format!("{path}.coding[{k}]");
                    let system = item.get("system").and_then(Value::as_str);
                    found_allowed |= system.is_some_and(|s| binding.systems.contains(&s));
                    if let Some(err) = self.check_coding(binding, item, &item_path, false) {
                        structural |= err.code == ErrorCode::Structure;
                        errors.push(err);
                    }
                }
                if !found_allowed && !structural {
                    errors.push(ValidationError::new(
                        format!("{path}.coding"),
                        ErrorCode::CodeInvalid,
                        format!("a coding from {} is required", binding.systems.join(" or ")),
                    ));
                }
            }
        }
    }

    /// Checks a single coding. With `strict_system`, the coding's system must be one the
    /// binding allows.
    fn check_coding(
        &self,
        binding: &Binding,
        value: &Value,
        path: &str,
        strict_system: bool,
    ) -> Option<ValidationError> {
        let system = value.get("system").and_then(Value::as_str);
        let code = value.get("code").and_then(Value::as_str);
        let (Some(system), Some(code)) = (system, code) else {
            return Some(ValidationError::new(
                path,
                ErrorCode::Structure,
                "coding needs string system and code",
            ));
        };
        if strict_system && !binding.systems.contains(&system) {
            return Some(ValidationError::new(
                path,
                ErrorCode::CodeInvalid,
                format!("system '{system}' is not allowed here"),
            ));
        }
        if self.terminology.lookup(system, code) == Membership::NotMember {
            return Some(ValidationError::new(
                path,
                ErrorCode::CodeInvalid,
                format!("'{code}' is not in {system}"),
            ));
        }
        None
    }

    fn check_references(
        &self,
        resource: &ArenaResource<'_>,
        arena: &ResourceArena<'_>,
        errors: &mut Vec<ValidationError>,
    ) {
        let mut found = Vec::new();
        collect_references(resource.value, resource_path(resource.index), &mut found);
        for (path, reference) in found {
            match reference {
                Value::String(reference) => {
                    if arena.resolve(reference, resource.index) == Resolution::Unresolved
                        && !self.external.contains(reference)
                    {
                        errors.push(ValidationError::new(
                            path,
                            ErrorCode::ReferenceUnresolved,
                            format!("reference '{reference}' does not resolve"),
                        ));
                    }
                }
                _ => errors.push(ValidationError::new(
                    path,
                    ErrorCode::Structure,
                    "reference must be a string",
                )),
            }
        }
    }
}

fn resource_path(index: usize) -> String {
    format!("Bundle.entry[{index}].resource")
}

fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// FHIR `id`: 1-64 characters from `[A-Za-z0-9-.]`.
fn is_valid_id(id: &str) -> bool {
    (1..=64).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

fn build_arena<'a>(entries: &'a [Value], errors: &mut Vec<ValidationError>) -> ResourceArena<'a> {
    let mut arena = ResourceArena::new();
    for (index, entry) in entries.iter().enumerate() {
        let entry_path = format!("Bundle.entry[{index}]");
        let Some(entry_obj) = entry.as_object() else {
            errors.push(ValidationError::new(
                entry_path,
                ErrorCode::Structure,
                "entry must be an object",
            ));
            continue;
        };

        let full_url = match entry_obj.get("fullUrl") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
            Some(_) => {
                errors.push(ValidationError::new(
                    format!("{entry_path}.fullUrl"),
                    ErrorCode::Structure,
                    "fullUrl must be a non-empty string",
                ));
                None
            }
        };

        let resource = match entry_obj.get("resource") {
            Some(value @ Value::Object(_)) => value,
            None | Some(Value::Null) => {
                errors.push(ValidationError::new(
                    format!("{entry_path}.resource"),
                    ErrorCode::Required,
                    "entry must carry a resource",
                ));
                continue;
            }
            Some(_) => {
                errors.push(ValidationError::new(
                    format!("{entry_path}.resource"),
                    ErrorCode::Structure,
                    "resource must be an object",
                ));
                continue;
            }
        };

        let Some(resource_type) = resource.get("resourceType").and_then(Value::as_str) else {
            errors.push(ValidationError::new(
                format!("{entry_path}.resource.resourceType"),
                ErrorCode::Required,
                "resourceType is required",
            ));
            continue;
        };

        let id = match resource.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if is_valid_id(s) => Some(s.as_str()),
            Some(other) => {
                errors.push(ValidationError::new(
                    format!("{entry_path}.resource.id"),
                    ErrorCode::Structure,
                    format!("'{other}' is not a valid resource id"),
                ));
                None
            }
        };

        let duplicates = arena.insert(ArenaResource {
            index,
            full_url,
            resource_type,
            id,
            value: resource,
        });
        for dup in duplicates {
            errors.push(ValidationError::new(
                entry_path.clone(),
                ErrorCode::DuplicateEntry,
                format!("'{}' already used by Bundle.entry[{}]", dup.key, dup.first_index),
            ));
        }
    }
    arena
}

fn check_bundle_conformance(
    bundle: &Value,
    bundle_type: BundleType,
    arena: &ResourceArena<'_>,
    errors: &mut Vec<ValidationError>,
) {
    if bundle_type == BundleType::Document {
        if is_absent(bundle.get("identifier")) {
            errors.push(ValidationError::new(
                "Bundle.identifier",
                ErrorCode::Required,
                "document bundles require an identifier",
            ));
        }
        match bundle.get("timestamp") {
            None | Some(Value::Null) => errors.push(ValidationError::new(
                "Bundle.timestamp",
                ErrorCode::Required,
                "document bundles require a timestamp",
            )),
            Some(Value::String(ts)) if chrono::DateTime::parse_from_rfc3339(ts).is_ok() => {}
            Some(other) => errors.push(ValidationError::new(
                "Bundle.timestamp",
                ErrorCode::Structure,
                format!("{other} is not an instant"),
            )),
        }
    }

    if let Some(leading) = bundle_type.leading_resource() {
        match arena.get(0) {
            Some(first) if first.resource_type == leading => {}
            Some(first) => errors.push(ValidationError::new(
                "Bundle.entry[0].resource",
                ErrorCode::BundleType,
                format!(
                    "{} bundles must start with {leading}, found {}",
                    bundle_type.as_str(),
                    first.resource_type
                ),
            )),
            None => errors.push(ValidationError::new(
                "Bundle.entry",
                ErrorCode::BundleType,
                format!(
                    "{} bundles must start with {leading}",
                    bundle_type.as_str()
                ),
            )),
        }
    }
}

/// Collects every `{"reference": ...}` below `value`, with its path.
fn collect_references<'a>(value: &'a Value, path: String, out: &mut Vec<(String, &'a Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = format!("{path}.{key}");
                if key == "reference" && !child.is_object() && !child.is_array() {
                    out.push((child_path, child));
                } else {
                    collect_references(child, child_path, out);
                }
            }
        }
        Value::Array(items) => {
            for (k, child) in items.iter().enumerate() {
                collect_references(child, format!("{path}[{k}]"), out);
            }
        }
        _ => {}
    }
}
