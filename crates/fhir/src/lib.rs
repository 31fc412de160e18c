//! FHIR R4 clinical bundle support for the UHI gateway.
//!
//! This crate validates and normalises the FHIR `Bundle` resources that protocol messages
//! carry. It is read/transform-only: validation reports problems, normalisation changes
//! structural form (entry order, whitespace, number rendering) and never clinical meaning.
//!
//! This crate focuses on:
//! - structural checks against a built-in set of R4 profiles ([`ProfileRegistry`])
//! - coded-value membership against reloadable terminology sets ([`TerminologyRegistry`])
//! - reference resolution over an arena of bundle resources ([`ResourceArena`]), falling
//!   back to pre-registered external resources ([`ExternalReferenceRegistry`])
//! - canonical rendering and hashing for audit ([`normalize`])
//!
//! Validation never stops at the first problem: every violation found in one pass is
//! returned together.

pub mod arena;
pub mod external;
pub mod normalize;
pub mod profile;
pub mod terminology;
pub mod validator;

pub use arena::{ArenaResource, Resolution, ResourceArena};
pub use external::ExternalReferenceRegistry;
pub use normalize::{normalize, CanonicalBundle};
pub use profile::{Binding, BindingKind, Profile, ProfileRegistry};
pub use terminology::{systems, TerminologyRegistry};
pub use validator::{
    BundleType, BundleValidator, ErrorCode, ValidatedBundle, ValidatedResource, ValidationError,
};

pub use uhi_uuid::BundleId;

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("translation error: {0}")]
    Translation(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;

/// Parses a YAML document into `T`, reporting the failing path on schema mismatch.
pub(crate) fn parse_yaml<T>(what: &str, yaml_text: &str) -> FhirResult<T>
where
    T: serde::de::DeserializeOwned,
{
    let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
    serde_path_to_error::deserialize::<_, T>(deserializer).map_err(|err| {
        let path = err.path().to_string();
        let source = err.into_inner();
        let path = if path.is_empty() || path == "." {
            "<root>".to_owned()
        } else {
            path
        };
        FhirError::Translation(format!("{what} schema mismatch at {path}: {source}"))
    })
}
