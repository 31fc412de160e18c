//! # API Shared
//!
//! Shared definitions for the UHI gateway APIs.
//!
//! Contains:
//! - Request and response bodies with OpenAPI schemas (`dto` module)
//! - Shared services like `HealthService`
//! - Caller authentication (`auth` module), independent of the HTTP framework
//!
//! Used by `api-rest` and the `uhi-run` binary.

pub mod auth;
pub mod dto;
pub mod health;

pub use auth::{ApiKeys, AuthError, CallerIdentity};
pub use health::{HealthRes, HealthService};

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying a patient's own session token. Never accepted by gateway endpoints.
pub const PATIENT_SESSION_HEADER: &str = "x-patient-session";
