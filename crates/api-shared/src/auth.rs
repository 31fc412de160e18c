//! Caller authentication for gateway endpoints.
//!
//! Callers are participant systems (HIU, HIP, operators) identified by an API key. A
//! patient's own session token is never a valid credential here: consent and claims
//! operations act on a patient's behalf and must come from an accountable system.

use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing API key")]
    MissingKey,
    #[error("invalid API key")]
    InvalidKey,
    #[error("patient session tokens are not accepted on gateway endpoints")]
    PatientSession,
    #[error("malformed API key configuration: {0}")]
    Config(String),
}

/// Authenticated participant making a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity {
    pub participant_id: String,
}

/// API keys mapped to the participant they identify.
#[derive(Clone, Debug, Default)]
pub struct ApiKeys {
    keys: HashMap<String, String>,
}

impl ApiKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>, participant_id: impl Into<String>) -> Self {
        self.keys.insert(key.into(), participant_id.into());
        self
    }

    /// Parses `UHI_API_KEYS`: comma-separated `key=participant_id` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] for an entry without `=` or with an empty side.
    pub fn from_env_value(value: Option<String>) -> Result<Self, AuthError> {
        let mut keys = Self::new();
        let Some(value) = value else {
            return Ok(keys);
        };
        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, participant) = entry
                .split_once('=')
                .map(|(k, p)| (k.trim(), p.trim()))
                .filter(|(k, p)| !k.is_empty() && !p.is_empty())
                .ok_or_else(|| {
                    AuthError::Config(format!("expected key=participant_id, got '{entry}'"))
                })?;
            keys = keys.with_key(key, participant);
        }
        Ok(keys)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Authenticates a request from its `X-Api-Key` value and whether it carried an
    /// `X-Patient-Session` header.
    ///
    /// # Errors
    ///
    /// [`AuthError::PatientSession`] takes precedence over any key check.
    pub fn authenticate(
        &self,
        api_key: Option<&str>,
        has_patient_session: bool,
    ) -> Result<CallerIdentity, AuthError> {
        if has_patient_session {
            return Err(AuthError::PatientSession);
        }
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(AuthError::MissingKey)?;
        let participant_id = self.keys.get(api_key).ok_or(AuthError::InvalidKey)?;
        Ok(CallerIdentity {
            participant_id: participant_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_pairs() {
        let keys = ApiKeys::from_env_value(Some(
            "k-hiu = hiu.example.org, k-ops=ops.example.org,".into(),
        ))
        .unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(
            keys.authenticate(Some("k-hiu"), false).unwrap().participant_id,
            "hiu.example.org"
        );
        assert!(ApiKeys::from_env_value(None).unwrap().is_empty());
        assert!(matches!(
            ApiKeys::from_env_value(Some("no-separator".into())),
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn patient_sessions_are_refused_even_with_a_valid_key() {
        let keys = ApiKeys::new().with_key("k1", "hiu.example.org");
        assert_eq!(
            keys.authenticate(Some("k1"), true),
            Err(AuthError::PatientSession)
        );
        assert_eq!(keys.authenticate(None, false), Err(AuthError::MissingKey));
        assert_eq!(keys.authenticate(Some("nope"), false), Err(AuthError::InvalidKey));
    }
}
