//! Key material: the gateway's own signing key and the registry of trusted participant keys.

use crate::KeyError;
use arc_swap::ArcSwap;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

const ALGORITHM: &str = "ed25519";

/// Identifier of a signing key: `subscriber_id|unique_key_id|ed25519`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyId {
    subscriber_id: String,
    unique_key_id: String,
}

impl KeyId {
    /// Creates a key id from its components.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKeyId`] if either component is empty or contains `|`.
    pub fn new(
        subscriber_id: impl Into<String>,
        unique_key_id: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let subscriber_id = subscriber_id.into();
        let unique_key_id = unique_key_id.into();
        for part in [&subscriber_id, &unique_key_id] {
            if part.trim().is_empty() || part.contains('|') {
                return Err(KeyError::InvalidKeyId(format!(
                    "{subscriber_id}|{unique_key_id}"
                )));
            }
        }
        Ok(Self {
            subscriber_id,
            unique_key_id,
        })
    }

    /// Parses the wire form of a key id.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKeyId`] unless the input has exactly three `|`-separated
    /// parts and the algorithm is `ed25519`.
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        let parts: Vec<&str> = input.split('|').collect();
        match parts.as_slice() {
            [subscriber, unique, alg] if *alg == ALGORITHM => Self::new(*subscriber, *unique),
            _ => Err(KeyError::InvalidKeyId(input.to_owned())),
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn unique_key_id(&self) -> &str {
        &self.unique_key_id
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{ALGORITHM}",
            self.subscriber_id, self.unique_key_id
        )
    }
}

/// The gateway's own ed25519 signing key.
///
/// The secret half never appears in `Debug` output or logs.
#[derive(Clone)]
pub struct SigningKeyPair {
    key_id: KeyId,
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Generates a fresh key pair from the OS random number generator.
    pub fn generate(key_id: KeyId) -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            key_id,
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Builds a key pair from a 32-byte seed.
    pub fn from_seed(key_id: KeyId, seed: &[u8; 32]) -> Self {
        Self {
            key_id,
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Builds a key pair from a base64-encoded 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidKey`] if the input is not base64 or not 32 bytes long.
    pub fn from_base64_seed(key_id: KeyId, encoded: &str) -> Result<Self, KeyError> {
        let bytes = B64
            .decode(encoded.trim())
            .map_err(|e| KeyError::InvalidKey(format!("seed is not base64: {e}")))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidKey(format!("seed must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_seed(key_id, &seed))
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Base64 encoding of the secret seed, for writing key files.
    pub fn seed_base64(&self) -> String {
        B64.encode(self.signing_key.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        B64.encode(self.verifying_key().as_bytes())
    }

    /// Deterministic ed25519 signature over `payload`.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.signing_key.sign(payload)
    }

    /// A trusted-key entry for this pair with an open validity window.
    pub fn trusted_key(&self) -> TrustedKey {
        TrustedKey {
            key_id: self.key_id.clone(),
            public_key: self.verifying_key(),
            valid_from: None,
            valid_until: None,
        }
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("key_id", &self.key_id.to_string())
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// A participant public key the gateway accepts signatures from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedKey {
    pub key_id: KeyId,
    pub public_key: VerifyingKey,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl TrustedKey {
    /// Whether the key may be used for a message stamped `at`.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from.map_or(true, |from| at >= from)
            && self.valid_until.map_or(true, |until| at < until)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryFile {
    #[serde(default)]
    keys: Vec<KeyEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyEntry {
    subscriber_id: String,
    unique_key_id: String,
    public_key: String,
    #[serde(default)]
    valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
}

impl KeyEntry {
    fn into_trusted(self) -> Result<TrustedKey, KeyError> {
        let key_id = KeyId::new(self.subscriber_id, self.unique_key_id)?;
        let bytes = B64.decode(self.public_key.trim()).map_err(|e| {
            KeyError::InvalidKey(format!("public key for {key_id} is not base64: {e}"))
        })?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            KeyError::InvalidKey(format!("public key for {key_id} must be 32 bytes"))
        })?;
        let public_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| KeyError::InvalidKey(format!("public key for {key_id}: {e}")))?;
        Ok(TrustedKey {
            key_id,
            public_key,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
        })
    }
}

/// Reloadable map of trusted participant keys.
///
/// Readers take a lock-free snapshot; [`TrustedKeyRegistry::reload`] swaps the whole map.
#[derive(Debug, Default)]
pub struct TrustedKeyRegistry {
    keys: ArcSwap<HashMap<KeyId, TrustedKey>>,
}

impl TrustedKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: impl IntoIterator<Item = TrustedKey>) -> Self {
        let registry = Self::new();
        registry.reload(keys);
        registry
    }

    /// Atomically replaces the registry contents.
    pub fn reload(&self, keys: impl IntoIterator<Item = TrustedKey>) {
        let map: HashMap<KeyId, TrustedKey> =
            keys.into_iter().map(|k| (k.key_id.clone(), k)).collect();
        tracing::info!(count = map.len(), "trusted key registry loaded");
        self.keys.store(Arc::new(map));
    }

    /// Adds or replaces a single key.
    pub fn insert(&self, key: TrustedKey) {
        self.keys.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.key_id.clone(), key.clone());
            next
        });
    }

    /// Returns the key if it exists and is valid for a message stamped `at`.
    pub fn lookup(&self, key_id: &KeyId, at: DateTime<Utc>) -> Option<TrustedKey> {
        self.keys
            .load()
            .get(key_id)
            .filter(|k| k.is_valid_at(at))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses registry YAML of the form `keys: [{subscriber_id, unique_key_id, public_key}]`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::RegistrySchema`] with the failing path, or
    /// [`KeyError::InvalidKey`] for undecodable public keys.
    pub fn parse_yaml(text: &str) -> Result<Vec<TrustedKey>, KeyError> {
        let de = serde_yaml::Deserializer::from_str(text);
        let file: RegistryFile = serde_path_to_error::deserialize(de).map_err(|err| {
            KeyError::RegistrySchema {
                path: err.path().to_string(),
                message: err.into_inner().to_string(),
            }
        })?;
        file.keys.into_iter().map(KeyEntry::into_trusted).collect()
    }

    /// Replaces the registry with the keys listed in a YAML file.
    ///
    /// On error the previous contents remain in place.
    pub fn load_file(&self, path: &Path) -> Result<usize, KeyError> {
        let text = std::fs::read_to_string(path)?;
        let keys = Self::parse_yaml(&text)?;
        let count = keys.len();
        self.reload(keys);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn key_id(unique: &str) -> KeyId {
        KeyId::new("hip.example.org", unique).unwrap()
    }

    #[test]
    fn key_id_round_trips_through_wire_form() {
        let id = KeyId::parse("hip.example.org|k1|ed25519").unwrap();
        assert_eq!(id.subscriber_id(), "hip.example.org");
        assert_eq!(id.to_string(), "hip.example.org|k1|ed25519");
        assert!(KeyId::parse("hip.example.org|k1|rsa").is_err());
        assert!(KeyId::parse("hip.example.org|k1").is_err());
        assert!(KeyId::parse("|k1|ed25519").is_err());
    }

    #[test]
    fn debug_output_hides_the_seed() {
        let pair = SigningKeyPair::from_seed(key_id("k1"), &[7u8; 32]);
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains(&pair.seed_base64()));
        assert!(rendered.contains("public_key"));
    }

    #[test]
    fn cloned_pair_signs_identically() {
        let pair = SigningKeyPair::from_seed(key_id("k1"), &[9u8; 32]);
        let copy = pair.clone();
        assert_eq!(copy.key_id(), pair.key_id());
        assert_eq!(copy.sign(b"payload"), pair.sign(b"payload"));
    }

    #[test]
    fn base64_seed_must_be_32_bytes() {
        assert!(SigningKeyPair::from_base64_seed(key_id("k1"), "AAAA").is_err());
        let pair = SigningKeyPair::from_seed(key_id("k1"), &[1u8; 32]);
        let restored = SigningKeyPair::from_base64_seed(key_id("k1"), &pair.seed_base64()).unwrap();
        assert_eq!(pair.public_key_base64(), restored.public_key_base64());
    }

    #[test]
    fn lookup_respects_validity_window() {
        let pair = SigningKeyPair::from_seed(key_id("k1"), &[3u8; 32]);
        let mut trusted = pair.trusted_key();
        trusted.valid_until = Some("2026-01-01T00:00:00Z".parse().unwrap());
        let registry = TrustedKeyRegistry::with_keys([trusted]);

        assert!(registry
            .lookup(pair.key_id(), "2025-12-31T23:59:59Z".parse().unwrap())
            .is_some());
        assert!(registry
            .lookup(pair.key_id(), "2026-01-01T00:00:00Z".parse().unwrap())
            .is_none());
    }

    #[test]
    fn load_file_keeps_previous_keys_on_error() {
        let pair = SigningKeyPair::from_seed(key_id("k1"), &[5u8; 32]);
        let registry = TrustedKeyRegistry::new();

        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            good,
            "keys:\n  - subscriber_id: hip.example.org\n    unique_key_id: k1\n    public_key: {}",
            pair.public_key_base64()
        )
        .unwrap();
        assert_eq!(registry.load_file(good.path()).unwrap(), 1);

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        writeln!(bad, "keys:\n  - subscriber_id: hip.example.org\n    unique_key_id: k2").unwrap();
        let err = registry.load_file(bad.path()).unwrap_err();
        assert!(matches!(err, KeyError::RegistrySchema { .. }));
        assert_eq!(registry.len(), 1);
    }
}
