//! Typed protocol identifiers.

use crate::{ShardableUuid, UuidError, UuidResult};
use std::{fmt, str::FromStr};
use uuid::Uuid;

macro_rules! protocol_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(Uuid);

        impl $name {
            /// Allocates a fresh random (v4) identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses the hyphenated or simple textual form.
            ///
            /// # Errors
            ///
            /// Returns [`UuidError::InvalidInput`] if `input` is not a UUID.
            pub fn parse(input: &str) -> UuidResult<Self> {
                Uuid::parse_str(input.trim()).map(Self).map_err(|_| {
                    UuidError::InvalidInput(format!(
                        concat!("invalid ", stringify!($name), ": '{}'"),
                        input
                    ))
                })
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn uuid(&self) -> Uuid {
                self.0
            }

            /// Storage form used for sharded file paths.
            pub fn shardable(&self) -> ShardableUuid {
                ShardableUuid::from_uuid(self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = UuidError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

protocol_id!(
    /// Identifies one multi-step exchange; stable from `search` to the terminal state.
    TransactionId
);
protocol_id!(
    /// Identifies one request and the callback(s) answering it.
    MessageId
);
protocol_id!(
    /// Identifies a consent artifact held by the ledger.
    ConsentId
);
protocol_id!(
    /// Identifies a claim case in the claims sub-workflow.
    ClaimId
);
protocol_id!(
    /// Identifies a validated clinical bundle; derived from the bundle's content digest.
    BundleId
);

impl BundleId {
    /// Derives the identifier from the first 16 bytes of a SHA-256 digest.
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }
}
