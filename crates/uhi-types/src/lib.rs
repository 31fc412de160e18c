//! Validated primitive types shared across the gateway crates.

/// Errors that can occur when creating validated primitive types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
    /// A monetary value was negative
    #[error("Amount cannot be negative: {0}")]
    NegativeAmount(i64),
    /// A currency code was not three uppercase ASCII letters
    #[error("Invalid ISO 4217 currency code: '{0}'")]
    InvalidCurrency(String),
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    ///
    /// # Errors
    ///
    /// Returns `Err(TextError::Empty)` if the input is empty or contains only whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// A non-negative monetary amount held in minor currency units (paise for INR).
///
/// Claims are adjudicated on exact values, so amounts never pass through floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "AmountWire", into = "AmountWire")]
pub struct Amount {
    minor_units: i64,
    currency: [u8; 3],
}

impl Amount {
    /// Creates an amount from minor units and an ISO 4217 currency code.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::NegativeAmount`] for negative values and
    /// [`TextError::InvalidCurrency`] when `currency` is not three uppercase letters.
    pub fn new(minor_units: i64, currency: &str) -> Result<Self, TextError> {
        if minor_units < 0 {
            return Err(TextError::NegativeAmount(minor_units));
        }
        let bytes = currency.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_uppercase) {
            return Err(TextError::InvalidCurrency(currency.to_owned()));
        }
        Ok(Self {
            minor_units,
            currency: [bytes[0], bytes[1], bytes[2]],
        })
    }

    /// Amount in minor units.
    pub fn minor_units(&self) -> i64 {
        self.minor_units
    }

    /// ISO 4217 currency code.
    pub fn currency(&self) -> &str {
        // Constructed only from validated ASCII.
        std::str::from_utf8(&self.currency).unwrap_or("XXX")
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}.{:02}",
            self.currency(),
            self.minor_units / 100,
            self.minor_units % 100
        )
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct AmountWire {
    minor_units: i64,
    currency: String,
}

impl TryFrom<AmountWire> for Amount {
    type Error = TextError;

    fn try_from(wire: AmountWire) -> Result<Self, Self::Error> {
        Amount::new(wire.minor_units, &wire.currency)
    }
}

impl From<Amount> for AmountWire {
    fn from(amount: Amount) -> Self {
        AmountWire {
            minor_units: amount.minor_units,
            currency: amount.currency().to_owned(),
        }
    }
}
