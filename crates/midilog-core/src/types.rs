//! Core type definitions with validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a source identity, in bytes.
pub const MAX_SOURCE_LEN: usize = 128;

/// Validation errors for core types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The provided value was empty.
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    /// The provided value exceeded its length bound.
    #[error("{field} is {len} bytes, limit is {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// A MIDI data field was outside its valid range.
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i32 },
}

/// Generates a validated string ID newtype with common trait implementations.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $field_name:literal, $max_len:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new ID after validation.
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into();
                if id.is_empty() {
                    return Err(ValidationError::Empty { field: $field_name });
                }
                if id.len() > $max_len {
                    return Err(ValidationError::TooLong {
                        field: $field_name,
                        len: id.len(),
                        max: $max_len,
                    });
                }
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// A validated input source identity.
    ///
    /// Source identities are the port names reported by the MIDI backend
    /// (e.g., "Digital Piano:Digital Piano MIDI 1 20:0"). They must be
    /// non-empty and fit the persisted column bound.
    SourceId, "source identity", MAX_SOURCE_LEN
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_rejects_empty() {
        assert!(SourceId::new("").is_err());
        assert!(SourceId::new("Digital Piano").is_ok());
    }

    #[test]
    fn source_id_rejects_oversized() {
        let err = SourceId::new("x".repeat(MAX_SOURCE_LEN + 1)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TooLong {
                field: "source identity",
                len: MAX_SOURCE_LEN + 1,
                max: MAX_SOURCE_LEN,
            }
        );
        assert!(SourceId::new("x".repeat(MAX_SOURCE_LEN)).is_ok());
    }

    #[test]
    fn source_id_serde_roundtrip() {
        let id = SourceId::new("Keystation 49").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"Keystation 49\"");
        let parsed: SourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn source_id_serde_rejects_empty() {
        let result: Result<SourceId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn source_id_as_ref() {
        let id = SourceId::new("pads").unwrap();
        let s: &str = id.as_ref();
        assert_eq!(s, "pads");
    }
}
