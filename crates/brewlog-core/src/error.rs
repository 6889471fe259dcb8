//! Error types for record decoding and stream frame parsing.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while turning wire data into typed records.
#[derive(Error, Debug)]
pub enum Error {
    /// A resource identifier did not have the `at://did/collection/rkey` shape.
    #[error("invalid resource uri '{uri}': {reason}")]
    InvalidUri {
        /// The offending input.
        uri: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// A required payload field was absent.
    #[error("missing required field '{field}'")]
    MissingField {
        /// The name of the missing field.
        field: &'static str,
    },

    /// A payload field was present but had an unusable value.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// A stream frame could not be interpreted.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_uri_display() {
        let err = Error::InvalidUri {
            uri: "https://example.com".to_string(),
            reason: "missing at:// scheme",
        };
        let msg = err.to_string();
        assert!(msg.contains("https://example.com"));
        assert!(msg.contains("missing at:// scheme"));
    }

    #[test]
    fn test_missing_field_display() {
        let err = Error::MissingField { field: "createdAt" };
        assert_eq!(err.to_string(), "missing required field 'createdAt'");
    }

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "rating",
            reason: "must be between 1 and 10".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("rating"));
        assert!(msg.contains("between 1 and 10"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
