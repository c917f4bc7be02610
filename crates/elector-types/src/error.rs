//! Error taxonomy shared by the election engine and all datastore adapters.
//!
//! Every adapter translates its backend-native failures into exactly one
//! [`ElectorError`] variant; the engine only ever branches on
//! [`ElectorError::code`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type for elector operations
pub type Result<T> = std::result::Result<T, ElectorError>;

/// Error type returned by consumer-supplied candidate callbacks.
///
/// The engine only cares *that* a callback refused a transition, not why, so
/// candidates report whatever error type suits them.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Closed classification of every failure a datastore may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A configuration or call argument failed validation.
    InvalidArgument,
    /// The operation required the key to exist; it did not.
    KeyNotFound,
    /// Put-if-absent found a pre-existing, unexpired key.
    KeyExists,
    /// A value-conditioned mutation saw a different current value.
    CompareFailed,
    /// Any other backend failure (network, parse, 5xx).
    DataStore,
    /// A deadline was exceeded.
    Timeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::KeyNotFound => "KeyNotFound",
            ErrorCode::KeyExists => "KeyExists",
            ErrorCode::CompareFailed => "CompareFailed",
            ErrorCode::DataStore => "DataStoreError",
            ErrorCode::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for every fallible elector operation.
///
/// Non-validation variants carry the operation name (`"Get"`,
/// `"PutIfAbsent"`, ...) so a log line identifies the failing primitive
/// without a backtrace.
#[derive(Error, Debug)]
pub enum ElectorError {
    /// An argument failed validation; names the argument, the offending
    /// value, and the expected form.
    #[error("invalid argument {argument}: got {value:?}, expected {expected}")]
    InvalidArgument {
        argument: &'static str,
        value: String,
        expected: String,
    },

    #[error("{op}: key not found")]
    KeyNotFound { op: &'static str },

    /// The key is already held. `current` is the holder's value, spliced in
    /// by the adapter so callers learn the incumbent in the same round trip.
    #[error("{op}: key already held with value {current:?}")]
    KeyExists { op: &'static str, current: String },

    #[error("{op}: compare failed, current value differs from expected")]
    CompareFailed { op: &'static str },

    #[error("{op}: datastore failure{}", fmt_cause(.source))]
    DataStore {
        op: &'static str,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{op}: timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

fn fmt_cause(source: &Option<BoxError>) -> String {
    match source {
        Some(cause) => format!(": {cause}"),
        None => String::new(),
    }
}

impl ElectorError {
    /// Classify this error into the closed code set.
    pub fn code(&self) -> ErrorCode {
        match self {
            ElectorError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            ElectorError::KeyNotFound { .. } => ErrorCode::KeyNotFound,
            ElectorError::KeyExists { .. } => ErrorCode::KeyExists,
            ElectorError::CompareFailed { .. } => ErrorCode::CompareFailed,
            ElectorError::DataStore { .. } => ErrorCode::DataStore,
            ElectorError::Timeout { .. } => ErrorCode::Timeout,
        }
    }

    pub fn invalid_argument(
        argument: &'static str,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidArgument {
            argument,
            value: value.into(),
            expected: expected.into(),
        }
    }

    pub fn key_not_found(op: &'static str) -> Self {
        Self::KeyNotFound { op }
    }

    pub fn key_exists(op: &'static str, current: impl Into<String>) -> Self {
        Self::KeyExists {
            op,
            current: current.into(),
        }
    }

    pub fn compare_failed(op: &'static str) -> Self {
        Self::CompareFailed { op }
    }

    pub fn datastore(op: &'static str, source: impl Into<BoxError>) -> Self {
        Self::DataStore {
            op,
            source: Some(source.into()),
        }
    }

    pub fn timeout(op: &'static str, after: Duration) -> Self {
        Self::Timeout { op, after }
    }

    /// Races the election loop treats as routine: the key was gone, or
    /// another participant already owns it.
    pub fn is_expected_race(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::KeyNotFound | ErrorCode::CompareFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_classify_every_variant() {
        assert_eq!(
            ElectorError::invalid_argument("name", "", "non-empty").code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(ElectorError::key_not_found("Get").code(), ErrorCode::KeyNotFound);
        assert_eq!(
            ElectorError::key_exists("PutIfAbsent", "a:6379").code(),
            ErrorCode::KeyExists
        );
        assert_eq!(
            ElectorError::compare_failed("RefreshTTL").code(),
            ErrorCode::CompareFailed
        );
        assert_eq!(
            ElectorError::datastore("Watch", "boom").code(),
            ErrorCode::DataStore
        );
        assert_eq!(
            ElectorError::timeout("Close", Duration::from_secs(10)).code(),
            ErrorCode::Timeout
        );
    }

    #[test]
    fn display_names_the_operation() {
        let err = ElectorError::key_exists("PutIfAbsent", "b:6379");
        assert_eq!(
            err.to_string(),
            "PutIfAbsent: key already held with value \"b:6379\""
        );

        let err = ElectorError::datastore("Get", "connection refused");
        assert!(err.to_string().starts_with("Get: datastore failure"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn expected_races() {
        assert!(ElectorError::key_not_found("CompareAndDel").is_expected_race());
        assert!(ElectorError::compare_failed("CompareAndDel").is_expected_race());
        assert!(!ElectorError::datastore("Get", "boom").is_expected_race());
    }
}
