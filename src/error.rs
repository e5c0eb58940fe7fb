//! Query error model
//!
//! Validation errors are produced before a pipeline runs and returned without
//! producing any row. Runtime errors are assigned to the pipeline's shared
//! error slot and surfaced through a stage status of `Error`.

/// Canonical error codes for the query execution core.
///
/// The code identifies the failure class; the human-readable detail lives in
/// [`QueryError::message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed request arguments (step descriptors, reducer args, ...)
    ParseArgs,
    /// A value could not be interpreted as requested
    BadValue,
    /// Request shape is invalid
    Invalid,
    /// A referenced field name cannot be resolved
    NoPropKey,
    /// Write-mode key conflict with no override requested
    DupField,
    /// Unknown reducer name in a GROUP step
    NoReducer,
    /// LIMIT/OFFSET exceeds configured caps
    Limit,
    /// Metric name collides with a schema field
    IndexExists,
    /// A comparison or arithmetic coercion to number failed
    NotNumeric,
    /// Document absent when opened during load
    NoDoc,
    /// Document has the wrong shape for the requested load
    KeyType,
    /// Catch-all
    Generic,
    /// Feature not available
    Unsupported,
    /// Vector expressions are not allowed in this sub-query position
    VectorNotAllowed,
    /// Weight attributes are not allowed in this sub-query position
    WeightNotAllowed,
    /// Deadline reached
    TimedOut,
}

impl ErrorCode {
    /// Short stable identifier, used as the error prefix in replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseArgs => "Parse error",
            ErrorCode::BadValue => "Bad value",
            ErrorCode::Invalid => "Invalid request",
            ErrorCode::NoPropKey => "Unknown property",
            ErrorCode::DupField => "Duplicate field",
            ErrorCode::NoReducer => "Unknown reducer",
            ErrorCode::Limit => "Limit exceeded",
            ErrorCode::IndexExists => "Name exists in schema",
            ErrorCode::NotNumeric => "Not a number",
            ErrorCode::NoDoc => "Document missing",
            ErrorCode::KeyType => "Wrong document type",
            ErrorCode::Generic => "Error",
            ErrorCode::Unsupported => "Unsupported",
            ErrorCode::VectorNotAllowed => "Vector expression not allowed",
            ErrorCode::WeightNotAllowed => "Weight attribute not allowed",
            ErrorCode::TimedOut => "Timeout limit was reached",
        }
    }
}

/// An error produced while validating or executing a query.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}: {message}", .code.as_str())]
pub struct QueryError {
    pub code: ErrorCode,
    pub message: String,
}

impl QueryError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Duplicate-field conflict for `name` (write mode without override).
    pub fn duplicate_field(name: &str) -> Self {
        Self::new(
            ErrorCode::DupField,
            format!("Property `{name}` specified more than once"),
        )
    }

    /// A property that is neither loaded nor resolvable from the schema.
    pub fn unknown_property(name: &str) -> Self {
        Self::new(
            ErrorCode::NoPropKey,
            format!("Property `{name}` not loaded nor in schema"),
        )
    }

    pub fn timed_out() -> Self {
        Self::new(ErrorCode::TimedOut, "query timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_prefix() {
        let err = QueryError::duplicate_field("score");
        assert_eq!(
            err.to_string(),
            "Duplicate field: Property `score` specified more than once"
        );
    }

    #[test]
    fn test_code_accessor() {
        let err = QueryError::unknown_property("missing");
        assert_eq!(err.code(), ErrorCode::NoPropKey);
    }
}
