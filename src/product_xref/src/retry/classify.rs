//! Failure classification: which errors are worth another attempt.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use name_source::FetchError;

use crate::models::logs::FailureClass;

/// Codes that mark a failure as fatal regardless of message wording.
pub const FATAL_CODES: &[&str] = &[
    "400",
    "401",
    "403",
    "404",
    "410",
    "422",
    "AUTH_FAILED",
    "INVALID_CREDENTIALS",
    "ACCESS_DENIED",
    "NOT_FOUND",
    "INVALID_INPUT",
    "INVALID_ARGUMENT",
    "SQLITE_CONSTRAINT",
];

const FATAL_KEYWORDS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "authentication",
    "invalid credentials",
    "invalid token",
    "forbidden",
    "permission denied",
    "access denied",
    "not authorized",
    "not found",
    "no such",
    "invalid input",
    "invalid argument",
    "invalid parameter",
    "malformed",
    "validation failed",
    "constraint failed",
];

const RETRYABLE_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "unreachable",
    "rate limit",
    "too many requests",
    "throttl",
    "temporarily unavailable",
    "service unavailable",
    "database is locked",
    "database table is locked",
    "busy",
    "deadlock",
    "reset by peer",
];

/// Classifies a failure from its message and optional category code.
///
/// Fatal codes and fatal wording win; anything else is retryable, whether or
/// not it matches one of the explicitly retryable classes.
pub fn classify_message(message: &str, code: Option<&str>) -> FailureClass {
    if code.is_some_and(|code| FATAL_CODES.iter().any(|c| c.eq_ignore_ascii_case(code.trim()))) {
        return FailureClass::Fatal;
    }
    let lowered = message.to_lowercase();
    if FATAL_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return FailureClass::Fatal;
    }
    if RETRYABLE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return FailureClass::Transient;
    }
    FailureClass::Transient
}

/// Errors the retry policy knows how to triage.
pub trait Classify {
    fn failure_class(&self) -> FailureClass;

    /// Short label stored as `sync_error.error_type`.
    fn error_type(&self) -> String;
}

impl Classify for FetchError {
    fn failure_class(&self) -> FailureClass {
        if self.is_transient() {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        }
    }

    fn error_type(&self) -> String {
        format!("fetch_{}", self.label())
    }
}

impl Classify for DieselError {
    fn failure_class(&self) -> FailureClass {
        match self {
            DieselError::NotFound => FailureClass::Fatal,
            DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation
                | DatabaseErrorKind::ForeignKeyViolation
                | DatabaseErrorKind::NotNullViolation
                | DatabaseErrorKind::CheckViolation,
                _,
            ) => FailureClass::Fatal,
            DieselError::DatabaseError(_, info) => classify_message(info.message(), None),
            DieselError::SerializationError(_) | DieselError::DeserializationError(_) => {
                FailureClass::Fatal
            }
            other => classify_message(&other.to_string(), None),
        }
    }

    fn error_type(&self) -> String {
        "database".to_string()
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn failure_class(&self) -> FailureClass {
        FailureClass::Transient
    }

    fn error_type(&self) -> String {
        "timeout".to_string()
    }
}

impl Classify for anyhow::Error {
    fn failure_class(&self) -> FailureClass {
        if let Some(e) = self.downcast_ref::<FetchError>() {
            return e.failure_class();
        }
        if let Some(e) = self.downcast_ref::<DieselError>() {
            return e.failure_class();
        }
        if self.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return FailureClass::Transient;
        }
        classify_message(&format!("{self:#}"), None)
    }

    fn error_type(&self) -> String {
        if let Some(e) = self.downcast_ref::<FetchError>() {
            return e.error_type();
        }
        if self.downcast_ref::<DieselError>().is_some() {
            return "database".to_string();
        }
        if self.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return "timeout".to_string();
        }
        "error".to_string()
    }
}
