//! Error types for relmap operations.
//!
//! Every variant carries enough identity (entity name plus key, or rule plus
//! entity) to be actionable without inspecting SQL. The whole enum is `Clone`
//! so a single failure of a coalesced statement can be delivered to every
//! request that was folded into it.

use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// Load of a missing key.
    NotFound {
        /// Entity name.
        entity: &'static str,
        /// Rendered key value.
        key: String,
    },
    /// A uniqueness-expecting find matched more than one row.
    TooMany {
        /// Entity name.
        entity: &'static str,
        /// Number of rows matched.
        matched: usize,
    },
    /// Aggregated validation failures, reported together.
    Validation(ValidationFailed),
    /// Optimistic-lock precondition failed on update.
    StaleWrite {
        /// Entity name.
        entity: &'static str,
        /// Rendered key value.
        key: String,
    },
    /// A flush was requested while one is already in flight.
    ConcurrentFlush,
    /// Illegal mutation of tracked state while a flush is in progress.
    MutationDuringFlush {
        /// Entity name.
        entity: &'static str,
    },
    /// Passthrough from the store, including serialization failures.
    Driver(DriverError),
    /// Operating on an entity in the wrong lifecycle state, or an unloaded
    /// relation accessed through a must-be-loaded accessor.
    InvalidState {
        /// Entity name.
        entity: &'static str,
        /// What went wrong.
        detail: String,
    },
    /// Metadata registry construction failure (unknown names, broken inverse
    /// pairing, reactive-rule cycles).
    Metadata(String),
}

/// An error reported by the underlying store driver.
#[derive(Debug, Clone)]
pub struct DriverError {
    /// Human-readable message.
    pub message: String,
    /// SQLSTATE if the driver surfaced one (e.g. "40001").
    pub sqlstate: Option<String>,
    /// True for could-not-serialize-access conditions under serializable
    /// isolation; the caller may retry the whole unit of work.
    pub serialization: bool,
}

impl DriverError {
    /// Create a plain driver error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
            serialization: false,
        }
    }

    /// Create a serialization-failure driver error (retryable).
    pub fn serialization(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: Some("40001".to_string()),
            serialization: true,
        }
    }

    /// Attach a SQLSTATE code.
    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    /// Is this a deadlock condition?
    pub fn is_deadlock(&self) -> bool {
        self.sqlstate.as_deref() == Some("40P01")
    }
}

/// Aggregated validation failures from one flush attempt.
///
/// Rule failures are collected, not short-circuited, so a flush reports every
/// violated rule at once.
#[derive(Debug, Clone, Default)]
pub struct ValidationFailed {
    /// The individual violations.
    pub violations: Vec<RuleViolation>,
}

/// A single violated validation rule.
#[derive(Debug, Clone)]
pub struct RuleViolation {
    /// Name of the rule (or field check) that failed.
    pub rule: &'static str,
    /// Entity name the violation is on.
    pub entity: &'static str,
    /// Rendered key of the offending instance.
    pub key: String,
    /// Human-readable message.
    pub message: String,
}

impl ValidationFailed {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there are any violations.
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Record a violation.
    pub fn push(
        &mut self,
        rule: &'static str,
        entity: &'static str,
        key: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.violations.push(RuleViolation {
            rule,
            entity,
            key: key.into(),
            message: message.into(),
        });
    }

    /// Convert to Result, returning `Ok(())` if no violations.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl Error {
    /// Shorthand for a driver error with just a message.
    pub fn driver(message: impl Into<String>) -> Self {
        Error::Driver(DriverError::new(message))
    }

    /// Shorthand for an invalid-state error.
    pub fn invalid_state(entity: &'static str, detail: impl Into<String>) -> Self {
        Error::InvalidState {
            entity,
            detail: detail.into(),
        }
    }

    /// Is this a retryable condition (serialization failure, deadlock)?
    ///
    /// Retry is always the caller's decision; the core never retries
    /// automatically.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Driver(d) => d.serialization || d.is_deadlock(),
            _ => false,
        }
    }

    /// Is this a validation failure?
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Get SQLSTATE if available.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Driver(d) => d.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound { entity, key } => {
                write!(f, "{} with key {} not found", entity, key)
            }
            Error::TooMany { entity, matched } => {
                write!(f, "expected at most one {}, matched {}", entity, matched)
            }
            Error::Validation(v) => write!(f, "{}", v),
            Error::StaleWrite { entity, key } => {
                write!(f, "stale write: {} with key {} was modified concurrently", entity, key)
            }
            Error::ConcurrentFlush => write!(f, "flush already in progress"),
            Error::MutationDuringFlush { entity } => {
                write!(f, "cannot mutate {} during flush", entity)
            }
            Error::Driver(d) => {
                if let Some(state) = &d.sqlstate {
                    write!(f, "driver error (SQLSTATE {}): {}", state, d.message)
                } else {
                    write!(f, "driver error: {}", d.message)
                }
            }
            Error::InvalidState { entity, detail } => {
                write!(f, "invalid state on {}: {}", entity, detail)
            }
            Error::Metadata(msg) => write!(f, "metadata error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.violations.is_empty() {
            write!(f, "validation passed")
        } else if self.violations.len() == 1 {
            let v = &self.violations[0];
            write!(
                f,
                "validation failed: {} on {}({}): {}",
                v.rule, v.entity, v.key, v.message
            )
        } else {
            writeln!(f, "validation failed ({} violations):", self.violations.len())?;
            for v in &self.violations {
                writeln!(f, "  - {} on {}({}): {}", v.rule, v.entity, v.key, v.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationFailed {}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

impl From<ValidationFailed> for Error {
    fn from(err: ValidationFailed) -> Self {
        Error::Validation(err)
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let ser = Error::Driver(DriverError::serialization("could not serialize access"));
        assert!(ser.is_retryable());
        assert_eq!(ser.sqlstate(), Some("40001"));

        let deadlock = Error::Driver(DriverError::new("deadlock").with_sqlstate("40P01"));
        assert!(deadlock.is_retryable());

        let plain = Error::driver("syntax error");
        assert!(!plain.is_retryable());

        let not_found = Error::NotFound {
            entity: "Author",
            key: "1".to_string(),
        };
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn validation_aggregates() {
        let mut report = ValidationFailed::new();
        assert!(report.is_empty());
        report.push("title_required", "Book", "3", "title must not be empty");
        report.push("positive_price", "Book", "3", "price must be positive");

        let err = report.clone().into_result().unwrap_err();
        assert!(err.is_validation());
        let rendered = err.to_string();
        assert!(rendered.contains("2 violations"));
        assert!(rendered.contains("title_required"));
        assert!(rendered.contains("positive_price"));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = Error::StaleWrite {
            entity: "Book",
            key: "7".to_string(),
        };
        let copy = err.clone();
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn display_carries_identity() {
        let err = Error::NotFound {
            entity: "Author",
            key: "42".to_string(),
        };
        assert_eq!(err.to_string(), "Author with key 42 not found");

        let err = Error::MutationDuringFlush { entity: "Book" };
        assert!(err.to_string().contains("Book"));
    }
}
