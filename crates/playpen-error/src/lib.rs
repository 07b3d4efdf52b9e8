//! Typed error type for playpen capability hosts.
//!
//! Provides [`HostError`], the error returned by every `LevelHost` operation.
//! The sandbox turns it into a script-visible exception, except for
//! [`HostError::Forbidden`], which it treats as a privileged-access violation.

use thiserror::Error;

/// Canonical error type for capability-host operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// The requested operation does not exist on this kind of capability object.
    #[error("unknown operation: {op}()")]
    UnknownOperation {
        /// Operation name as called by the script.
        op: String,
    },

    /// An argument was missing or had the wrong shape.
    #[error("{op}(): {reason}")]
    InvalidArgument {
        /// Operation name as called by the script.
        op: String,
        /// What was wrong with the argument.
        reason: String,
    },

    /// The operation is not permitted in the current state of the level.
    ///
    /// The sandbox reports this as a forbidden method call and fails the
    /// level closed when it happens inside a callback.
    #[error("Forbidden method call: {op}()")]
    Forbidden {
        /// Operation name as called by the script.
        op: String,
    },

    /// A level-defined check failed (e.g. not enough objects on the map).
    #[error("{0}")]
    Failed(String),

    /// A private member was written with a value of the wrong type.
    #[error("private property {name} cannot hold {value}")]
    PrivateValue {
        /// Private member name, including the leading underscore.
        name: String,
        /// The rejected value.
        value: serde_json::Value,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HostError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownOperation { .. } => "UNKNOWN_OPERATION",
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Failed(_) => "FAILED",
            Self::PrivateValue { .. } => "PRIVATE_VALUE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Shorthand for [`HostError::InvalidArgument`].
    pub fn invalid(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op: op.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must be treated as a privileged-access violation.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            HostError::UnknownOperation { op: "fly".into() }.code(),
            "UNKNOWN_OPERATION"
        );
        assert_eq!(HostError::invalid("move", "bad").code(), "INVALID_ARGUMENT");
        assert_eq!(
            HostError::Forbidden {
                op: "placePlayer".into()
            }
            .code(),
            "FORBIDDEN"
        );
        assert_eq!(HostError::Failed("nope".into()).code(), "FAILED");
        assert_eq!(
            HostError::Internal(anyhow::anyhow!("boom")).code(),
            "INTERNAL"
        );
    }

    #[test]
    fn forbidden_message_matches_script_wording() {
        let err = HostError::Forbidden {
            op: "placePlayer".into(),
        };
        assert_eq!(err.to_string(), "Forbidden method call: placePlayer()");
        assert!(err.is_forbidden());
    }

    #[test]
    fn failed_message_is_passed_through() {
        let err = HostError::Failed("Not enough trees on the map!".into());
        assert_eq!(err.to_string(), "Not enough trees on the map!");
        assert!(!err.is_forbidden());
    }

    #[test]
    fn invalid_argument_names_the_operation() {
        let err = HostError::invalid("placeObject", "x is out of bounds");
        assert_eq!(err.to_string(), "placeObject(): x is out of bounds");
    }

    #[test]
    fn internal_is_transparent() {
        let err: HostError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.to_string(), "disk on fire");
    }
}
