//! Error types for the playpen sandbox.

use std::fmt;

use playpen_error::HostError;
use thiserror::Error;

/// How a privileged member was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// A private member was read.
    Read,
    /// A private member was assigned.
    Write,
    /// A host operation refused to run in the current state.
    Call,
}

/// Which lifecycle guarantee a submission broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleViolation {
    /// The setup function never signalled that it started.
    SetupTampered,
    /// The setup function started but never signalled that it finished.
    ReturnedPrematurely,
    /// The post-check function changed between the two dummy runs.
    PostCheckTampered,
    /// The exit hook changed between the two dummy runs.
    ExitHookTampered,
}

/// Errors that can occur while validating or running a level script.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// The player-editable code contains a forbidden token.
    #[error("You are not allowed to use '{token}'!")]
    ForbiddenToken {
        /// The token that was matched.
        token: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The source uses an identifier reserved for instrumentation.
    #[error("identifiers starting with '{prefix}' are reserved")]
    ReservedIdentifier {
        /// The reserved prefix.
        prefix: String,
    },

    /// Brackets are nested deeper than the parser is allowed to go.
    #[error("nesting depth {actual} exceeds maximum {max}")]
    NestingTooDeep {
        /// Maximum allowed nesting depth.
        max: usize,
        /// Detected nesting depth.
        actual: usize,
    },

    /// The script does not parse.
    #[error("SyntaxError: {message}")]
    Syntax {
        /// Parser message.
        message: String,
        /// 1-based line of the failure, when known.
        line: Option<usize>,
    },

    /// A loop ran past the allowed time budget.
    #[error("{}", timeout_message(*line, *budget_ms))]
    Timeout {
        /// 1-based source line of the loop, or 0 inside a built-in helper.
        line: usize,
        /// Budget in milliseconds.
        budget_ms: u64,
    },

    /// A trusted operation no longer refers to its original implementation.
    #[error("{name}() has been tampered with!")]
    TamperedFunction {
        /// The operation name.
        name: String,
    },

    /// Untrusted code touched a privileged member while running.
    #[error("{}", privileged_message(*access, name))]
    PrivilegedAccess {
        /// Read, write or forbidden call.
        access: AccessKind,
        /// Member or operation name.
        name: String,
    },

    /// The setup function or an optional hook did not behave as declared.
    #[error("{}", lifecycle_message(*kind, entry))]
    Lifecycle {
        /// What went wrong.
        kind: LifecycleViolation,
        /// The entry-point name involved.
        entry: String,
    },

    /// The script does not declare its setup function.
    #[error("{name}() is not defined")]
    MissingEntryPoint {
        /// Expected function name.
        name: String,
    },

    /// The script threw an exception.
    #[error("{message}")]
    Script {
        /// The exception text.
        message: String,
    },

    /// A host operation failed outside of script execution.
    #[error("host operation failed: {0}")]
    Host(String),

    /// The interpreter failed while preparing the environment.
    #[error("sandbox engine failure: {0}")]
    Engine(String),

    /// No script has been accepted yet.
    #[error("no level script has been accepted")]
    NoAcceptedScript,

    /// An entry point from an earlier validation attempt was used.
    #[error("entry point belongs to an earlier validation attempt")]
    StaleEntryPoint,
}

fn timeout_message(line: usize, budget_ms: u64) -> String {
    let text = format!("TimeOutException: Maximum loop execution time of {budget_ms} ms exceeded.");
    if line == 0 {
        text
    } else {
        format!("[Line {line}] {text}")
    }
}

fn privileged_message(access: AccessKind, name: &str) -> String {
    match access {
        AccessKind::Read => format!("Attempt to read private property {name}"),
        AccessKind::Write => format!("Attempt to modify private property {name}"),
        AccessKind::Call => format!("Forbidden method call: {name}()"),
    }
}

fn lifecycle_message(kind: LifecycleViolation, entry: &str) -> String {
    match kind {
        LifecycleViolation::ReturnedPrematurely => format!("{entry}() returned prematurely!"),
        LifecycleViolation::SetupTampered
        | LifecycleViolation::PostCheckTampered
        | LifecycleViolation::ExitHookTampered => format!("{entry}() has been tampered with!"),
    }
}

impl From<HostError> for SandboxError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Forbidden { op } => Self::PrivilegedAccess {
                access: AccessKind::Call,
                name: op,
            },
            other => Self::Host(other.to_string()),
        }
    }
}

impl SandboxError {
    /// Stable snake_case label for audit records and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ForbiddenToken { .. } => "forbidden_token",
            Self::CodeTooLarge { .. } => "code_too_large",
            Self::ReservedIdentifier { .. } => "reserved_identifier",
            Self::NestingTooDeep { .. } => "nesting_too_deep",
            Self::Syntax { .. } => "syntax",
            Self::Timeout { .. } => "timeout",
            Self::TamperedFunction { .. } => "tampered_function",
            Self::PrivilegedAccess { .. } => "privileged_access",
            Self::Lifecycle { .. } => "lifecycle",
            Self::MissingEntryPoint { .. } => "missing_entry_point",
            Self::Script { .. } => "script",
            Self::Host(_) => "host",
            Self::Engine(_) => "engine",
            Self::NoAcceptedScript => "no_accepted_script",
            Self::StaleEntryPoint => "stale_entry_point",
        }
    }

    /// Whether this is one of the three privileged-access classes.
    pub fn is_privileged_access(&self) -> bool {
        matches!(self, Self::PrivilegedAccess { .. })
    }

    /// Source line the error points at, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Syntax { line, .. } => *line,
            Self::Timeout { line, .. } => Some(*line).filter(|line| *line > 0),
            _ => None,
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
            Self::Call => f.write_str("call"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_token_message_names_token() {
        let err = SandboxError::ForbiddenToken {
            token: "constructor".into(),
        };
        assert_eq!(err.to_string(), "You are not allowed to use 'constructor'!");
    }

    #[test]
    fn timeout_message_carries_line_and_budget() {
        let err = SandboxError::Timeout {
            line: 3,
            budget_ms: 2000,
        };
        assert_eq!(
            err.to_string(),
            "[Line 3] TimeOutException: Maximum loop execution time of 2000 ms exceeded."
        );
        assert_eq!(err.line(), Some(3));
    }

    #[test]
    fn helper_timeout_has_no_line() {
        let err = SandboxError::Timeout {
            line: 0,
            budget_ms: 50,
        };
        assert_eq!(
            err.to_string(),
            "TimeOutException: Maximum loop execution time of 50 ms exceeded."
        );
        assert_eq!(err.line(), None);
    }

    #[test]
    fn privileged_messages_cover_three_classes() {
        let read = SandboxError::PrivilegedAccess {
            access: AccessKind::Read,
            name: "_canMove".into(),
        };
        let write = SandboxError::PrivilegedAccess {
            access: AccessKind::Write,
            name: "_canMove".into(),
        };
        let call = SandboxError::PrivilegedAccess {
            access: AccessKind::Call,
            name: "placePlayer".into(),
        };
        assert_eq!(read.to_string(), "Attempt to read private property _canMove");
        assert_eq!(write.to_string(), "Attempt to modify private property _canMove");
        assert_eq!(call.to_string(), "Forbidden method call: placePlayer()");
        assert!(read.is_privileged_access());
        assert!(call.is_privileged_access());
    }

    #[test]
    fn lifecycle_messages() {
        let early = SandboxError::Lifecycle {
            kind: LifecycleViolation::ReturnedPrematurely,
            entry: "startLevel".into(),
        };
        let swapped = SandboxError::Lifecycle {
            kind: LifecycleViolation::PostCheckTampered,
            entry: "validateLevel".into(),
        };
        assert_eq!(early.to_string(), "startLevel() returned prematurely!");
        assert_eq!(swapped.to_string(), "validateLevel() has been tampered with!");
    }

    #[test]
    fn forbidden_host_error_becomes_privileged_call() {
        let err: SandboxError = HostError::Forbidden {
            op: "placePlayer".into(),
        }
        .into();
        assert!(matches!(
            err,
            SandboxError::PrivilegedAccess {
                access: AccessKind::Call,
                ..
            }
        ));

        let err: SandboxError = HostError::Failed("nope".into()).into();
        assert_eq!(err.kind(), "host");
    }
}
