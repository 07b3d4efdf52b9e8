//! Audit logging for validation attempts and fail-closed callbacks.
//!
//! Every validation attempt and every callback that fails the level closed
//! emits an [`AuditEntry`] containing:
//! - Entry ID (UUID)
//! - SHA-256 hash of the level script
//! - A preview of the first 500 bytes of the script
//! - Provenance, outcome, duration and instrumented loop count
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `Write`.

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::SandboxError;
use crate::session::Provenance;

/// Maximum length of the code preview in audit entries.
const CODE_PREVIEW_MAX: usize = 500;

/// A complete audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Unique entry identifier.
    pub id: String,
    /// When the attempt started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 hash of the level script.
    pub code_hash: String,
    /// First bytes of the script, for human review.
    pub code_preview: String,
    /// Where the script came from.
    pub provenance: Provenance,
    /// What was audited.
    pub event: AuditEvent,
    /// Final outcome.
    pub outcome: AuditOutcome,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Number of loops carrying a deadline check.
    pub loops_instrumented: usize,
}

/// The audited event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
#[non_exhaustive]
pub enum AuditEvent {
    /// A validation attempt.
    Validation,
    /// A callback that failed the level closed.
    CallbackFailure {
        /// "privileged_access", "post_check" or "tamper_detection".
        stage: &'static str,
    },
}

/// Outcome of the audited event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The script was accepted.
    Accepted,
    /// The script was rejected, or the callback failed.
    Rejected {
        /// `SandboxError::kind()`.
        kind: String,
        /// The error message.
        message: String,
    },
}

/// Trait for audit log backends.
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to a `Write` sink.
pub struct JsonLinesAuditLogger<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesAuditLogger<W> {
    /// Create a new JSON lines audit logger writing to the given sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consume the logger and return the sink.
    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> AuditLogger for JsonLinesAuditLogger<W> {
    fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.write_all(line.as_bytes()) {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush();
    }
}

/// Compute the SHA-256 hash of a string, returned as a hex string.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut s = String::with_capacity(digest.len() * 2);
    for b in digest {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Create a code preview (first N bytes, with ellipsis if truncated).
///
/// Truncates at a valid UTF-8 char boundary.
pub fn code_preview(code: &str) -> String {
    if code.len() <= CODE_PREVIEW_MAX {
        return code.to_string();
    }
    let mut end = CODE_PREVIEW_MAX;
    while !code.is_char_boundary(end) {
        end -= 1;
    }
    let mut preview = code[..end].to_string();
    preview.push_str("...");
    preview
}

/// Builder for audit entries.
pub struct AuditEntryBuilder {
    id: String,
    timestamp: DateTime<Utc>,
    code_hash: String,
    code_preview: String,
    provenance: Provenance,
    event: AuditEvent,
    start: Instant,
    duration: Option<Duration>,
    loops_instrumented: usize,
}

impl AuditEntryBuilder {
    /// Start an entry for `code`.
    pub fn new(code: &str, provenance: Provenance, event: AuditEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            code_hash: sha256_hex(code),
            code_preview: code_preview(code),
            provenance,
            event,
            start: Instant::now(),
            duration: None,
            loops_instrumented: 0,
        }
    }

    /// Record how many loops were instrumented.
    pub fn loops_instrumented(&mut self, loops: usize) {
        self.loops_instrumented = loops;
    }

    /// Use a measured duration instead of the time since [`AuditEntryBuilder::new`].
    pub fn duration(&mut self, duration: Duration) {
        self.duration = Some(duration);
    }

    /// Finalize the entry.
    pub fn finish(self, error: Option<&SandboxError>) -> AuditEntry {
        let duration = self.duration.unwrap_or_else(|| self.start.elapsed());
        let outcome = match error {
            None => AuditOutcome::Accepted,
            Some(err) => AuditOutcome::Rejected {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        };
        AuditEntry {
            id: self.id,
            timestamp: self.timestamp,
            code_hash: self.code_hash,
            code_preview: self.code_preview,
            provenance: self.provenance,
            event: self.event,
            outcome,
            duration_ms: duration.as_millis() as u64,
            loops_instrumented: self.loops_instrumented,
        }
    }
}

/// A no-op audit logger for when auditing is not needed.
pub struct NoopAuditLogger;

impl AuditLogger for NoopAuditLogger {
    fn log(&self, _entry: &AuditEntry) {}
}

/// An audit logger that emits structured events via [`tracing`].
///
/// Entries are logged at `INFO` level with `audit = true` for filtering.
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, entry: &AuditEntry) {
        let (outcome, kind) = match &entry.outcome {
            AuditOutcome::Accepted => ("accepted", ""),
            AuditOutcome::Rejected { kind, .. } => ("rejected", kind.as_str()),
        };
        tracing::info!(
            audit = true,
            id = %entry.id,
            event = ?entry.event,
            provenance = ?entry.provenance,
            code_hash = %entry.code_hash,
            duration_ms = entry.duration_ms,
            loops = entry.loops_instrumented,
            outcome,
            error_kind = kind,
            "audit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(error: Option<&SandboxError>) -> AuditEntry {
        let mut builder = AuditEntryBuilder::new(
            "function startLevel(map) {}",
            Provenance::Fresh,
            AuditEvent::Validation,
        );
        builder.loops_instrumented(2);
        builder.finish(error)
    }

    #[test]
    fn sha256_hex_produces_correct_hash() {
        assert_eq!(
            sha256_hex("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn code_preview_long_code_truncated() {
        let preview = code_preview(&"x".repeat(1000));
        assert_eq!(preview.len(), 503);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn code_preview_multibyte_boundary() {
        let mut code = "a".repeat(499);
        code.push('\u{1F600}');
        code.push_str(&"b".repeat(100));
        let preview = code_preview(&code);
        assert!(preview.starts_with(&"a".repeat(499)));
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn accepted_entry() {
        let entry = entry(None);
        assert!(matches!(entry.outcome, AuditOutcome::Accepted));
        assert_eq!(entry.loops_instrumented, 2);
        assert!(Uuid::parse_str(&entry.id).is_ok());
        assert_eq!(entry.code_hash.len(), 64);
    }

    #[test]
    fn rejected_entry_carries_kind() {
        let err = SandboxError::ForbiddenToken {
            token: "apply".into(),
        };
        match entry(Some(&err)).outcome {
            AuditOutcome::Rejected { kind, message } => {
                assert_eq!(kind, "forbidden_token");
                assert!(message.contains("apply"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn json_lines_logger_writes_valid_json() {
        let logger = JsonLinesAuditLogger::new(Vec::new());
        logger.log(&entry(None));
        let mut builder = AuditEntryBuilder::new(
            "x",
            Provenance::RestartFromScript,
            AuditEvent::CallbackFailure { stage: "post_check" },
        );
        builder.duration(Duration::from_millis(7));
        logger.log(&builder.finish(Some(&SandboxError::NoAcceptedScript)));

        let output = String::from_utf8(logger.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"], "accepted");
        assert_eq!(lines[0]["provenance"], "fresh");
        assert_eq!(lines[0]["event"]["type"], "validation");
        assert_eq!(lines[1]["event"]["stage"], "post_check");
        assert_eq!(lines[1]["duration_ms"], 7);
        assert_eq!(lines[1]["outcome"]["rejected"]["kind"], "no_accepted_script");
        assert!(lines[0].get("code").is_none());
    }

    #[test]
    fn tracing_logger_does_not_panic() {
        TracingAuditLogger.log(&entry(None));
    }
}
