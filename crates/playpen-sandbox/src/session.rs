//! The sandbox session: configuration, shared running state and collaborators.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::audit::{AuditLogger, NoopAuditLogger};
use crate::environment::ExecutionEnvironment;
use crate::error::SandboxError;
#[cfg(feature = "metrics")]
use crate::metrics::SandboxMetrics;
use crate::orchestrator::AcceptedScript;
use crate::{SharedHost, SilentSound, SoundCue, StatusSink, TracingStatus};

/// Names of the functions a level script may declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointNames {
    /// Required setup function, called with the level object.
    pub setup: String,
    /// Optional post-check, re-run after every callback.
    pub post_check: String,
    /// Optional exit hook.
    pub exit_hook: String,
    /// Optional objective predicate.
    pub objective: String,
}

impl Default for EntryPointNames {
    fn default() -> Self {
        Self {
            setup: "startLevel".into(),
            post_check: "validateLevel".into(),
            exit_hook: "onExit".into(),
            objective: "objective".into(),
        }
    }
}

/// Configuration for a sandbox session.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum time a single loop may run before it throws.
    pub allowed_time: Duration,
    /// Maximum level script size in bytes.
    pub max_code_size: usize,
    /// Maximum interpreter call depth.
    pub recursion_limit: usize,
    /// Maximum interpreter value-stack size.
    pub stack_size_limit: usize,
    /// Entry-point names.
    pub entry_points: EntryPointNames,
    /// Log instrumented sources at debug level.
    pub debug_transformed: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_time: Duration::from_millis(2000),
            max_code_size: crate::validator::DEFAULT_MAX_CODE_SIZE,
            recursion_limit: 512,
            stack_size_limit: 1024 * 10,
            entry_points: EntryPointNames::default(),
            debug_transformed: false,
        }
    }
}

/// Where a submission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Typed or edited by the player.
    Fresh,
    /// Re-run from a saved good state after the game scripts were edited.
    RestartFromScript,
}

/// A previously accepted `{code, playerCode}` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    /// Whole level script.
    pub code: String,
    /// The player-editable part of it.
    #[serde(rename = "playerCode")]
    pub player_code: String,
}

/// A level script submitted for validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Whole level script, including the level author's code.
    pub code: String,
    /// The player-editable part, which the lexical guard screens.
    pub player_code: String,
    /// Where the submission came from.
    pub provenance: Provenance,
}

impl Submission {
    /// A fresh submission from the editor.
    pub fn fresh(code: impl Into<String>, player_code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            player_code: player_code.into(),
            provenance: Provenance::Fresh,
        }
    }

    /// A restart from a saved good state.
    pub fn restart(saved: &SavedState) -> Self {
        Self {
            code: saved.code.clone(),
            player_code: saved.player_code.clone(),
            provenance: Provenance::RestartFromScript,
        }
    }

    pub(crate) fn saved_state(&self) -> SavedState {
        SavedState {
            code: self.code.clone(),
            player_code: self.player_code.clone(),
        }
    }
}

/// State shared between the session and the native functions of the
/// current execution environment.
pub(crate) struct SessionShared {
    running: Cell<bool>,
    fault: RefCell<Option<SandboxError>>,
    start_reached: Cell<bool>,
    end_reached: Cell<bool>,
    epoch: Instant,
    budget: Duration,
}

impl SessionShared {
    pub(crate) fn new(budget: Duration) -> Self {
        Self {
            running: Cell::new(false),
            fault: RefCell::new(None),
            start_reached: Cell::new(false),
            end_reached: Cell::new(false),
            epoch: Instant::now(),
            budget,
        }
    }

    /// True exactly while untrusted code is on the call stack.
    pub(crate) fn is_running(&self) -> bool {
        self.running.get()
    }

    pub(crate) fn force_stopped(&self) {
        self.running.set(false);
    }

    /// Record a violation; the first one wins until it is taken.
    pub(crate) fn record_fault(&self, fault: SandboxError) {
        let mut slot = self.fault.borrow_mut();
        if slot.is_none() {
            *slot = Some(fault);
        }
    }

    pub(crate) fn take_fault(&self) -> Option<SandboxError> {
        self.fault.borrow_mut().take()
    }

    /// Text of the recorded violation, if one is waiting to be taken.
    pub(crate) fn pending_fault_message(&self) -> Option<String> {
        self.fault.borrow().as_ref().map(ToString::to_string)
    }

    pub(crate) fn mark_start_reached(&self) {
        self.start_reached.set(true);
    }

    pub(crate) fn mark_end_reached(&self) {
        self.end_reached.set(true);
    }

    pub(crate) fn reset_markers(&self) {
        self.start_reached.set(false);
        self.end_reached.set(false);
    }

    /// `(start reached, end reached)`.
    pub(crate) fn markers(&self) -> (bool, bool) {
        (self.start_reached.get(), self.end_reached.get())
    }

    /// Milliseconds on a monotonic clock.
    pub(crate) fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    pub(crate) fn budget_ms(&self) -> u64 {
        self.budget.as_millis() as u64
    }
}

/// Holds the running state for the lifetime of the guard.
pub(crate) struct RunningGuard<'a> {
    shared: &'a SessionShared,
}

impl<'a> RunningGuard<'a> {
    pub(crate) fn engage(shared: &'a SessionShared) -> Self {
        shared.running.set(true);
        Self { shared }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.shared.running.set(false);
    }
}

/// One level's sandbox: validates submissions and guards later callbacks.
///
/// Everything that the validation pipeline and the callback guard share
/// lives here, so there is no process-wide state.
pub struct SandboxSession {
    pub(crate) config: SandboxConfig,
    pub(crate) shared: Rc<SessionShared>,
    pub(crate) live: SharedHost,
    pub(crate) status: Rc<dyn StatusSink>,
    pub(crate) sound: Rc<dyn SoundCue>,
    pub(crate) audit: Arc<dyn AuditLogger>,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Option<Arc<SandboxMetrics>>,
    pub(crate) environment: Option<ExecutionEnvironment>,
    pub(crate) accepted: Option<AcceptedScript>,
    pub(crate) good_state: Option<SavedState>,
    pub(crate) admin_override: bool,
    pub(crate) failed_closed: bool,
    pub(crate) attempts: u64,
}

impl SandboxSession {
    /// Create a session for the given live level.
    pub fn new(config: SandboxConfig, live: SharedHost) -> Self {
        let shared = Rc::new(SessionShared::new(config.allowed_time));
        Self {
            config,
            shared,
            live,
            status: Rc::new(TracingStatus),
            sound: Rc::new(SilentSound),
            audit: Arc::new(NoopAuditLogger),
            #[cfg(feature = "metrics")]
            metrics: None,
            environment: None,
            accepted: None,
            good_state: None,
            admin_override: false,
            failed_closed: false,
            attempts: 0,
        }
    }

    /// Route status output to `status`.
    pub fn with_status(mut self, status: Rc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    /// Route sound cues to `sound`.
    pub fn with_sound(mut self, sound: Rc<dyn SoundCue>) -> Self {
        self.sound = sound;
        self
    }

    /// Write an audit entry for every validation and fail-closed callback.
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Record validation and callback metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The session configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The live level host.
    pub fn live(&self) -> &SharedHost {
        &self.live
    }

    /// Whether untrusted code is currently executing.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether a script has been accepted and can be driven.
    pub fn has_accepted_script(&self) -> bool {
        self.accepted.is_some()
    }

    /// The last accepted submission, for restarts.
    pub fn good_state(&self) -> Option<&SavedState> {
        self.good_state.as_ref()
    }

    /// Turn tamper detection off for the rest of the session.
    ///
    /// Only the host can call this. The privileged property guard stays on.
    pub fn set_admin_override(&mut self) {
        tracing::warn!("administrative override active, tamper detection disabled");
        self.admin_override = true;
    }

    /// Whether a callback failed the level closed since the last acceptance.
    pub fn has_failed_closed(&self) -> bool {
        self.failed_closed
    }

    /// Whether the administrative override is active.
    pub fn admin_override(&self) -> bool {
        self.admin_override
    }

    pub(crate) fn record_validation_metrics(&self, _error: Option<&SandboxError>, _secs: f64) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            match _error {
                None => metrics.record_validation("accepted", _secs),
                Some(err) => {
                    metrics.record_validation("rejected", _secs);
                    metrics.record_rejection(err.kind());
                }
            }
        }
    }

    pub(crate) fn record_callback_failure_metric(&self, _stage: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_callback_failure(_stage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_guard_clears_on_drop() {
        let shared = SessionShared::new(Duration::from_millis(10));
        {
            let _guard = RunningGuard::engage(&shared);
            assert!(shared.is_running());
        }
        assert!(!shared.is_running());
    }

    #[test]
    fn running_guard_clears_on_panic_unwind() {
        let shared = SessionShared::new(Duration::from_millis(10));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = RunningGuard::engage(&shared);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!shared.is_running());
    }

    #[test]
    fn first_fault_wins() {
        let shared = SessionShared::new(Duration::from_millis(10));
        shared.record_fault(SandboxError::Timeout {
            line: 1,
            budget_ms: 10,
        });
        shared.record_fault(SandboxError::NoAcceptedScript);
        assert!(matches!(
            shared.take_fault(),
            Some(SandboxError::Timeout { line: 1, .. })
        ));
        assert!(shared.take_fault().is_none());
    }

    #[test]
    fn pending_fault_is_visible_until_taken() {
        let shared = SessionShared::new(Duration::from_millis(10));
        assert!(shared.pending_fault_message().is_none());
        shared.record_fault(SandboxError::Timeout {
            line: 2,
            budget_ms: 10,
        });
        assert_eq!(
            shared.pending_fault_message().as_deref(),
            Some("[Line 2] TimeOutException: Maximum loop execution time of 10 ms exceeded.")
        );
        shared.take_fault();
        assert!(shared.pending_fault_message().is_none());
    }

    #[test]
    fn markers_reset() {
        let shared = SessionShared::new(Duration::from_millis(10));
        shared.mark_start_reached();
        shared.mark_end_reached();
        assert_eq!(shared.markers(), (true, true));
        shared.reset_markers();
        assert_eq!(shared.markers(), (false, false));
    }

    #[test]
    fn default_entry_points() {
        let names = EntryPointNames::default();
        assert_eq!(names.setup, "startLevel");
        assert_eq!(names.post_check, "validateLevel");
        assert_eq!(names.exit_hook, "onExit");
        assert_eq!(names.objective, "objective");
    }

    #[test]
    fn saved_state_uses_player_code_key() {
        let saved: SavedState =
            serde_json::from_str(r#"{"code": "x", "playerCode": "y"}"#).unwrap();
        let submission = Submission::restart(&saved);
        assert_eq!(submission.provenance, Provenance::RestartFromScript);
        assert_eq!(submission.player_code, "y");
        assert_eq!(submission.saved_state(), saved);
    }
}
