//! Validation orchestrator.
//!
//! Drives a submission through the lexical guard, the loop instrumenter, a
//! fresh execution environment and two runs of its setup function against a
//! dummy level. Only a submission that survives every step replaces the
//! session's accepted script.

use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use boa_engine::{JsObject, JsValue};

use crate::audit::{AuditEntryBuilder, AuditEvent};
use crate::callback::CallbackOptions;
use crate::capability::Instance;
use crate::environment::{locate_syntax_error, ExecutionEnvironment};
use crate::error::{LifecycleViolation, SandboxError};
use crate::instrument::instrument;
use crate::session::{Provenance, RunningGuard, SandboxSession, SavedState, Submission};
use crate::validator::{check_size, screen_source};

/// States of a validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    /// Nothing checked yet.
    Idle,
    /// The player code passed the lexical guard.
    LexicalChecked,
    /// Every loop carries a deadline check.
    Transformed,
    /// The script was evaluated in a fresh environment.
    Evaluated,
    /// Setup ran once against the dummy level.
    FirstRunDone,
    /// Setup ran a second time and its timers were cancelled.
    SecondRunDone,
    /// The submission replaced the accepted script.
    Accepted,
    /// The submission was refused.
    Rejected,
}

impl ValidationState {
    /// Short label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LexicalChecked => "lexical_checked",
            Self::Transformed => "transformed",
            Self::Evaluated => "evaluated",
            Self::FirstRunDone => "first_run_done",
            Self::SecondRunDone => "second_run_done",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// The underlying failure.
    pub error: SandboxError,
    /// 1-based source line, when one could be determined.
    pub line: Option<usize>,
    /// Last state reached before the failure.
    pub stage: ValidationState,
    message: String,
}

impl Rejection {
    fn new(error: SandboxError, line: Option<usize>, stage: ValidationState) -> Self {
        let message = match (line, &error) {
            // the timeout text already starts with its line
            (Some(line), err) if !matches!(err, SandboxError::Timeout { .. }) => {
                format!("[Line {line}] {err}")
            }
            (_, err) => err.to_string(),
        };
        Self {
            error,
            line,
            stage,
            message,
        }
    }

    /// The text shown to the player.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Rejection {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The setup function of an accepted script, to be run against the live level.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    function: JsObject,
    generation: u64,
}

impl EntryPoint {
    /// Which validation attempt produced this entry point.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Entry points of the accepted script. Undeclared hooks use their defaults.
pub(crate) struct AcceptedScript {
    pub(crate) post_check: Option<JsObject>,
    pub(crate) exit_hook: Option<JsObject>,
    pub(crate) objective: Option<JsObject>,
    pub(crate) generation: u64,
    pub(crate) provenance: Provenance,
    pub(crate) loops: usize,
}

struct Progress {
    state: ValidationState,
    loops: usize,
    generation: u64,
}

impl Progress {
    fn advance(&mut self, next: ValidationState) {
        tracing::debug!(
            attempt = self.generation,
            from = %self.state,
            to = %next,
            "validation transition"
        );
        self.state = next;
    }
}

fn same_hook(a: &Option<JsObject>, b: &Option<JsObject>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => JsObject::equals(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl SandboxSession {
    /// Validate a submission and, on success, make it the accepted script.
    ///
    /// A rejected submission leaves the previously accepted script in place.
    pub fn validate(&mut self, submission: &Submission) -> Result<EntryPoint, Rejection> {
        self.attempts += 1;
        let started = Instant::now();
        let mut progress = Progress {
            state: ValidationState::Idle,
            loops: 0,
            generation: self.attempts,
        };

        let outcome = self.run_validation(submission, &mut progress);
        let elapsed = started.elapsed();

        match outcome {
            Ok((environment, setup, mut accepted)) => {
                progress.advance(ValidationState::Accepted);
                accepted.loops = progress.loops;
                let entry = EntryPoint {
                    function: setup,
                    generation: progress.generation,
                };
                self.environment = Some(environment);
                self.accepted = Some(accepted);
                self.failed_closed = false;
                self.good_state = Some(submission.saved_state());

                self.audit_validation(submission, &progress, elapsed, None);
                self.record_validation_metrics(None, elapsed.as_secs_f64());
                tracing::info!(
                    attempt = progress.generation,
                    provenance = ?submission.provenance,
                    loops = progress.loops,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "level script accepted"
                );
                Ok(entry)
            }
            Err(error) => {
                self.shared.force_stopped();
                self.shared.take_fault();
                let stage = progress.state;
                progress.advance(ValidationState::Rejected);

                let (error, line) = match error {
                    SandboxError::Syntax {
                        message,
                        line: None,
                    } => {
                        let line = locate_syntax_error(&submission.code, &message);
                        (SandboxError::Syntax { message, line }, line)
                    }
                    other => {
                        let line = other.line();
                        (other, line)
                    }
                };
                let rejection = Rejection::new(error, line, stage);
                self.status.append_error(rejection.message(), None);

                self.audit_validation(submission, &progress, elapsed, Some(&rejection.error));
                self.record_validation_metrics(Some(&rejection.error), elapsed.as_secs_f64());
                tracing::warn!(
                    attempt = progress.generation,
                    stage = %stage,
                    error_kind = rejection.error.kind(),
                    message = rejection.message(),
                    "level script rejected"
                );
                Err(rejection)
            }
        }
    }

    /// Revalidate a previously saved good state after the game scripts changed.
    ///
    /// Lifecycle marker checks are skipped for restarts.
    pub fn restart_from_script(&mut self, saved: &SavedState) -> Result<EntryPoint, Rejection> {
        self.validate(&Submission::restart(saved))
    }

    fn run_validation(
        &mut self,
        submission: &Submission,
        progress: &mut Progress,
    ) -> Result<(ExecutionEnvironment, JsObject, AcceptedScript), SandboxError> {
        let names = self.config.entry_points.clone();

        check_size(&submission.code, Some(self.config.max_code_size))?;
        screen_source(&submission.player_code)?;
        progress.advance(ValidationState::LexicalChecked);

        let instrumented = instrument(&submission.code)?;
        progress.loops = instrumented.loops;
        if self.config.debug_transformed {
            tracing::debug!(code = %instrumented.code, "transformed source");
        }
        progress.advance(ValidationState::Transformed);

        let dummy = self.live.borrow().spawn_dummy();
        let mut env = ExecutionEnvironment::build(
            &self.config,
            Rc::clone(&self.shared),
            Rc::clone(&self.live),
            Rc::clone(&dummy),
        )?;
        let dummy_level: JsValue = env.pair(Instance::Dummy).level.clone().into();

        self.shared.take_fault();
        let evaluated = {
            let _running = RunningGuard::engage(&self.shared);
            env.evaluate(&instrumented.code)
        };
        self.settle(&mut env, evaluated)?;
        progress.advance(ValidationState::Evaluated);

        let setup = env
            .global_function(&names.setup)
            .ok_or_else(|| SandboxError::MissingEntryPoint {
                name: names.setup.clone(),
            })?;
        let first = {
            let _running = RunningGuard::engage(&self.shared);
            env.call(&setup, std::slice::from_ref(&dummy_level))
        };
        self.settle(&mut env, first)?;
        progress.advance(ValidationState::FirstRunDone);

        let post_check = env.global_function(&names.post_check);
        let exit_hook = env.global_function(&names.exit_hook);

        self.shared.reset_markers();
        dummy.borrow_mut().reset();
        let second = match env.global_function(&names.setup) {
            Some(setup) => {
                let _running = RunningGuard::engage(&self.shared);
                env.call(&setup, std::slice::from_ref(&dummy_level))
            }
            None => Ok(JsValue::undefined()),
        };
        dummy.borrow_mut().clear_timers();
        let second = match self.settle(&mut env, second) {
            Err(err) if err.is_privileged_access() || matches!(err, SandboxError::Timeout { .. }) => {
                return Err(err)
            }
            other => other,
        };
        progress.advance(ValidationState::SecondRunDone);

        if submission.provenance == Provenance::Fresh {
            let (start, end) = self.shared.markers();
            if !start {
                return Err(SandboxError::Lifecycle {
                    kind: LifecycleViolation::SetupTampered,
                    entry: names.setup,
                });
            }
            if !end {
                return Err(SandboxError::Lifecycle {
                    kind: LifecycleViolation::ReturnedPrematurely,
                    entry: names.setup,
                });
            }
        }
        second?;

        let setup = env
            .global_function(&names.setup)
            .ok_or_else(|| SandboxError::MissingEntryPoint {
                name: names.setup.clone(),
            })?;
        if !same_hook(&post_check, &env.global_function(&names.post_check)) {
            return Err(SandboxError::Lifecycle {
                kind: LifecycleViolation::PostCheckTampered,
                entry: names.post_check,
            });
        }
        if !same_hook(&exit_hook, &env.global_function(&names.exit_hook)) {
            return Err(SandboxError::Lifecycle {
                kind: LifecycleViolation::ExitHookTampered,
                entry: names.exit_hook,
            });
        }

        if !self.admin_override {
            env.detect_tampering(Instance::Dummy)?;
        }

        if let Some(check) = &post_check {
            let result = env.call(check, std::slice::from_ref(&dummy_level));
            self.settle(&mut env, result)?;
        }

        let objective = env.global_function(&names.objective);
        Ok((
            env,
            setup,
            AcceptedScript {
                post_check,
                exit_hook,
                objective,
                generation: progress.generation,
                provenance: submission.provenance,
                loops: 0,
            },
        ))
    }

    /// A recorded violation outranks whatever the script threw afterwards.
    fn settle(
        &self,
        env: &mut ExecutionEnvironment,
        result: boa_engine::JsResult<JsValue>,
    ) -> Result<JsValue, SandboxError> {
        if let Some(fault) = self.shared.take_fault() {
            return Err(fault);
        }
        result.map_err(|err| env.script_error(&err))
    }

    fn audit_validation(
        &self,
        submission: &Submission,
        progress: &Progress,
        elapsed: Duration,
        error: Option<&SandboxError>,
    ) {
        let mut builder =
            AuditEntryBuilder::new(&submission.code, submission.provenance, AuditEvent::Validation);
        builder.loops_instrumented(progress.loops);
        builder.duration(elapsed);
        self.audit.log(&builder.finish(error));
    }

    /// Run the accepted setup against the live level.
    ///
    /// The live level is reset first. Errors thrown by setup are propagated
    /// after the callback guard's checks.
    pub fn start_level(&mut self, entry: &EntryPoint) -> Result<(), SandboxError> {
        let accepted = self.accepted.as_ref().ok_or(SandboxError::NoAcceptedScript)?;
        if accepted.generation != entry.generation {
            return Err(SandboxError::StaleEntryPoint);
        }
        let level: JsValue = self
            .environment
            .as_ref()
            .ok_or(SandboxError::NoAcceptedScript)?
            .pair(Instance::Live)
            .level
            .clone()
            .into();

        self.live.borrow_mut().reset();
        self.shared.reset_markers();
        let setup = entry.function.clone();
        let result = self.guard_callback(
            CallbackOptions {
                propagate_errors: true,
                ..CallbackOptions::default()
            },
            move |context| setup.call(&JsValue::undefined(), &[level], context),
        );
        // dummy-pass registrations are released here too
        self.release_callbacks();
        result.map(|_| ())
    }

    /// Run the post-check against the live level as trusted code.
    ///
    /// An undeclared post-check always succeeds.
    pub fn run_post_check(&mut self) -> Result<(), SandboxError> {
        self.post_check_on(Instance::Live)
    }

    pub(crate) fn post_check_on(&mut self, instance: Instance) -> Result<(), SandboxError> {
        let accepted = self.accepted.as_ref().ok_or(SandboxError::NoAcceptedScript)?;
        let Some(check) = accepted.post_check.clone() else {
            return Ok(());
        };
        let env = self
            .environment
            .as_mut()
            .ok_or(SandboxError::NoAcceptedScript)?;
        let level: JsValue = env.pair(instance).level.clone().into();
        let result = env.call(&check, &[level]);
        if let Some(fault) = self.shared.take_fault() {
            return Err(fault);
        }
        result.map(|_| ()).map_err(|err| env.script_error(&err))
    }

    /// Run the exit hook against the live level. Defaults to `true`.
    pub fn run_exit_hook(&mut self) -> Result<bool, SandboxError> {
        let hook = self
            .accepted
            .as_ref()
            .ok_or(SandboxError::NoAcceptedScript)?
            .exit_hook
            .clone();
        self.run_predicate(hook, true)
    }

    /// Whether the level objective is met. Defaults to `false`.
    pub fn objective_met(&mut self) -> Result<bool, SandboxError> {
        let objective = self
            .accepted
            .as_ref()
            .ok_or(SandboxError::NoAcceptedScript)?
            .objective
            .clone();
        self.run_predicate(objective, false)
    }

    fn run_predicate(
        &mut self,
        function: Option<JsObject>,
        default: bool,
    ) -> Result<bool, SandboxError> {
        let Some(function) = function else {
            return Ok(default);
        };
        let env = self
            .environment
            .as_mut()
            .ok_or(SandboxError::NoAcceptedScript)?;
        let level: JsValue = env.pair(Instance::Live).level.clone().into();
        self.shared.take_fault();
        let result = {
            let _running = RunningGuard::engage(&self.shared);
            env.call(&function, &[level])
        };
        if let Some(fault) = self.shared.take_fault() {
            return Err(fault);
        }
        result
            .map(|value| value.to_boolean())
            .map_err(|err| env.script_error(&err))
    }

    /// Compare the live level's trusted operations against the snapshot.
    ///
    /// Always passes while the administrative override is active.
    pub fn detect_tampering(&self) -> Result<(), SandboxError> {
        if self.admin_override {
            return Ok(());
        }
        self.environment
            .as_ref()
            .ok_or(SandboxError::NoAcceptedScript)?
            .detect_tampering(Instance::Live)
    }
}
