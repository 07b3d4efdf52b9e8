//! Callback guard.
//!
//! Every later invocation of accepted script code (setup on the live level,
//! timers, collisions, key handlers) runs through [`SandboxSession::guard_callback`].
//! A privileged-access violation, a failing post-check or a tampered trusted
//! operation fails the level closed: the actor is disabled, timers are
//! cancelled and the level is marked as failed until it is reloaded.

use boa_engine::{Context, JsResult, JsValue};
use serde_json::Value;

use crate::audit::{AuditEntryBuilder, AuditEvent};
use crate::capability::{CallbackArg, CallbackId, Instance};
use crate::error::SandboxError;
use crate::session::{RunningGuard, SandboxSession};

/// Cue shown after a privileged-access violation.
pub const RELOAD_CUE: &str = "Please reload the level.";

/// Cue shown after a failed post-check or tamper check.
pub const VALIDATION_FAILED_CUE: &str = "Validation failed! Please reload the level.";

/// Sound played when a level fails closed.
const FAILURE_SOUND: &str = "static";

/// How a guarded callback reports its own errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackOptions {
    /// Return ordinary script errors to the caller instead of only writing
    /// them to the status line.
    pub propagate_errors: bool,
    /// Run without Running State, so private members stay reachable.
    pub skip_forbidden_enforcement: bool,
}

impl SandboxSession {
    /// Run `f` as untrusted code under the callback guard.
    ///
    /// Returns `Ok(None)` when the callback threw without propagation, or
    /// when the level failed closed.
    pub fn guard_callback<F>(
        &mut self,
        options: CallbackOptions,
        f: F,
    ) -> Result<Option<JsValue>, SandboxError>
    where
        F: FnOnce(&mut Context) -> JsResult<JsValue>,
    {
        let env = self
            .environment
            .as_mut()
            .ok_or(SandboxError::NoAcceptedScript)?;

        self.shared.take_fault();
        let result = if options.skip_forbidden_enforcement {
            f(env.context())
        } else {
            let _running = RunningGuard::engage(&self.shared);
            f(env.context())
        };
        let outcome = match (self.shared.take_fault(), result) {
            (Some(fault), _) => Err(fault),
            (None, Ok(value)) => Ok(value),
            (None, Err(err)) => Err(env.script_error(&err)),
        };

        let (value, saved) = match outcome {
            Err(err) if err.is_privileged_access() => {
                self.fail_closed(&err, RELOAD_CUE, "privileged_access");
                return Ok(None);
            }
            Err(err) => (None, Some(err)),
            Ok(value) => (Some(value), None),
        };

        let reduced_integrity = self.live.borrow().properties().reduced_integrity;
        if !reduced_integrity {
            if let Err(err) = self.post_check_on(Instance::Live) {
                self.fail_closed(&err, VALIDATION_FAILED_CUE, "post_check");
                return Ok(None);
            }
            if let Err(err) = self.detect_tampering() {
                self.fail_closed(&err, VALIDATION_FAILED_CUE, "tamper_detection");
                return Ok(None);
            }
        }

        match saved {
            Some(err) => {
                self.status.write_status(&err.to_string());
                if options.propagate_errors {
                    Err(err)
                } else {
                    Ok(None)
                }
            }
            None => Ok(value),
        }
    }

    /// Run a function the script registered with the host.
    ///
    /// Capability arguments resolve to the live objects. The return value
    /// is converted to JSON while Running State is held, so accessors on it
    /// cannot reach private members.
    pub fn invoke_callback(
        &mut self,
        id: CallbackId,
        args: &[CallbackArg],
        options: CallbackOptions,
    ) -> Result<Option<Value>, SandboxError> {
        let env = self
            .environment
            .as_mut()
            .ok_or(SandboxError::NoAcceptedScript)?;
        let function = env
            .callback(id)
            .ok_or_else(|| SandboxError::Host(format!("no callback registered as {}", id.0)))?;
        let args = env
            .callback_args(args)
            .map_err(|err| SandboxError::Engine(err.to_string()))?;

        let returned = self.guard_callback(options, move |context| {
            function.call(&JsValue::undefined(), &args, context)
        })?;
        let Some(returned) = returned else {
            return Ok(None);
        };

        let env = self
            .environment
            .as_mut()
            .ok_or(SandboxError::NoAcceptedScript)?;
        let converted = {
            let _running = RunningGuard::engage(&self.shared);
            env.value_to_json(&returned)
        };
        if let Some(fault) = self.shared.take_fault() {
            self.fail_closed(&fault, RELOAD_CUE, "privileged_access");
            return Ok(None);
        }
        converted
            .map(Some)
            .map_err(|err| env.script_error(&err))
    }

    /// Run every callback the live host has queued.
    ///
    /// Stops once the level has failed closed. Returns how many callbacks ran.
    pub fn dispatch_pending(&mut self) -> Result<usize, SandboxError> {
        let pending = self.live.borrow_mut().take_pending();
        let mut ran = 0;
        for callback in pending {
            if self.failed_closed {
                tracing::debug!(id = callback.id.0, "level failed closed, callback dropped");
                continue;
            }
            self.invoke_callback(callback.id, &callback.args, CallbackOptions::default())?;
            ran += 1;
        }
        self.release_callbacks();
        Ok(ran)
    }

    /// Number of script functions currently registered with the host.
    pub fn registered_callbacks(&self) -> usize {
        self.environment
            .as_ref()
            .map_or(0, |env| env.registered_callbacks())
    }

    /// Release registered functions the live host no longer refers to.
    pub(crate) fn release_callbacks(&mut self) {
        let keep = self.live.borrow().retained_callbacks();
        let Some(env) = self.environment.as_mut() else {
            return;
        };
        match env.prune_callbacks(&keep) {
            Ok(0) => {}
            Ok(released) => tracing::trace!(released, "callbacks released"),
            Err(err) => tracing::warn!(error = %err, "failed to release callbacks"),
        }
    }

    fn fail_closed(&mut self, err: &SandboxError, cue: &str, stage: &'static str) {
        self.status.append_error(&err.to_string(), Some(cue));
        self.sound.play_sound(FAILURE_SOUND);
        {
            let mut live = self.live.borrow_mut();
            live.disable_actor();
            live.mark_callback_validation_failed();
            live.clear_timers();
        }
        self.failed_closed = true;

        if let (Some(saved), Some(accepted)) = (&self.good_state, &self.accepted) {
            let mut builder = AuditEntryBuilder::new(
                &saved.code,
                accepted.provenance,
                AuditEvent::CallbackFailure { stage },
            );
            builder.loops_instrumented(accepted.loops);
            self.audit.log(&builder.finish(Some(err)));
        }
        self.record_callback_failure_metric(stage);
        tracing::warn!(stage, error = %err, "callback failed closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_enforce_and_swallow() {
        let options = CallbackOptions::default();
        assert!(!options.propagate_errors);
        assert!(!options.skip_forbidden_enforcement);
    }
}
