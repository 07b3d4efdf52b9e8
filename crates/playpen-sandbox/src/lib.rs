#![warn(missing_docs)]

//! # playpen-sandbox
//!
//! Validation sandbox for level scripts written by learners.
//!
//! A level script declares a setup function (`startLevel` by default) that
//! receives a level capability object. Before the script is allowed to touch
//! the real level it goes through [`SandboxSession::validate`]:
//!
//! 1. the player-editable part is screened for forbidden tokens
//! 2. every loop is instrumented with a deadline check
//! 3. the script is evaluated in a fresh `boa_engine` realm with an allowlisted
//!    global namespace
//! 4. setup runs twice against a disposable dummy level
//! 5. lifecycle markers, hook identities and trusted operations are verified
//!
//! Accepted scripts are later driven through the callback guard, which
//! re-checks the level's post-check and trusted operations after every
//! invocation and fails the level closed on privileged access.
//!
//! ## Security model
//!
//! - **Lexical screen**: escape primitives rejected before parsing
//! - **Cooperative timeouts**: every loop checks a monotonic deadline
//! - **Fresh realm per attempt**: no state survives a validation attempt
//! - **Allowlisted globals**: only `Object`, `Array`, `String`, `Number`, `Math`,
//!   `parseInt` and `Date` survive purification
//! - **Private members**: host state behind `_`-prefixed slots is unreachable
//!   while untrusted code runs
//! - **Tamper detection**: trusted operations are compared against a snapshot
//!
//! This is a defense-in-depth teaching sandbox, not a hard isolation boundary.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

pub mod audit;
pub mod callback;
pub mod capability;
pub mod environment;
pub mod error;
pub mod grid;
pub mod instrument;
pub mod integrity;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod orchestrator;
pub mod privileged;
pub mod session;
pub mod validator;

pub use callback::CallbackOptions;
pub use capability::{CallbackArg, CallbackId, CapabilityKind, PendingCallback};
pub use error::{AccessKind, LifecycleViolation, SandboxError};
pub use grid::GridLevel;
pub use orchestrator::{EntryPoint, Rejection, ValidationState};
pub use playpen_error::HostError;
pub use session::{
    EntryPointNames, Provenance, SandboxConfig, SandboxSession, SavedState, Submission,
};

/// A level host shared between the session and the capability objects.
pub type SharedHost = Rc<RefCell<dyn LevelHost>>;

/// Flags a level carries into the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LevelProperties {
    /// Inject the read-only `$` DOM view into the script's globals.
    #[serde(alias = "showDummyDom")]
    pub allow_auxiliary_view: bool,
    /// Skip post-check and tamper detection on callbacks.
    #[serde(alias = "quickValidateCallback")]
    pub reduced_integrity: bool,
}

/// The game-side implementation behind level and actor capability objects.
///
/// Hosts own all level state. Scripts reach it only through [`invoke`]
/// (named operations) and the privileged accessors backed by
/// [`read_private`] / [`write_private`].
///
/// [`invoke`]: LevelHost::invoke
/// [`read_private`]: LevelHost::read_private
/// [`write_private`]: LevelHost::write_private
pub trait LevelHost {
    /// Run a named operation.
    ///
    /// Function arguments arrive as `{"$callback": id}` and capability
    /// objects as `{"$capability": "level" | "actor"}`. Returning
    /// [`HostError::Forbidden`] marks the call as a privileged-access
    /// violation.
    fn invoke(
        &mut self,
        kind: CapabilityKind,
        op: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, HostError>;

    /// Names of the private (`_`-prefixed) members of a capability kind.
    fn private_members(&self, kind: CapabilityKind) -> Vec<String>;

    /// Current value of a private member, if it exists.
    fn read_private(&self, kind: CapabilityKind, name: &str) -> Option<serde_json::Value>;

    /// Assign a private member.
    fn write_private(
        &mut self,
        kind: CapabilityKind,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), HostError>;

    /// The level's property bag.
    fn properties(&self) -> LevelProperties;

    /// Restore the state the level had before setup ran.
    fn reset(&mut self);

    /// Cancel every pending timer.
    fn clear_timers(&mut self);

    /// Stop the actor from acting for the rest of the level.
    fn disable_actor(&mut self);

    /// Record that a callback failed validation.
    fn mark_callback_validation_failed(&mut self);

    /// Callbacks the host wants run (timers, collisions, key handlers).
    fn take_pending(&mut self) -> Vec<PendingCallback>;

    /// Every callback id the host still refers to, queued ones included.
    ///
    /// Functions whose ids are missing here are released by the sandbox.
    fn retained_callbacks(&self) -> BTreeSet<CallbackId>;

    /// Current DOM markup, for the auxiliary view.
    fn dom(&self) -> String;

    /// A disposable copy with the same properties, used for dummy passes.
    fn spawn_dummy(&self) -> SharedHost;
}

/// Status/log output of the embedding application.
pub trait StatusSink {
    /// Report an error, with an optional follow-up cue for the player.
    fn append_error(&self, message: &str, cue: Option<&str>);

    /// Show a status line.
    fn write_status(&self, message: &str);
}

/// Audio cue output of the embedding application.
pub trait SoundCue {
    /// Play a named cue.
    fn play_sound(&self, name: &str);
}

/// A [`StatusSink`] that emits `tracing` events.
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn append_error(&self, message: &str, cue: Option<&str>) {
        tracing::warn!(message, cue = cue.unwrap_or(""), "level error");
    }

    fn write_status(&self, message: &str) {
        tracing::info!(message, "level status");
    }
}

/// A [`SoundCue`] that plays nothing.
pub struct SilentSound;

impl SoundCue for SilentSound {
    fn play_sound(&self, name: &str) {
        tracing::trace!(cue = name, "sound cue suppressed");
    }
}
