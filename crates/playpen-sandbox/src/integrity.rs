//! Integrity snapshot and tamper detection.
//!
//! Right after an execution environment is built, the trusted operations of
//! its capability objects are recorded by identity. Detection compares each
//! current own slot against the recorded function; a swapped value, a deleted
//! slot or a slot turned into an accessor all count as tampering.

use boa_engine::property::PropertyKey;
use boa_engine::{JsObject, JsString};

use crate::capability::{CapabilityKind, CapabilityPair};
use crate::error::SandboxError;

/// Identities of the trusted operations of one level/actor pair.
pub(crate) struct ReferenceSnapshot {
    level: Vec<(&'static str, JsObject)>,
    actor: Vec<(&'static str, JsObject)>,
}

impl ReferenceSnapshot {
    /// Record the current operation slots of `pair`.
    ///
    /// Operations missing at capture time are left out and never checked.
    pub(crate) fn capture(pair: &CapabilityPair) -> Self {
        let record = |object: &JsObject, kind: CapabilityKind| {
            kind.operations()
                .iter()
                .filter_map(|op| own_data_value(object, op).map(|value| (*op, value)))
                .collect()
        };
        Self {
            level: record(&pair.level, CapabilityKind::Level),
            actor: record(&pair.actor, CapabilityKind::Actor),
        }
    }

    /// Fail on the first operation that no longer matches the snapshot.
    ///
    /// Level operations are checked before actor operations, each in
    /// reference order.
    pub(crate) fn detect(&self, pair: &CapabilityPair) -> Result<(), SandboxError> {
        check(&pair.level, &self.level)?;
        check(&pair.actor, &self.actor)
    }

    pub(crate) fn len(&self) -> usize {
        self.level.len() + self.actor.len()
    }
}

fn check(object: &JsObject, recorded: &[(&'static str, JsObject)]) -> Result<(), SandboxError> {
    for (name, original) in recorded {
        let intact = own_data_value(object, name)
            .is_some_and(|current| JsObject::equals(&current, original));
        if !intact {
            return Err(SandboxError::TamperedFunction {
                name: (*name).to_string(),
            });
        }
    }
    Ok(())
}

/// The object held by an own data slot, without running getters.
fn own_data_value(object: &JsObject, name: &str) -> Option<JsObject> {
    let key = PropertyKey::from(JsString::from(name));
    let descriptor = object.borrow().properties().get(&key)?;
    if descriptor.is_accessor_descriptor() {
        return None;
    }
    descriptor.value().and_then(|value| value.as_object().cloned())
}
