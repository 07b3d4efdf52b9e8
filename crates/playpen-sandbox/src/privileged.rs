//! Privileged property guard.
//!
//! Every `_`-prefixed member a host declares is installed on its capability
//! object as a non-configurable accessor. While untrusted code is running,
//! reading or assigning it records a violation and throws; trusted code
//! (post-checks invoked by the sandbox, the host itself) goes through to the
//! host's private state.

use std::rc::Rc;

use boa_engine::object::FunctionObjectBuilder;
use boa_engine::property::PropertyDescriptor;
use boa_engine::{
    Context, Finalize, JsArgs, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction, Trace,
};

use crate::capability::{
    handle_of, CapabilityHandle, CapabilityKind, HostBridge, Instance, Marshaller,
    LIFECYCLE_MARKERS,
};
use crate::error::{AccessKind, SandboxError};

#[derive(Trace, Finalize)]
struct PrivateSlot {
    #[unsafe_ignore_trace]
    bridge: Rc<HostBridge>,
    #[unsafe_ignore_trace]
    instance: Instance,
    #[unsafe_ignore_trace]
    kind: CapabilityKind,
    #[unsafe_ignore_trace]
    name: String,
    keys: JsObject,
}

fn read_slot(
    _this: &JsValue,
    _args: &[JsValue],
    slot: &PrivateSlot,
    context: &mut Context,
) -> JsResult<JsValue> {
    if slot.bridge.shared.is_running() {
        return Err(slot.bridge.violation(SandboxError::PrivilegedAccess {
            access: AccessKind::Read,
            name: slot.name.clone(),
        }));
    }
    let value = slot
        .bridge
        .host(slot.instance)
        .try_borrow()
        .map_err(|_| JsNativeError::error().with_message("level is busy"))?
        .read_private(slot.kind, &slot.name);
    match value {
        Some(value) => JsValue::from_json(&value, context),
        None => Ok(JsValue::undefined()),
    }
}

fn write_slot(
    _this: &JsValue,
    args: &[JsValue],
    slot: &PrivateSlot,
    context: &mut Context,
) -> JsResult<JsValue> {
    if slot.bridge.shared.is_running() {
        return Err(slot.bridge.violation(SandboxError::PrivilegedAccess {
            access: AccessKind::Write,
            name: slot.name.clone(),
        }));
    }
    let marshaller = Marshaller::new(&slot.bridge, None, &slot.keys);
    let value = marshaller.to_json(args.get_or_undefined(0), context)?;
    let result = slot
        .bridge
        .host(slot.instance)
        .try_borrow_mut()
        .map_err(|_| JsNativeError::error().with_message("level is busy"))?
        .write_private(slot.kind, &slot.name, value);
    result
        .map(|()| JsValue::undefined())
        .map_err(|err| JsNativeError::error().with_message(err.to_string()).into())
}

/// Install guarded accessors for `names` on a capability object.
///
/// Names without a leading underscore, lifecycle markers and names that are
/// already guarded are skipped, so the call is idempotent. Returns how many
/// accessors were installed.
pub(crate) fn secure_object(
    object: &JsObject,
    names: &[String],
    bridge: &Rc<HostBridge>,
    keys: &JsObject,
    context: &mut Context,
) -> JsResult<usize> {
    let Some((instance, kind, _)) = handle_of(&object.clone().into()) else {
        return Err(JsNativeError::typ()
            .with_message("not a capability object")
            .into());
    };

    let fresh: Vec<String> = {
        let Some(handle) = object.downcast_ref::<CapabilityHandle>() else {
            return Ok(0);
        };
        let mut guarded = handle.guarded.borrow_mut();
        names
            .iter()
            .filter(|name| name.starts_with('_'))
            .filter(|name| !LIFECYCLE_MARKERS.contains(&name.as_str()))
            .filter(|name| guarded.insert((*name).clone()))
            .cloned()
            .collect()
    };

    for name in &fresh {
        let slot = || PrivateSlot {
            bridge: Rc::clone(bridge),
            instance,
            kind,
            name: name.clone(),
            keys: keys.clone(),
        };
        let getter = FunctionObjectBuilder::new(
            context.realm(),
            NativeFunction::from_copy_closure_with_captures(read_slot, slot()),
        )
        .name(JsString::from(format!("get {name}")))
        .length(0)
        .constructor(false)
        .build();
        let setter = FunctionObjectBuilder::new(
            context.realm(),
            NativeFunction::from_copy_closure_with_captures(write_slot, slot()),
        )
        .name(JsString::from(format!("set {name}")))
        .length(1)
        .constructor(false)
        .build();

        object.define_property_or_throw(
            JsString::from(name.as_str()),
            PropertyDescriptor::builder()
                .get(getter)
                .set(setter)
                .enumerable(false)
                .configurable(false),
            context,
        )?;
    }

    tracing::trace!(
        kind = kind.label(),
        installed = fresh.len(),
        "private members secured"
    );
    Ok(fresh.len())
}
