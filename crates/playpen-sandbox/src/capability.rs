//! Capability objects: the level and actor handles scripts receive.
//!
//! A capability object is a plain script object carrying a
//! [`CapabilityHandle`] as native data. Its trusted operations come from a
//! [`CapabilityTable`] of native functions, one per (kind, operation), shared
//! by the dummy and the live instance. All state lives in the Rust
//! [`LevelHost`](crate::LevelHost); operations marshal their arguments to JSON
//! and forward them.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use boa_engine::object::builtins::{JsArray, JsMap};
use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::property::{PropertyDescriptor, PropertyKey};
use boa_engine::{
    js_string, Context, Finalize, JsData, JsError, JsNativeError, JsObject, JsResult, JsString,
    JsValue, NativeFunction, Trace,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::SandboxError;
use crate::session::SessionShared;
use crate::SharedHost;

/// Trusted operations of a level object, in reference order.
pub const LEVEL_OPERATIONS: &[&str] = &[
    "countObjects",
    "createFromDOM",
    "createFromGrid",
    "displayChapter",
    "defineObject",
    "getAdjacentEmptyCells",
    "getCanvasContext",
    "getCanvasCoords",
    "getDOM",
    "getDynamicObjects",
    "getHeight",
    "getObjectTypeAt",
    "getPlayer",
    "getRandomColor",
    "getWidth",
    "isStartOfLevel",
    "overrideKey",
    "placeObject",
    "placePlayer",
    "setSquareColor",
    "startTimer",
    "updateDOM",
    "validateAtLeastXObjects",
    "validateAtMostXObjects",
    "validateExactlyXManyObjects",
    "validateAtMostXDynamicObjects",
    "validateNoTimers",
    "validateAtLeastXLines",
];

/// Trusted operations of an actor object, in reference order.
pub const ACTOR_OPERATIONS: &[&str] = &[
    "atLocation",
    "getColor",
    "getLastMoveDirection",
    "getX",
    "getY",
    "hasItem",
    "killedBy",
    "move",
    "removeItem",
    "setColor",
    "setPhoneCallback",
];

/// Lifecycle markers level code calls from inside setup.
pub const LIFECYCLE_MARKERS: [&str; 2] = ["_startOfStartLevelReached", "_endOfStartLevelReached"];

/// Maximum nesting of objects passed to host operations.
const MAX_ARGUMENT_DEPTH: usize = 16;

/// Maximum number of values marshalled for one host operation.
const MAX_ARGUMENT_VALUES: usize = 65_536;

/// The two kinds of capability object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// The level (map) handle.
    Level,
    /// The player's actor handle.
    Actor,
}

impl CapabilityKind {
    /// Trusted operations of this kind.
    pub fn operations(&self) -> &'static [&'static str] {
        match self {
            Self::Level => LEVEL_OPERATIONS,
            Self::Actor => ACTOR_OPERATIONS,
        }
    }

    /// Label used in messages and argument markers.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Level => "level",
            Self::Actor => "actor",
        }
    }
}

/// Identifier of a script function registered with the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallbackId(pub u32);

impl CallbackId {
    /// Marker key used when a callback crosses into the host.
    pub const MARKER: &'static str = "$callback";

    /// Read a callback marker produced by the sandbox.
    pub fn from_json(value: &Value) -> Option<Self> {
        value
            .get(Self::MARKER)
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .map(Self)
    }

    /// The JSON marker for this callback.
    pub fn to_json(self) -> Value {
        json!({ Self::MARKER: self.0 })
    }
}

/// An argument for a callback invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackArg {
    /// The live level object.
    Level,
    /// The live actor object.
    Actor,
    /// Plain data.
    Json(Value),
}

/// A callback the host wants run.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCallback {
    /// The registered function.
    pub id: CallbackId,
    /// Arguments to pass.
    pub args: Vec<CallbackArg>,
}

/// Which level a capability object fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Instance {
    Dummy,
    Live,
}

/// Rust-side state reachable from the native functions of one environment.
pub(crate) struct HostBridge {
    pub(crate) shared: Rc<SessionShared>,
    live: SharedHost,
    dummy: SharedHost,
    next_callback: Cell<u32>,
    registered: RefCell<BTreeSet<u32>>,
}

impl HostBridge {
    pub(crate) fn new(shared: Rc<SessionShared>, live: SharedHost, dummy: SharedHost) -> Self {
        Self {
            shared,
            live,
            dummy,
            next_callback: Cell::new(0),
            registered: RefCell::new(BTreeSet::new()),
        }
    }

    pub(crate) fn host(&self, instance: Instance) -> &SharedHost {
        match instance {
            Instance::Dummy => &self.dummy,
            Instance::Live => &self.live,
        }
    }

    /// Claim the next id no live registration uses.
    fn claim_callback_id(&self) -> u32 {
        let mut registered = self.registered.borrow_mut();
        let mut id = self.next_callback.get();
        while registered.contains(&id) {
            id = id.wrapping_add(1);
        }
        self.next_callback.set(id.wrapping_add(1));
        registered.insert(id);
        id
    }

    /// Number of functions currently registered with the host.
    pub(crate) fn registered_callbacks(&self) -> usize {
        self.registered.borrow().len()
    }

    /// Record a privileged-access violation if untrusted code is running,
    /// and build the exception to throw.
    pub(crate) fn violation(&self, err: SandboxError) -> JsError {
        let message = err.to_string();
        if self.shared.is_running() {
            self.shared.record_fault(err);
        }
        JsNativeError::error().with_message(message).into()
    }
}

/// Native data identifying a capability object.
#[derive(Trace, Finalize, JsData)]
pub(crate) struct CapabilityHandle {
    #[unsafe_ignore_trace]
    pub(crate) instance: Instance,
    #[unsafe_ignore_trace]
    pub(crate) kind: CapabilityKind,
    pub(crate) actor: Option<JsObject>,
    #[unsafe_ignore_trace]
    pub(crate) guarded: RefCell<BTreeSet<String>>,
}

/// Read the handle of a capability object without keeping the borrow.
pub(crate) fn handle_of(value: &JsValue) -> Option<(Instance, CapabilityKind, Option<JsObject>)> {
    let object = value.as_object()?;
    let handle = object.downcast_ref::<CapabilityHandle>()?;
    Some((handle.instance, handle.kind, handle.actor.clone()))
}

/// Script functions handed to the host, keyed by id and by identity.
#[derive(Clone, Trace, Finalize)]
pub(crate) struct CallbackRegistry {
    functions: JsObject,
    ids: JsObject,
}

impl CallbackRegistry {
    pub(crate) fn new(context: &mut Context) -> Self {
        Self {
            functions: JsObject::with_null_proto(),
            ids: JsMap::new(context).into(),
        }
    }

    fn ids(&self) -> JsResult<JsMap> {
        JsMap::from_object(self.ids.clone())
    }

    /// The id of `function`; a function seen before keeps its id.
    fn register(
        &self,
        function: &JsObject,
        bridge: &HostBridge,
        context: &mut Context,
    ) -> JsResult<CallbackId> {
        let ids = self.ids()?;
        if let Some(id) = ids.get(function.clone(), context)?.as_number() {
            return Ok(CallbackId(id as u32));
        }
        let id = bridge.claim_callback_id();
        self.functions.set(id, function.clone(), true, context)?;
        ids.set(function.clone(), id, context)?;
        Ok(CallbackId(id))
    }

    pub(crate) fn get(&self, id: CallbackId) -> Option<JsObject> {
        let key = PropertyKey::from(id.0);
        let descriptor = self.functions.borrow().properties().get(&key)?;
        descriptor
            .value()
            .and_then(|value| value.as_object().cloned())
            .filter(JsObject::is_callable)
    }

    /// Forget every function whose id is not in `keep`. Returns how many
    /// registrations were dropped.
    pub(crate) fn retain(
        &self,
        keep: &BTreeSet<CallbackId>,
        bridge: &HostBridge,
        context: &mut Context,
    ) -> JsResult<usize> {
        let stale: Vec<u32> = bridge
            .registered
            .borrow()
            .iter()
            .copied()
            .filter(|id| !keep.contains(&CallbackId(*id)))
            .collect();
        let ids = self.ids()?;
        for id in &stale {
            if let Some(function) = self.get(CallbackId(*id)) {
                ids.delete(function, context)?;
            }
            self.functions.delete_property_or_throw(*id, context)?;
        }
        bridge
            .registered
            .borrow_mut()
            .retain(|id| keep.contains(&CallbackId(*id)));
        Ok(stale.len())
    }
}

fn argument_too_large() -> JsError {
    JsNativeError::range()
        .with_message("argument too large")
        .into()
}

/// Converts script values into JSON for the host.
///
/// One marshaller converts at most [`MAX_ARGUMENT_VALUES`] values.
pub(crate) struct Marshaller<'a> {
    bridge: &'a HostBridge,
    /// Without a registry, functions become `null`.
    callbacks: Option<&'a CallbackRegistry>,
    /// `Object.keys`, captured before any untrusted code ran.
    keys: &'a JsObject,
    remaining: Cell<usize>,
}

impl<'a> Marshaller<'a> {
    pub(crate) fn new(
        bridge: &'a HostBridge,
        callbacks: Option<&'a CallbackRegistry>,
        keys: &'a JsObject,
    ) -> Self {
        Self {
            bridge,
            callbacks,
            keys,
            remaining: Cell::new(MAX_ARGUMENT_VALUES),
        }
    }

    pub(crate) fn to_json(&self, value: &JsValue, context: &mut Context) -> JsResult<Value> {
        self.convert(value, 0, context)
    }

    /// Fail before walking `count` more values than are left.
    fn reserve(&self, count: u64) -> JsResult<()> {
        if count > self.remaining.get() as u64 {
            return Err(argument_too_large());
        }
        Ok(())
    }

    fn convert(&self, value: &JsValue, depth: usize, context: &mut Context) -> JsResult<Value> {
        if depth > MAX_ARGUMENT_DEPTH {
            return Err(JsNativeError::range()
                .with_message("argument nesting too deep")
                .into());
        }
        let remaining = self
            .remaining
            .get()
            .checked_sub(1)
            .ok_or_else(argument_too_large)?;
        self.remaining.set(remaining);
        Ok(match value {
            JsValue::Null | JsValue::Undefined | JsValue::Symbol(_) => Value::Null,
            JsValue::Boolean(b) => Value::Bool(*b),
            JsValue::String(s) => Value::String(s.to_std_string_escaped()),
            JsValue::Integer(i) => Value::from(*i),
            JsValue::Rational(f) => number(*f),
            JsValue::BigInt(b) => Value::String(b.to_string()),
            JsValue::Object(object) => self.convert_object(object, depth, context)?,
        })
    }

    fn convert_object(
        &self,
        object: &JsObject,
        depth: usize,
        context: &mut Context,
    ) -> JsResult<Value> {
        if let Some((_, kind, _)) = handle_of(&object.clone().into()) {
            return Ok(json!({ "$capability": kind.label() }));
        }
        if object.is_callable() {
            return match self.callbacks {
                Some(registry) => Ok(registry.register(object, self.bridge, context)?.to_json()),
                None => Ok(Value::Null),
            };
        }
        if object.is_array() {
            let array = JsArray::from_object(object.clone())?;
            let length = array.length(context)?;
            self.reserve(length)?;
            let mut items = Vec::with_capacity(length.min(1024) as usize);
            for index in 0..length {
                let item = array.get(index, context)?;
                items.push(self.convert(&item, depth + 1, context)?);
            }
            return Ok(Value::Array(items));
        }

        let names = self
            .keys
            .call(&JsValue::undefined(), &[object.clone().into()], context)?;
        let names = names
            .as_object()
            .cloned()
            .ok_or_else(|| JsNativeError::typ().with_message("Object.keys returned no array"))?;
        let names = JsArray::from_object(names)?;
        let length = names.length(context)?;
        self.reserve(length)?;
        let mut map = serde_json::Map::new();
        for index in 0..length {
            let name = names.get(index, context)?;
            let Some(name) = name.as_string().cloned() else {
                continue;
            };
            let item = object.get(name.clone(), context)?;
            map.insert(
                name.to_std_string_escaped(),
                self.convert(&item, depth + 1, context)?,
            );
        }
        Ok(Value::Object(map))
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Captures of a trusted operation.
#[derive(Trace, Finalize)]
struct OperationCapture {
    #[unsafe_ignore_trace]
    bridge: Rc<HostBridge>,
    #[unsafe_ignore_trace]
    kind: CapabilityKind,
    #[unsafe_ignore_trace]
    op: &'static str,
    callbacks: CallbackRegistry,
    keys: JsObject,
}

fn call_operation(
    this: &JsValue,
    args: &[JsValue],
    capture: &OperationCapture,
    context: &mut Context,
) -> JsResult<JsValue> {
    let (instance, kind, actor) = handle_of(this)
        .filter(|(_, kind, _)| *kind == capture.kind)
        .ok_or_else(|| {
            JsNativeError::typ().with_message(format!(
                "{}() must be called on a {} object",
                capture.op,
                capture.kind.label()
            ))
        })?;

    if kind == CapabilityKind::Level && capture.op == "getPlayer" {
        return Ok(actor.map(JsValue::from).unwrap_or_default());
    }

    let marshaller = Marshaller::new(&capture.bridge, Some(&capture.callbacks), &capture.keys);
    let mut json_args = Vec::with_capacity(args.len());
    for arg in args {
        json_args.push(marshaller.to_json(arg, context)?);
    }

    let result = {
        let mut host = capture
            .bridge
            .host(instance)
            .try_borrow_mut()
            .map_err(|_| JsNativeError::error().with_message("level is busy"))?;
        host.invoke(kind, capture.op, json_args)
    };

    match result {
        Ok(value) => JsValue::from_json(&value, context),
        Err(err) if err.is_forbidden() => Err(capture.bridge.violation(err.into())),
        Err(err) => Err(JsNativeError::error().with_message(err.to_string()).into()),
    }
}

#[derive(Trace, Finalize)]
struct MarkerCapture {
    #[unsafe_ignore_trace]
    shared: Rc<SessionShared>,
    #[unsafe_ignore_trace]
    start: bool,
}

fn reach_marker(
    _this: &JsValue,
    _args: &[JsValue],
    capture: &MarkerCapture,
    _context: &mut Context,
) -> JsResult<JsValue> {
    if capture.start {
        capture.shared.mark_start_reached();
    } else {
        capture.shared.mark_end_reached();
    }
    Ok(JsValue::undefined())
}

fn build_function(
    context: &mut Context,
    function: NativeFunction,
    name: &str,
    length: usize,
) -> JsObject {
    FunctionObjectBuilder::new(context.realm(), function)
        .name(JsString::from(name))
        .length(length)
        .constructor(false)
        .build()
        .into()
}

/// One trusted function per (kind, operation), plus the lifecycle markers.
pub(crate) struct CapabilityTable {
    level: Vec<(&'static str, JsObject)>,
    actor: Vec<(&'static str, JsObject)>,
    markers: Vec<(&'static str, JsObject)>,
}

impl CapabilityTable {
    pub(crate) fn build(
        context: &mut Context,
        bridge: &Rc<HostBridge>,
        callbacks: &CallbackRegistry,
        keys: &JsObject,
    ) -> Self {
        let build_kind = |kind: CapabilityKind, context: &mut Context| {
            kind.operations()
                .iter()
                .map(|op| {
                    let function = NativeFunction::from_copy_closure_with_captures(
                        call_operation,
                        OperationCapture {
                            bridge: Rc::clone(bridge),
                            kind,
                            op,
                            callbacks: callbacks.clone(),
                            keys: keys.clone(),
                        },
                    );
                    (*op, build_function(context, function, op, 0))
                })
                .collect::<Vec<_>>()
        };
        let level = build_kind(CapabilityKind::Level, context);
        let actor = build_kind(CapabilityKind::Actor, context);

        let markers = LIFECYCLE_MARKERS
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let function = NativeFunction::from_copy_closure_with_captures(
                    reach_marker,
                    MarkerCapture {
                        shared: Rc::clone(&bridge.shared),
                        start: i == 0,
                    },
                );
                (*name, build_function(context, function, name, 0))
            })
            .collect();

        Self {
            level,
            actor,
            markers,
        }
    }

    fn operations(&self, kind: CapabilityKind) -> &[(&'static str, JsObject)] {
        match kind {
            CapabilityKind::Level => &self.level,
            CapabilityKind::Actor => &self.actor,
        }
    }
}

/// A level object and its paired actor object.
#[derive(Clone)]
pub(crate) struct CapabilityPair {
    pub(crate) level: JsObject,
    pub(crate) actor: JsObject,
}

/// Build the level/actor pair for one instance.
pub(crate) fn build_pair(
    context: &mut Context,
    table: &CapabilityTable,
    instance: Instance,
) -> JsResult<CapabilityPair> {
    let actor = build_object(context, table, instance, CapabilityKind::Actor, None)?;
    let level = build_object(
        context,
        table,
        instance,
        CapabilityKind::Level,
        Some(actor.clone()),
    )?;
    Ok(CapabilityPair { level, actor })
}

fn build_object(
    context: &mut Context,
    table: &CapabilityTable,
    instance: Instance,
    kind: CapabilityKind,
    actor: Option<JsObject>,
) -> JsResult<JsObject> {
    let handle = CapabilityHandle {
        instance,
        kind,
        actor,
        guarded: RefCell::new(BTreeSet::new()),
    };
    let object = ObjectInitializer::with_native_data(handle, context).build();

    let mut members: Vec<(&str, JsObject)> = table
        .operations(kind)
        .iter()
        .map(|(name, f)| (*name, f.clone()))
        .collect();
    if kind == CapabilityKind::Level {
        members.extend(table.markers.iter().map(|(name, f)| (*name, f.clone())));
    }

    for (name, function) in members {
        object.define_property_or_throw(
            JsString::from(name),
            PropertyDescriptor::builder()
                .value(function)
                .writable(true)
                .enumerable(true)
                .configurable(true),
            context,
        )?;
    }
    object.define_property_or_throw(
        js_string!("kind"),
        PropertyDescriptor::builder()
            .value(JsString::from(kind.label()))
            .writable(false)
            .enumerable(false)
            .configurable(false),
        context,
    )?;
    Ok(object)
}
