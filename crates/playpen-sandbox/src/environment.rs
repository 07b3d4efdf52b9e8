//! Isolated execution environment: one fresh `boa_engine` realm per
//! validation attempt.
//!
//! Building an environment hardens the Function-family constructors, purges
//! every global binding outside a small allowlist, then installs the trusted
//! bindings untrusted code may use: the loop guard, the maze helper, the
//! optional DOM view, and the dummy and live capability objects.

use std::collections::BTreeSet;
use std::rc::Rc;

use boa_engine::error::JsNativeErrorKind;
use boa_engine::object::builtins::JsArray;
use boa_engine::object::{IntegrityLevel, ObjectInitializer};
use boa_engine::property::{Attribute, PropertyDescriptor, PropertyKey};
use boa_engine::{
    js_string, Context, Finalize, JsArgs, JsError, JsNativeError, JsObject, JsResult, JsString,
    JsValue, NativeFunction, Script, Source, Trace,
};

use crate::capability::{
    build_pair, CallbackArg, CallbackId, CallbackRegistry, CapabilityKind, CapabilityPair,
    CapabilityTable, HostBridge, Instance, Marshaller,
};
use crate::error::SandboxError;
use crate::instrument::{instrument_helper, GUARD_BINDING};
use crate::integrity::ReferenceSnapshot;
use crate::privileged::secure_object;
use crate::session::{SandboxConfig, SessionShared};
use crate::SharedHost;

/// Global bindings that survive purification.
pub const ALLOWED_GLOBALS: &[&str] = &[
    "Object", "Array", "String", "Number", "Math", "parseInt", "Date",
];

/// Non-configurable primitives left in place.
const PRIMITIVE_GLOBALS: &[&str] = &["undefined", "NaN", "Infinity"];

/// `ROT.Map.DividedMaze`: recursive-division maze generator.
///
/// Its loops are instrumented like level code, so a huge maze times out
/// instead of stalling the realm.
const MAZE_PRELUDE: &str = r#"(function () {
    var floor = Math.floor;
    var random = Math.random;
    var freeze = Object.freeze;

    function pick(items) {
        return items[floor(random() * items.length)];
    }

    function DividedMaze(width, height) {
        if (!(this instanceof DividedMaze)) {
            return new DividedMaze(width, height);
        }
        this._width = width || 80;
        this._height = height || 25;
    }

    DividedMaze.prototype.create = function (callback) {
        var w = this._width;
        var h = this._height;
        var map = [];
        var i, j;
        for (i = 0; i < w; i++) {
            map.push([]);
            for (j = 0; j < h; j++) {
                var border = i === 0 || j === 0 || i + 1 === w || j + 1 === h;
                map[i].push(border ? 1 : 0);
            }
        }

        var stack = [[1, 1, w - 2, h - 2]];
        while (stack.length) {
            partition(map, stack, stack.shift());
        }

        if (callback) {
            for (i = 0; i < w; i++) {
                for (j = 0; j < h; j++) {
                    callback(i, j, map[i][j]);
                }
            }
        }
        return this;
    };

    function partition(map, stack, room) {
        var availX = [];
        var availY = [];
        var i, j;

        for (i = room[0] + 1; i < room[2]; i++) {
            if (map[i][room[1] - 1] && map[i][room[3] + 1] && !(i % 2)) {
                availX.push(i);
            }
        }
        for (j = room[1] + 1; j < room[3]; j++) {
            if (map[room[0] - 1][j] && map[room[2] + 1][j] && !(j % 2)) {
                availY.push(j);
            }
        }
        if (!availX.length || !availY.length) {
            return;
        }

        var x = pick(availX);
        var y = pick(availY);
        map[x][y] = 1;

        var walls = [[], [], [], []];
        for (i = room[0]; i < x; i++) {
            map[i][y] = 1;
            if (i % 2) walls[0].push([i, y]);
        }
        for (i = x + 1; i <= room[2]; i++) {
            map[i][y] = 1;
            if (i % 2) walls[1].push([i, y]);
        }
        for (j = room[1]; j < y; j++) {
            map[x][j] = 1;
            if (j % 2) walls[2].push([x, j]);
        }
        for (j = y + 1; j <= room[3]; j++) {
            map[x][j] = 1;
            if (j % 2) walls[3].push([x, j]);
        }

        var solid = pick(walls);
        for (i = 0; i < walls.length; i++) {
            if (walls[i] === solid) continue;
            var hole = pick(walls[i]);
            if (hole) map[hole[0]][hole[1]] = 0;
        }

        stack.push([room[0], room[1], x - 1, y - 1]);
        stack.push([x + 1, room[1], room[2], y - 1]);
        stack.push([room[0], y + 1, x - 1, room[3]]);
        stack.push([x + 1, y + 1, room[2], room[3]]);
    }

    freeze(DividedMaze.prototype);
    freeze(DividedMaze);
    return freeze({ Map: freeze({ DividedMaze: DividedMaze }) });
})()"#;

/// Functions captured from the realm before any untrusted code runs.
#[derive(Clone)]
struct Intrinsics {
    keys: JsObject,
    own_names: JsObject,
}

/// A disposable realm holding one validation attempt's script.
pub(crate) struct ExecutionEnvironment {
    context: Context,
    bridge: Rc<HostBridge>,
    dummy: CapabilityPair,
    live: CapabilityPair,
    callbacks: CallbackRegistry,
    intrinsics: Intrinsics,
    snapshot: ReferenceSnapshot,
}

impl ExecutionEnvironment {
    /// Build a purified realm bound to `live` and `dummy`.
    pub(crate) fn build(
        config: &SandboxConfig,
        shared: Rc<SessionShared>,
        live: SharedHost,
        dummy: SharedHost,
    ) -> Result<Self, SandboxError> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_recursion_limit(config.recursion_limit);
        context
            .runtime_limits_mut()
            .set_stack_size_limit(config.stack_size_limit);

        let object_ctor = context.intrinsics().constructors().object().constructor();
        let intrinsics = Intrinsics {
            keys: function_member(&object_ctor, "keys", &mut context)?,
            own_names: function_member(&object_ctor, "getOwnPropertyNames", &mut context)?,
        };

        harden_function_constructors(&mut context).map_err(engine)?;
        let removed = purify_globals(&intrinsics.own_names, &mut context).map_err(engine)?;

        install_loop_guard(&shared, &mut context).map_err(engine)?;
        let prelude = instrument_helper(MAZE_PRELUDE)?;
        let rot = context
            .eval(Source::from_bytes(&prelude.code))
            .map_err(engine)?;
        context
            .register_global_property(js_string!("ROT"), rot, Attribute::empty())
            .map_err(engine)?;

        let show_view = dummy.borrow().properties().allow_auxiliary_view;
        let bridge = Rc::new(HostBridge::new(shared, live, dummy));
        if show_view {
            install_dom_view(&bridge, &mut context).map_err(engine)?;
        }

        let callbacks = CallbackRegistry::new(&mut context);
        let table = CapabilityTable::build(&mut context, &bridge, &callbacks, &intrinsics.keys);
        let dummy_pair = build_pair(&mut context, &table, Instance::Dummy).map_err(engine)?;
        let live_pair = build_pair(&mut context, &table, Instance::Live).map_err(engine)?;
        let snapshot = ReferenceSnapshot::capture(&dummy_pair);

        let mut environment = Self {
            context,
            bridge,
            dummy: dummy_pair,
            live: live_pair,
            callbacks,
            intrinsics,
            snapshot,
        };
        environment.secure(Instance::Dummy).map_err(engine)?;
        environment.secure(Instance::Live).map_err(engine)?;

        tracing::debug!(
            purged = removed,
            trusted_operations = environment.snapshot.len(),
            "execution environment built"
        );
        Ok(environment)
    }

    /// Apply the privileged property guard to both objects of an instance.
    fn secure(&mut self, instance: Instance) -> JsResult<()> {
        let pair = self.pair(instance).clone();
        for (object, kind) in [
            (&pair.level, CapabilityKind::Level),
            (&pair.actor, CapabilityKind::Actor),
        ] {
            let names = self.bridge.host(instance).borrow().private_members(kind);
            secure_object(
                object,
                &names,
                &self.bridge,
                &self.intrinsics.keys,
                &mut self.context,
            )?;
        }
        Ok(())
    }

    pub(crate) fn pair(&self, instance: Instance) -> &CapabilityPair {
        match instance {
            Instance::Dummy => &self.dummy,
            Instance::Live => &self.live,
        }
    }

    pub(crate) fn context(&mut self) -> &mut Context {
        &mut self.context
    }

    pub(crate) fn evaluate(&mut self, code: &str) -> JsResult<JsValue> {
        self.context.eval(Source::from_bytes(code))
    }

    /// Call `function` with an undefined receiver.
    pub(crate) fn call(&mut self, function: &JsObject, args: &[JsValue]) -> JsResult<JsValue> {
        function.call(&JsValue::undefined(), args, &mut self.context)
    }

    /// A function declared as an own data property of the global object.
    ///
    /// Getters and non-callable values count as absent.
    pub(crate) fn global_function(&self, name: &str) -> Option<JsObject> {
        let global = self.context.global_object();
        let key = PropertyKey::from(JsString::from(name));
        let descriptor = global.borrow().properties().get(&key)?;
        if descriptor.is_accessor_descriptor() {
            return None;
        }
        descriptor
            .value()
            .and_then(|value| value.as_object().cloned())
            .filter(JsObject::is_callable)
    }

    /// A function registered through the callback registry.
    pub(crate) fn callback(&self, id: CallbackId) -> Option<JsObject> {
        self.callbacks.get(id)
    }

    /// Drop registered functions the host no longer refers to.
    pub(crate) fn prune_callbacks(&mut self, keep: &BTreeSet<CallbackId>) -> JsResult<usize> {
        self.callbacks.retain(keep, &self.bridge, &mut self.context)
    }

    pub(crate) fn registered_callbacks(&self) -> usize {
        self.bridge.registered_callbacks()
    }

    /// Resolve callback arguments against the live objects.
    pub(crate) fn callback_args(&mut self, args: &[CallbackArg]) -> JsResult<Vec<JsValue>> {
        args.iter()
            .map(|arg| match arg {
                CallbackArg::Level => Ok(self.live.level.clone().into()),
                CallbackArg::Actor => Ok(self.live.actor.clone().into()),
                CallbackArg::Json(value) => JsValue::from_json(value, &mut self.context),
            })
            .collect()
    }

    /// Convert a script value to JSON; functions become `null`.
    pub(crate) fn value_to_json(&mut self, value: &JsValue) -> JsResult<serde_json::Value> {
        let marshaller = Marshaller::new(&self.bridge, None, &self.intrinsics.keys);
        marshaller.to_json(value, &mut self.context)
    }

    /// Compare an instance's trusted operations against the snapshot.
    pub(crate) fn detect_tampering(&self, instance: Instance) -> Result<(), SandboxError> {
        self.snapshot.detect(self.pair(instance))
    }

    /// Convert a thrown script value into a sandbox error.
    pub(crate) fn script_error(&mut self, err: &JsError) -> SandboxError {
        script_error(err, &mut self.context)
    }
}

fn engine(err: JsError) -> SandboxError {
    SandboxError::Engine(err.to_string())
}

fn function_member(
    object: &JsObject,
    name: &str,
    context: &mut Context,
) -> Result<JsObject, SandboxError> {
    object
        .get(JsString::from(name), context)
        .map_err(engine)?
        .as_object()
        .filter(|f| f.is_callable())
        .cloned()
        .ok_or_else(|| SandboxError::Engine(format!("Object.{name} is unavailable")))
}

/// Replace `constructor` on the Function-family prototypes with a sealed
/// `undefined`, so no function instance leads back to a code evaluator.
fn harden_function_constructors(context: &mut Context) -> JsResult<()> {
    let constructors = context.intrinsics().constructors();
    let prototypes = [
        constructors.function().prototype(),
        constructors.async_function().prototype(),
        constructors.generator_function().prototype(),
        constructors.async_generator_function().prototype(),
    ];
    for prototype in prototypes {
        prototype.define_property_or_throw(
            js_string!("constructor"),
            PropertyDescriptor::builder()
                .value(JsValue::undefined())
                .writable(false)
                .enumerable(false)
                .configurable(false),
            context,
        )?;
    }
    Ok(())
}

fn own_property_names(
    own_names: &JsObject,
    object: &JsObject,
    context: &mut Context,
) -> JsResult<Vec<JsString>> {
    let names = own_names.call(&JsValue::undefined(), &[object.clone().into()], context)?;
    let Some(names) = names.as_object().cloned() else {
        return Ok(Vec::new());
    };
    let names = JsArray::from_object(names)?;
    let length = names.length(context)?;
    let mut out = Vec::with_capacity(length as usize);
    for index in 0..length {
        if let Some(name) = names.get(index, context)?.as_string() {
            out.push(name.clone());
        }
    }
    Ok(out)
}

/// Delete every non-allowlisted binding from the global object and its
/// ancestors below `Object.prototype`. Returns the number of bindings removed.
fn purify_globals(own_names: &JsObject, context: &mut Context) -> JsResult<usize> {
    let object_prototype = context.intrinsics().constructors().object().prototype();
    let mut removed = 0;
    let mut scope = Some(context.global_object());

    while let Some(object) = scope {
        if JsObject::equals(&object, &object_prototype) {
            break;
        }
        for name in own_property_names(own_names, &object, context)? {
            let text = name.to_std_string_escaped();
            if ALLOWED_GLOBALS.contains(&text.as_str())
                || PRIMITIVE_GLOBALS.contains(&text.as_str())
            {
                continue;
            }
            if object.delete_property_or_throw(name.clone(), context).is_ok() {
                removed += 1;
                continue;
            }
            // A binding that refuses deletion is emptied in place.
            if let Some(value) = object.get(name, context)?.as_object().cloned() {
                for member in own_property_names(own_names, &value, context)? {
                    let _ = value.delete_property_or_throw(member, context);
                }
            }
        }
        scope = object.prototype();
    }
    Ok(removed)
}

#[derive(Trace, Finalize)]
struct GuardCapture {
    #[unsafe_ignore_trace]
    shared: Rc<SessionShared>,
}

fn guard_enter(
    _this: &JsValue,
    _args: &[JsValue],
    capture: &GuardCapture,
    _context: &mut Context,
) -> JsResult<JsValue> {
    Ok(JsValue::from(capture.shared.now_ms()))
}

fn guard_check(
    _this: &JsValue,
    args: &[JsValue],
    capture: &GuardCapture,
    context: &mut Context,
) -> JsResult<JsValue> {
    // Once a run is doomed, every further iteration unwinds at once.
    if let Some(message) = capture.shared.pending_fault_message() {
        return Err(JsNativeError::error().with_message(message).into());
    }
    let start = args.get_or_undefined(0).to_number(context)?;
    let line = args.get_or_undefined(1).to_number(context)?;
    let budget_ms = capture.shared.budget_ms();
    // NaN starts fail the comparison below, so treat them as expired.
    let elapsed = capture.shared.now_ms() - start;
    if elapsed > budget_ms as f64 || elapsed.is_nan() {
        let fault = SandboxError::Timeout {
            line: line.max(0.0) as usize,
            budget_ms,
        };
        let message = fault.to_string();
        capture.shared.record_fault(fault);
        return Err(JsNativeError::error().with_message(message).into());
    }
    Ok(JsValue::undefined())
}

fn install_loop_guard(shared: &Rc<SessionShared>, context: &mut Context) -> JsResult<()> {
    let enter = NativeFunction::from_copy_closure_with_captures(
        guard_enter,
        GuardCapture {
            shared: Rc::clone(shared),
        },
    );
    let check = NativeFunction::from_copy_closure_with_captures(
        guard_check,
        GuardCapture {
            shared: Rc::clone(shared),
        },
    );
    let guard = ObjectInitializer::new(context)
        .function(enter, js_string!("enter"), 0)
        .function(check, js_string!("check"), 2)
        .build();
    guard.set_integrity_level(IntegrityLevel::Frozen, context)?;
    context.register_global_property(JsString::from(GUARD_BINDING), guard, Attribute::empty())
}

#[derive(Trace, Finalize)]
struct DomView {
    #[unsafe_ignore_trace]
    bridge: Rc<HostBridge>,
    #[unsafe_ignore_trace]
    text: bool,
}

fn read_dom(
    _this: &JsValue,
    _args: &[JsValue],
    view: &DomView,
    _context: &mut Context,
) -> JsResult<JsValue> {
    let markup = view
        .bridge
        .host(Instance::Live)
        .try_borrow()
        .map_err(|_| JsNativeError::error().with_message("level is busy"))?
        .dom();
    let out = if view.text {
        strip_tags(&markup)
    } else {
        markup
    };
    Ok(JsString::from(out).into())
}

fn strip_tags(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut in_tag = false;
    for c in markup.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn install_dom_view(bridge: &Rc<HostBridge>, context: &mut Context) -> JsResult<()> {
    let html = NativeFunction::from_copy_closure_with_captures(
        read_dom,
        DomView {
            bridge: Rc::clone(bridge),
            text: false,
        },
    );
    let text = NativeFunction::from_copy_closure_with_captures(
        read_dom,
        DomView {
            bridge: Rc::clone(bridge),
            text: true,
        },
    );
    let view = ObjectInitializer::new(context)
        .function(html, js_string!("html"), 0)
        .function(text, js_string!("text"), 0)
        .build();
    view.set_integrity_level(IntegrityLevel::Frozen, context)?;
    context.register_global_property(js_string!("$"), view, Attribute::empty())
}

/// Convert a thrown value into a [`SandboxError`].
pub(crate) fn script_error(err: &JsError, context: &mut Context) -> SandboxError {
    if let Some(message) = err.as_opaque().and_then(JsValue::as_string) {
        return SandboxError::Script {
            message: message.to_std_string_escaped(),
        };
    }
    match err.try_native(context) {
        Ok(native) if matches!(native.kind, JsNativeErrorKind::Syntax) => SandboxError::Syntax {
            message: native.message().to_string(),
            line: None,
        },
        Ok(native) => SandboxError::Script {
            message: native.to_string(),
        },
        Err(_) => SandboxError::Script {
            message: err.to_string(),
        },
    }
}

/// Find the 1-based line of a parse failure by replaying prefixes of `code`
/// through the parser and looking for the first one that fails the same way.
pub(crate) fn locate_syntax_error(code: &str, message: &str) -> Option<usize> {
    let mut context = Context::default();
    let mut end = 0;
    for (index, line) in code.split_inclusive('\n').enumerate() {
        end += line.len();
        let prefix = &code[..end];
        if let Err(err) = Script::parse(Source::from_bytes(prefix), None, &mut context) {
            let same = match err.try_native(&mut context) {
                Ok(native) => native.message() == message,
                Err(_) => false,
            };
            if same {
                return Some(index + 1);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridLevel;
    use crate::session::RunningGuard;
    use std::time::Duration;

    fn environment(budget_ms: u64) -> (ExecutionEnvironment, Rc<SessionShared>) {
        let config = SandboxConfig {
            allowed_time: Duration::from_millis(budget_ms),
            ..SandboxConfig::default()
        };
        let shared = Rc::new(SessionShared::new(config.allowed_time));
        let live = GridLevel::new(10, 10).shared();
        let dummy = live.borrow().spawn_dummy();
        let env = ExecutionEnvironment::build(&config, Rc::clone(&shared), live, dummy).unwrap();
        (env, shared)
    }

    fn eval_string(env: &mut ExecutionEnvironment, code: &str) -> String {
        let value = env.evaluate(code).unwrap();
        value
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_default()
    }

    #[test]
    fn only_allowlisted_globals_survive() {
        let (mut env, _) = environment(200);
        for name in ALLOWED_GLOBALS {
            assert_ne!(
                eval_string(&mut env, &format!("typeof {name}")),
                "undefined",
                "{name} should survive"
            );
        }
        for name in ["Function", "eval", "globalThis", "Reflect", "Proxy", "JSON"] {
            assert_eq!(
                eval_string(&mut env, &format!("typeof {name}")),
                "undefined",
                "{name} should be purged"
            );
        }
    }

    #[test]
    fn function_constructor_is_unreachable() {
        let (mut env, _) = environment(200);
        assert_eq!(
            eval_string(&mut env, "typeof (function () {}).constructor"),
            "undefined"
        );
        assert_eq!(
            eval_string(&mut env, "typeof (function* () {}).constructor"),
            "undefined"
        );
        assert_eq!(
            eval_string(&mut env, "typeof (async function () {}).constructor"),
            "undefined"
        );
    }

    #[test]
    fn loop_guard_is_frozen() {
        let (mut env, _) = environment(200);
        env.evaluate("__playpenGuard.check = function () {};").unwrap();
        assert_eq!(
            eval_string(&mut env, "typeof __playpenGuard.check"),
            "function"
        );
        assert!(env.evaluate("'use strict'; __playpenGuard = 1;").is_err());
    }

    #[test]
    fn loop_guard_records_timeout() {
        let (mut env, shared) = environment(20);
        let err = env
            .evaluate("var s = __playpenGuard.enter(); while (true) { __playpenGuard.check(s, 4); }")
            .unwrap_err();
        let err = env.script_error(&err);
        assert!(err.to_string().contains("TimeOutException"), "{err}");
        assert!(matches!(
            shared.take_fault(),
            Some(SandboxError::Timeout { line: 4, budget_ms: 20 })
        ));
    }

    #[test]
    fn maze_helper_visits_every_cell() {
        let (mut env, _) = environment(2000);
        let cells = env
            .evaluate(
                "var n = 0, walls = 0; \
                 new ROT.Map.DividedMaze(9, 7).create(function (x, y, w) { n++; walls += w; }); \
                 [n, walls]",
            )
            .unwrap();
        let cells = JsArray::from_object(cells.as_object().unwrap().clone()).unwrap();
        let visited = cells.get(0, env.context()).unwrap().to_number(env.context()).unwrap();
        let walls = cells.get(1, env.context()).unwrap().to_number(env.context()).unwrap();
        assert_eq!(visited, 63.0);
        // the border alone is 2 * (9 + 7) - 4 cells
        assert!(walls >= 28.0);
    }

    #[test]
    fn private_members_guarded_while_running() {
        let (mut env, shared) = environment(200);
        let actor = env.pair(Instance::Dummy).actor.clone();
        env.context()
            .register_global_property(js_string!("subject"), actor, Attribute::all())
            .unwrap();

        {
            let _running = RunningGuard::engage(&shared);
            assert!(env.evaluate("subject._canMove").is_err());
        }
        assert!(matches!(
            shared.take_fault(),
            Some(SandboxError::PrivilegedAccess { .. })
        ));

        assert!(env.evaluate("subject._canMove").is_ok());
        assert!(shared.take_fault().is_none());
    }

    #[test]
    fn tampering_is_detected() {
        let (mut env, _) = environment(200);
        assert!(env.detect_tampering(Instance::Dummy).is_ok());
        let level = env.pair(Instance::Dummy).level.clone();
        env.context()
            .register_global_property(js_string!("lvl"), level, Attribute::all())
            .unwrap();
        env.evaluate("lvl.placeObject = function () {};").unwrap();
        match env.detect_tampering(Instance::Dummy) {
            Err(SandboxError::TamperedFunction { name }) => assert_eq!(name, "placeObject"),
            other => panic!("expected tampering, got {other:?}"),
        }
        assert!(env.detect_tampering(Instance::Live).is_ok());
    }

    #[test]
    fn global_function_ignores_non_functions() {
        let (mut env, _) = environment(200);
        env.evaluate("function startLevel(map) {} var validateLevel = 3;")
            .unwrap();
        assert!(env.global_function("startLevel").is_some());
        assert!(env.global_function("validateLevel").is_none());
        assert!(env.global_function("onExit").is_none());
    }

    #[test]
    fn strip_tags_keeps_text() {
        assert_eq!(strip_tags("<p>hello <b>you</b></p>"), "hello you");
    }
}
