//! Tests for callbacks driven through the callback guard.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use playpen_sandbox::callback::{RELOAD_CUE, VALIDATION_FAILED_CUE};
use playpen_sandbox::{
    CallbackOptions, GridLevel, LevelHost, LevelProperties, SandboxConfig,
    SandboxError, SandboxSession, SharedHost, SoundCue, StatusSink, Submission,
};
use serde_json::json;

#[derive(Default)]
struct Recorder {
    errors: RefCell<Vec<(String, Option<String>)>>,
    statuses: RefCell<Vec<String>>,
    sounds: RefCell<Vec<String>>,
}

impl StatusSink for Recorder {
    fn append_error(&self, message: &str, cue: Option<&str>) {
        self.errors
            .borrow_mut()
            .push((message.to_string(), cue.map(str::to_string)));
    }

    fn write_status(&self, message: &str) {
        self.statuses.borrow_mut().push(message.to_string());
    }
}

impl SoundCue for Recorder {
    fn play_sound(&self, name: &str) {
        self.sounds.borrow_mut().push(name.to_string());
    }
}

struct Harness {
    session: SandboxSession,
    grid: Rc<RefCell<GridLevel>>,
    recorder: Rc<Recorder>,
}

impl Harness {
    fn new(properties: LevelProperties) -> Self {
        let grid = Rc::new(RefCell::new(
            GridLevel::new(10, 10).with_properties(properties),
        ));
        let live: SharedHost = grid.clone();
        let recorder = Rc::new(Recorder::default());
        let config = SandboxConfig {
            allowed_time: Duration::from_millis(200),
            ..SandboxConfig::default()
        };
        let session = SandboxSession::new(config, live)
            .with_status(recorder.clone())
            .with_sound(recorder.clone());
        Self {
            session,
            grid,
            recorder,
        }
    }

    /// Validate `body` as the setup of a level and start it on the live level.
    fn start(&mut self, body: &str, author: &str) {
        let code = format!(
            "function startLevel(map) {{\n    map._startOfStartLevelReached();\n    map.placePlayer(1, 1);\n{body}\n    map._endOfStartLevelReached();\n}}\n{author}"
        );
        let entry = self
            .session
            .validate(&Submission::fresh(code, body))
            .unwrap();
        self.session.start_level(&entry).unwrap();
        self.grid.borrow_mut().begin_play();
    }

    fn fire_timers(&mut self, ms: u64) -> usize {
        self.grid.borrow_mut().advance(ms);
        self.session.dispatch_pending().unwrap()
    }

    fn last_cue(&self) -> Option<String> {
        self.recorder
            .errors
            .borrow()
            .last()
            .and_then(|(_, cue)| cue.clone())
    }
}

fn harness() -> Harness {
    Harness::new(LevelProperties::default())
}

#[test]
fn well_behaved_callbacks_run() {
    let mut h = harness();
    h.start(
        "    map.startTimer(function () { map.getPlayer().move('right'); }, 100);",
        "",
    );
    assert_eq!(h.fire_timers(250), 2);
    assert_eq!(h.grid.borrow().player_position(), Some((3, 1)));
    assert!(!h.session.has_failed_closed());
    assert!(!h.session.is_running());
}

#[test]
fn privileged_read_in_callback_fails_closed() {
    let mut h = harness();
    h.start(
        "    map.overrideKey('up', function (player) { var c = player._canMove; });\n    map.startTimer(function () {}, 100);",
        "",
    );
    assert_eq!(h.grid.borrow().timer_count(), 1);

    h.grid.borrow_mut().press_key("up").unwrap();
    h.session.dispatch_pending().unwrap();

    assert!(h.session.has_failed_closed());
    assert!(!h.session.is_running());
    assert_eq!(h.last_cue().as_deref(), Some(RELOAD_CUE));
    let grid = h.grid.borrow();
    assert!(!grid.player_can_move());
    assert!(grid.callback_validation_failed());
    assert_eq!(grid.timer_count(), 0);
    assert_eq!(h.recorder.sounds.borrow().as_slice(), ["static"]);
    let (message, _) = h.recorder.errors.borrow().last().cloned().unwrap();
    assert_eq!(message, "Attempt to read private property _canMove");
}

#[test]
fn caught_privileged_write_still_fails_closed() {
    let mut h = harness();
    h.start(
        "    map.overrideKey('up', function (player) { try { player._canMove = true; } catch (e) {} });",
        "",
    );
    h.grid.borrow_mut().press_key("up").unwrap();
    h.session.dispatch_pending().unwrap();
    assert!(h.session.has_failed_closed());
    assert!(!h.session.is_running());
}

#[test]
fn forbidden_call_after_level_start_fails_closed() {
    let mut h = harness();
    h.start(
        "    map.overrideKey('up', function (player) { map.placePlayer(0, 0); });",
        "",
    );
    h.grid.borrow_mut().press_key("up").unwrap();
    h.session.dispatch_pending().unwrap();

    assert!(h.session.has_failed_closed());
    assert!(!h.session.is_running());
    assert_eq!(h.last_cue().as_deref(), Some(RELOAD_CUE));
    let (message, _) = h.recorder.errors.borrow().last().cloned().unwrap();
    assert_eq!(message, "Forbidden method call: placePlayer()");
}

#[test]
fn failing_post_check_fails_closed() {
    let mut h = harness();
    h.start(
        "    map.placeObject(5, 5, 'exit');\n    map.startTimer(function () { map.placeObject(6, 6, 'exit'); }, 100);",
        "function validateLevel(map) {\n    map.validateExactlyXManyObjects(1, 'exit');\n}\n",
    );
    h.fire_timers(100);

    assert!(h.session.has_failed_closed());
    assert!(!h.session.is_running());
    assert_eq!(h.last_cue().as_deref(), Some(VALIDATION_FAILED_CUE));
    assert!(h.grid.borrow().callback_validation_failed());
}

#[test]
fn tampering_in_timer_fails_closed() {
    let mut h = harness();
    h.start(
        "    map.startTimer(function () { map.getPlayer().move = function () {}; }, 100);",
        "",
    );
    h.fire_timers(100);

    assert!(h.session.has_failed_closed());
    assert!(!h.session.is_running());
    assert_eq!(h.last_cue().as_deref(), Some(VALIDATION_FAILED_CUE));
    let (message, _) = h.recorder.errors.borrow().last().cloned().unwrap();
    assert_eq!(message, "move() has been tampered with!");
    assert!(matches!(
        h.session.detect_tampering(),
        Err(SandboxError::TamperedFunction { name }) if name == "move"
    ));
}

#[test]
fn callbacks_stop_after_failing_closed() {
    let mut h = harness();
    h.start(
        "    map.startTimer(function () { map.getPlayer().move = function () {}; }, 100);",
        "",
    );
    h.grid.borrow_mut().advance(100);
    // two more callbacks queue behind the tampering one
    h.grid.borrow_mut().advance(200);
    assert_eq!(h.session.dispatch_pending().unwrap(), 1);
}

#[test]
fn reduced_integrity_skips_post_check_and_tamper_detection() {
    let mut h = Harness::new(LevelProperties {
        reduced_integrity: true,
        ..LevelProperties::default()
    });
    h.start(
        "    map.startTimer(function () { map.getPlayer().move = function () {}; }, 100);",
        "",
    );
    h.fire_timers(100);

    assert!(!h.session.has_failed_closed());
    assert!(h.session.detect_tampering().is_err());
}

#[test]
fn reduced_integrity_keeps_privileged_guard() {
    let mut h = Harness::new(LevelProperties {
        reduced_integrity: true,
        ..LevelProperties::default()
    });
    h.start(
        "    map.startTimer(function () { var d = map._dummy; }, 100);",
        "",
    );
    h.fire_timers(100);
    assert!(h.session.has_failed_closed());
    assert_eq!(h.last_cue().as_deref(), Some(RELOAD_CUE));
}

#[test]
fn admin_override_disables_tamper_detection_only() {
    let mut h = harness();
    h.start(
        "    map.startTimer(function () { map.getPlayer().move = function () {}; }, 100);",
        "",
    );
    h.session.set_admin_override();
    h.fire_timers(100);
    assert!(!h.session.has_failed_closed());
    assert!(h.session.detect_tampering().is_ok());
}

#[test]
fn script_errors_go_to_status_without_propagation() {
    let mut h = harness();
    h.start("    map.startTimer(function () { throw 'oops'; }, 100);", "");
    h.fire_timers(100);

    assert!(!h.session.has_failed_closed());
    assert!(!h.session.is_running());
    assert_eq!(h.recorder.statuses.borrow().as_slice(), ["oops"]);
}

#[test]
fn script_errors_propagate_when_asked() {
    let mut h = harness();
    h.start("    map.startTimer(function () { throw 'oops'; }, 100);", "");
    h.grid.borrow_mut().advance(100);
    let pending = h.grid.borrow_mut().take_pending();
    assert_eq!(pending.len(), 1);

    let result = h.session.invoke_callback(
        pending[0].id,
        &pending[0].args,
        CallbackOptions {
            propagate_errors: true,
            ..CallbackOptions::default()
        },
    );
    assert!(matches!(
        result,
        Err(SandboxError::Script { message }) if message == "oops"
    ));
    assert!(!h.session.is_running());
}

#[test]
fn collision_callbacks_receive_actor_and_object() {
    let mut h = harness();
    h.start(
        "    map.defineObject('mine', { onCollision: function (player, obj) { return obj.type + ':' + player.getX(); } });\n    map.placeObject(2, 1, 'mine');",
        "",
    );
    h.grid.borrow_mut().press_key("right").unwrap();
    let pending = h.grid.borrow_mut().take_pending();
    assert_eq!(pending.len(), 1);

    let returned = h
        .session
        .invoke_callback(pending[0].id, &pending[0].args, CallbackOptions::default())
        .unwrap();
    assert_eq!(returned, Some(json!("mine:2")));
    assert!(!h.session.is_running());
}

#[test]
fn one_function_keeps_one_callback_id() {
    let mut h = harness();
    h.start(
        "    var step = function (player) {};\n    map.overrideKey('up', step);\n    map.overrideKey('down', step);",
        "",
    );
    h.grid.borrow_mut().press_key("up").unwrap();
    h.grid.borrow_mut().press_key("down").unwrap();
    let pending = h.grid.borrow_mut().take_pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, pending[1].id);
    assert_eq!(h.session.registered_callbacks(), 1);
}

#[test]
fn dropped_callbacks_are_released() {
    let mut h = harness();
    h.start(
        "    map.startTimer(function () { map.overrideKey('up', function (player) {}); }, 100);",
        "",
    );
    // the dummy passes registered their own timers; only the live one is kept
    assert_eq!(h.session.registered_callbacks(), 1);

    assert_eq!(h.fire_timers(1000), 10);
    // the timer plus the latest key override
    assert_eq!(h.session.registered_callbacks(), 2);

    h.grid.borrow_mut().press_key("up").unwrap();
    assert_eq!(h.session.dispatch_pending().unwrap(), 1);
    assert!(!h.session.has_failed_closed());
}

#[test]
fn returned_accessor_cannot_reach_private_members() {
    let mut h = harness();
    h.start(
        "    map.overrideKey('up', function (player) { return { get x() { return player._x; } }; });",
        "",
    );
    h.grid.borrow_mut().press_key("up").unwrap();
    let pending = h.grid.borrow_mut().take_pending();

    let returned = h
        .session
        .invoke_callback(pending[0].id, &pending[0].args, CallbackOptions::default())
        .unwrap();
    assert_eq!(returned, None);
    assert!(h.session.has_failed_closed());
}

#[test]
fn skipping_enforcement_allows_private_reads() {
    let mut h = harness();
    h.start(
        "    map.overrideKey('up', function (player) { return player._canMove; });",
        "",
    );
    h.grid.borrow_mut().press_key("up").unwrap();
    let pending = h.grid.borrow_mut().take_pending();

    let returned = h
        .session
        .invoke_callback(
            pending[0].id,
            &pending[0].args,
            CallbackOptions {
                skip_forbidden_enforcement: true,
                ..CallbackOptions::default()
            },
        )
        .unwrap();
    assert_eq!(returned, Some(json!(true)));
    assert!(!h.session.has_failed_closed());
}

#[test]
fn guard_requires_an_accepted_script() {
    let grid = GridLevel::new(5, 5).shared();
    let mut session = SandboxSession::new(SandboxConfig::default(), grid);
    let result = session.guard_callback(CallbackOptions::default(), |_| {
        Ok(boa_engine::JsValue::undefined())
    });
    assert!(matches!(result, Err(SandboxError::NoAcceptedScript)));
}
