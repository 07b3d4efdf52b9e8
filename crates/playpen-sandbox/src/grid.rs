//! `GridLevel`: an in-memory reference level host.
//!
//! Used for dummy passes, tests and the CLI. It keeps a width×height grid of
//! placed objects, a player, timers, key overrides and a queue of callbacks
//! waiting to be dispatched through the callback guard.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use playpen_error::HostError;
use serde_json::{json, Map, Value};

use crate::capability::{CallbackArg, CallbackId, CapabilityKind, PendingCallback};
use crate::{LevelHost, LevelProperties, SharedHost};

/// Canvas cell size in pixels.
const CELL_SIZE: u32 = 20;

const DEFAULT_PLAYER_COLOR: &str = "#0f0";

/// Object types every level knows: (name, impassable, item).
const BUILTIN_TYPES: &[(&str, bool, bool)] = &[
    ("block", true, false),
    ("tree", true, false),
    ("exit", false, false),
    ("computer", false, true),
    ("phone", false, true),
    ("redKey", false, true),
    ("greenKey", false, true),
    ("blueKey", false, true),
    ("yellowKey", false, true),
];

const LEVEL_PRIVATE: &[&str] = &["_dummy", "_properties", "_callbackValidationFailed", "_timers"];
const ACTOR_PRIVATE: &[&str] = &["_canMove", "_x", "_y", "_color", "_inventory"];

/// An object placed on the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedObject {
    /// Object type.
    pub kind: String,
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Whether the type was defined as dynamic.
    pub dynamic: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Player {
    x: u32,
    y: u32,
    color: String,
    inventory: Vec<String>,
    last_direction: Option<String>,
    can_move: bool,
}

#[derive(Debug, Clone)]
struct Timer {
    callback: CallbackId,
    interval_ms: u64,
    next_due_ms: u64,
}

/// An in-memory level.
#[derive(Debug, Clone)]
pub struct GridLevel {
    width: u32,
    height: u32,
    properties: LevelProperties,
    dummy: bool,
    source_lines: usize,
    definitions: BTreeMap<String, Value>,
    objects: Vec<PlacedObject>,
    player: Option<Player>,
    timers: Vec<Timer>,
    key_overrides: BTreeMap<String, CallbackId>,
    phone: Option<CallbackId>,
    dom: String,
    square_colors: BTreeMap<(u32, u32), String>,
    status: Vec<String>,
    chapter: Option<String>,
    start_of_level: bool,
    callback_validation_failed: bool,
    exit_reached: bool,
    pending: VecDeque<PendingCallback>,
    clock_ms: u64,
    seed: u64,
}

impl GridLevel {
    /// An empty level of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            properties: LevelProperties::default(),
            dummy: false,
            source_lines: 0,
            definitions: BTreeMap::new(),
            objects: Vec::new(),
            player: None,
            timers: Vec::new(),
            key_overrides: BTreeMap::new(),
            phone: None,
            dom: String::new(),
            square_colors: BTreeMap::new(),
            status: Vec::new(),
            chapter: None,
            start_of_level: true,
            callback_validation_failed: false,
            exit_reached: false,
            pending: VecDeque::new(),
            clock_ms: 0,
            seed: 0x2545_f491_4f6c_dd1d,
        }
    }

    /// Set the level's property bag.
    pub fn with_properties(mut self, properties: LevelProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Number of lines in the level script, for `validateAtLeastXLines`.
    pub fn with_source_lines(mut self, lines: usize) -> Self {
        self.source_lines = lines;
        self
    }

    /// Wrap the level for sharing with a sandbox session.
    pub fn shared(self) -> SharedHost {
        Rc::new(RefCell::new(self))
    }

    /// Leave the start of the level; `placePlayer` is forbidden from now on.
    pub fn begin_play(&mut self) {
        self.start_of_level = false;
    }

    /// Advance the level clock and queue every timer that came due.
    pub fn advance(&mut self, ms: u64) {
        self.clock_ms += ms;
        for timer in &mut self.timers {
            while timer.next_due_ms <= self.clock_ms {
                self.pending.push_back(PendingCallback {
                    id: timer.callback,
                    args: Vec::new(),
                });
                timer.next_due_ms += timer.interval_ms;
            }
        }
    }

    /// Press a key: run its override, or move the player.
    pub fn press_key(&mut self, key: &str) -> Result<(), HostError> {
        if let Some(id) = self.key_overrides.get(key) {
            self.pending.push_back(PendingCallback {
                id: *id,
                args: vec![CallbackArg::Actor],
            });
            return Ok(());
        }
        self.move_player(key)
    }

    /// Use the phone: queue the phone callback, if one is set.
    pub fn use_phone(&mut self) -> bool {
        match self.phone {
            Some(id) if self.player_has("phone") => {
                self.pending.push_back(PendingCallback {
                    id,
                    args: Vec::new(),
                });
                true
            }
            _ => false,
        }
    }

    /// Lines written by `displayChapter`, `killedBy` and the exit.
    pub fn status_lines(&self) -> &[String] {
        &self.status
    }

    /// Player position, if a player was placed.
    pub fn player_position(&self) -> Option<(u32, u32)> {
        self.player.as_ref().map(|p| (p.x, p.y))
    }

    /// Whether the player may still act.
    pub fn player_can_move(&self) -> bool {
        self.player.as_ref().is_some_and(|p| p.can_move)
    }

    /// Number of placed objects of a type.
    pub fn object_count(&self, kind: &str) -> usize {
        self.objects.iter().filter(|o| o.kind == kind).count()
    }

    /// Number of running timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Whether this is a dummy copy.
    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// Whether a callback failed validation on this level.
    pub fn callback_validation_failed(&self) -> bool {
        self.callback_validation_failed
    }

    /// Whether the player reached an exit.
    pub fn exit_reached(&self) -> bool {
        self.exit_reached
    }

    fn in_bounds(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    fn object_at(&self, x: u32, y: u32) -> Option<&PlacedObject> {
        self.objects.iter().find(|o| o.x == x && o.y == y)
    }

    fn is_known_type(&self, kind: &str) -> bool {
        self.definitions.contains_key(kind) || BUILTIN_TYPES.iter().any(|(name, ..)| *name == kind)
    }

    fn is_impassable(&self, kind: &str) -> bool {
        if let Some(definition) = self.definitions.get(kind) {
            return definition
                .get("impassable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
        BUILTIN_TYPES
            .iter()
            .any(|(name, impassable, _)| *name == kind && *impassable)
    }

    fn is_item(&self, kind: &str) -> bool {
        if let Some(definition) = self.definitions.get(kind) {
            return definition.get("type").and_then(Value::as_str) == Some("item");
        }
        BUILTIN_TYPES
            .iter()
            .any(|(name, _, item)| *name == kind && *item)
    }

    fn player_has(&self, item: &str) -> bool {
        self.player
            .as_ref()
            .is_some_and(|p| p.inventory.iter().any(|i| i == item))
    }

    fn player_mut(&mut self, op: &str) -> Result<&mut Player, HostError> {
        self.player
            .as_mut()
            .ok_or_else(|| HostError::invalid(op, "there is no player on this level"))
    }

    fn player_ref(&self, op: &str) -> Result<&Player, HostError> {
        self.player
            .as_ref()
            .ok_or_else(|| HostError::invalid(op, "there is no player on this level"))
    }

    fn next_random(&mut self) -> u64 {
        // xorshift64
        let mut x = self.seed;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed = x;
        x
    }

    fn move_player(&mut self, direction: &str) -> Result<(), HostError> {
        let (dx, dy): (i64, i64) = match direction {
            "up" => (0, -1),
            "down" => (0, 1),
            "left" => (-1, 0),
            "right" => (1, 0),
            other => {
                return Err(HostError::invalid(
                    "move",
                    format!("unknown direction '{other}'"),
                ))
            }
        };
        let player = self.player_ref("move")?;
        if !player.can_move {
            return Ok(());
        }
        let (x, y) = (i64::from(player.x) + dx, i64::from(player.y) + dy);
        let target = u32::try_from(x).ok().zip(u32::try_from(y).ok());

        let Some((x, y)) = target.filter(|(x, y)| self.in_bounds(*x, *y)) else {
            return Ok(());
        };
        let occupant = self.object_at(x, y).cloned();
        if let Some(object) = &occupant {
            if self.is_impassable(&object.kind) {
                return Ok(());
            }
        }

        let player = self.player_mut("move")?;
        player.x = x;
        player.y = y;
        player.last_direction = Some(direction.to_string());

        let Some(object) = occupant else {
            return Ok(());
        };
        if object.kind == "exit" {
            self.exit_reached = true;
            self.status.push("You have reached the exit!".into());
        } else if self.is_item(&object.kind) {
            self.objects.retain(|o| !(o.x == x && o.y == y));
            let player = self.player_mut("move")?;
            player.inventory.push(object.kind.clone());
        }
        let collision = self
            .definitions
            .get(&object.kind)
            .and_then(|d| d.get("onCollision"))
            .and_then(CallbackId::from_json);
        if let Some(id) = collision {
            self.pending.push_back(PendingCallback {
                id,
                args: vec![
                    CallbackArg::Actor,
                    CallbackArg::Json(json!({"type": object.kind, "x": x, "y": y})),
                ],
            });
        }
        Ok(())
    }

    fn count_check(
        &self,
        op: &str,
        args: &[Value],
        accept: impl Fn(usize, usize) -> bool,
        expectation: &str,
    ) -> Result<Value, HostError> {
        let expected = arg_u32(op, args, 0)? as usize;
        let kind = arg_str(op, args, 1)?;
        let found = self.object_count(kind);
        if accept(found, expected) {
            Ok(Value::Null)
        } else {
            Err(HostError::Failed(format!(
                "{expectation} {kind}s on the map! Expected: {expected}, found: {found}"
            )))
        }
    }

    fn invoke_level(&mut self, op: &str, args: &[Value]) -> Result<Value, HostError> {
        match op {
            "countObjects" => Ok(json!(self.object_count(arg_str(op, args, 0)?))),
            "createFromDOM" | "updateDOM" => {
                self.dom = arg_str(op, args, 0)?.to_string();
                Ok(Value::Null)
            }
            "createFromGrid" => {
                let rows = args
                    .first()
                    .and_then(Value::as_array)
                    .ok_or_else(|| HostError::invalid(op, "expected an array of rows"))?;
                let legend = args
                    .get(1)
                    .and_then(Value::as_object)
                    .ok_or_else(|| HostError::invalid(op, "expected a tile legend"))?;
                let x_offset = optional_u32(args, 2);
                let y_offset = optional_u32(args, 3);
                let mut placements = Vec::new();
                for (row, line) in rows.iter().enumerate() {
                    let line = line
                        .as_str()
                        .ok_or_else(|| HostError::invalid(op, "rows must be strings"))?;
                    for (col, symbol) in line.chars().enumerate() {
                        let Some(kind) = legend
                            .get(&symbol.to_string())
                            .and_then(Value::as_str)
                        else {
                            continue;
                        };
                        placements.push((col as u32 + x_offset, row as u32 + y_offset, kind));
                    }
                }
                for (x, y, kind) in placements {
                    if kind == "player" {
                        self.place_player(x, y)?;
                    } else {
                        self.place_object(op, x, y, kind)?;
                    }
                }
                Ok(Value::Null)
            }
            "displayChapter" => {
                let title = arg_str(op, args, 0)?.to_string();
                self.status.push(title.clone());
                self.chapter = Some(title);
                Ok(Value::Null)
            }
            "defineObject" => {
                let name = arg_str(op, args, 0)?;
                if name.is_empty() || name == "player" || name == "empty" {
                    return Err(HostError::invalid(op, format!("'{name}' is reserved")));
                }
                let properties = args
                    .get(1)
                    .filter(|v| v.is_object())
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                self.definitions.insert(name.to_string(), properties);
                Ok(Value::Null)
            }
            "getAdjacentEmptyCells" => {
                let (x, y) = (arg_u32(op, args, 0)?, arg_u32(op, args, 1)?);
                let candidates = [
                    (x.checked_sub(1), Some(y), "left"),
                    (x.checked_add(1), Some(y), "right"),
                    (Some(x), y.checked_sub(1), "up"),
                    (Some(x), y.checked_add(1), "down"),
                ];
                let cells: Vec<Value> = candidates
                    .into_iter()
                    .filter_map(|(cx, cy, dir)| Some((cx?, cy?, dir)))
                    .filter(|(cx, cy, _)| {
                        self.in_bounds(*cx, *cy)
                            && self.object_at(*cx, *cy).is_none()
                            && self.player_position() != Some((*cx, *cy))
                    })
                    .map(|(cx, cy, dir)| json!([[cx, cy], dir]))
                    .collect();
                Ok(Value::Array(cells))
            }
            "getCanvasContext" => Ok(Value::Null),
            "getCanvasCoords" => {
                let (x, y) = (arg_u32(op, args, 0)?, arg_u32(op, args, 1)?);
                Ok(json!({"x": x * CELL_SIZE, "y": y * CELL_SIZE}))
            }
            "getDOM" => Ok(Value::String(self.dom.clone())),
            "getDynamicObjects" => Ok(Value::Array(
                self.objects
                    .iter()
                    .filter(|o| o.dynamic)
                    .map(|o| json!({"type": o.kind, "x": o.x, "y": o.y}))
                    .collect(),
            )),
            "getHeight" => Ok(json!(self.height)),
            "getWidth" => Ok(json!(self.width)),
            "getObjectTypeAt" => {
                let (x, y) = (arg_u32(op, args, 0)?, arg_u32(op, args, 1)?);
                if self.player_position() == Some((x, y)) {
                    return Ok(json!("player"));
                }
                Ok(json!(self
                    .object_at(x, y)
                    .map(|o| o.kind.as_str())
                    .unwrap_or("empty")))
            }
            "getPlayer" => Ok(Value::Null),
            "getRandomColor" => {
                let rgb = self.next_random() & 0x00ff_ffff;
                Ok(json!(format!("#{rgb:06x}")))
            }
            "isStartOfLevel" => Ok(json!(self.start_of_level)),
            "overrideKey" => {
                let key = arg_str(op, args, 0)?.to_string();
                let id = arg_callback(op, args, 1)?;
                self.key_overrides.insert(key, id);
                Ok(Value::Null)
            }
            "placeObject" => {
                let (x, y) = (arg_u32(op, args, 0)?, arg_u32(op, args, 1)?);
                let kind = arg_str(op, args, 2)?.to_string();
                self.place_object(op, x, y, &kind)?;
                Ok(Value::Null)
            }
            "placePlayer" => {
                let (x, y) = (arg_u32(op, args, 0)?, arg_u32(op, args, 1)?);
                self.place_player(x, y)?;
                Ok(Value::Null)
            }
            "setSquareColor" => {
                let (x, y) = (arg_u32(op, args, 0)?, arg_u32(op, args, 1)?);
                let color = arg_str(op, args, 2)?.to_string();
                self.square_colors.insert((x, y), color);
                Ok(Value::Null)
            }
            "startTimer" => {
                let callback = arg_callback(op, args, 0)?;
                let interval_ms = u64::from(optional_u32(args, 1)).max(1);
                self.timers.push(Timer {
                    callback,
                    interval_ms,
                    next_due_ms: self.clock_ms + interval_ms,
                });
                Ok(Value::Null)
            }
            "validateAtLeastXObjects" => {
                self.count_check(op, args, |found, n| found >= n, "Not enough")
            }
            "validateAtMostXObjects" => {
                self.count_check(op, args, |found, n| found <= n, "Too many")
            }
            "validateExactlyXManyObjects" => self.count_check(
                op,
                args,
                |found, n| found == n,
                "Wrong number of",
            ),
            "validateAtMostXDynamicObjects" => {
                let expected = arg_u32(op, args, 0)? as usize;
                let found = self.objects.iter().filter(|o| o.dynamic).count();
                if found <= expected {
                    Ok(Value::Null)
                } else {
                    Err(HostError::Failed(format!(
                        "Too many dynamic objects on the map! Expected: {expected}, found: {found}"
                    )))
                }
            }
            "validateNoTimers" => {
                if self.timers.is_empty() {
                    Ok(Value::Null)
                } else {
                    Err(HostError::Failed(format!(
                        "Too many timers set on the map! Expected: 0, found: {}",
                        self.timers.len()
                    )))
                }
            }
            "validateAtLeastXLines" => {
                let expected = arg_u32(op, args, 0)? as usize;
                if self.source_lines >= expected {
                    Ok(Value::Null)
                } else {
                    Err(HostError::Failed(format!(
                        "Not enough lines of code! Expected: {expected}, found: {}",
                        self.source_lines
                    )))
                }
            }
            other => Err(HostError::UnknownOperation { op: other.into() }),
        }
    }

    fn invoke_actor(&mut self, op: &str, args: &[Value]) -> Result<Value, HostError> {
        match op {
            "atLocation" => {
                let (x, y) = (arg_u32(op, args, 0)?, arg_u32(op, args, 1)?);
                let player = self.player_ref(op)?;
                Ok(json!(player.x == x && player.y == y))
            }
            "getColor" => Ok(json!(self.player_ref(op)?.color)),
            "getLastMoveDirection" => Ok(json!(self.player_ref(op)?.last_direction)),
            "getX" => Ok(json!(self.player_ref(op)?.x)),
            "getY" => Ok(json!(self.player_ref(op)?.y)),
            "hasItem" => {
                let item = arg_str(op, args, 0)?;
                self.player_ref(op)?;
                Ok(json!(self.player_has(item)))
            }
            "killedBy" => {
                let cause = arg_str(op, args, 0)?.to_string();
                self.player_mut(op)?.can_move = false;
                self.status.push(format!("You have been killed by {cause}!"));
                Ok(Value::Null)
            }
            "move" => {
                let direction = arg_str(op, args, 0)?.to_string();
                self.move_player(&direction)?;
                Ok(Value::Null)
            }
            "removeItem" => {
                let item = arg_str(op, args, 0)?.to_string();
                let player = self.player_mut(op)?;
                let before = player.inventory.len();
                player.inventory.retain(|i| *i != item);
                Ok(json!(player.inventory.len() != before))
            }
            "setColor" => {
                let color = arg_str(op, args, 0)?.to_string();
                self.player_mut(op)?.color = color;
                Ok(Value::Null)
            }
            "setPhoneCallback" => {
                let id = arg_callback(op, args, 0)?;
                self.phone = Some(id);
                Ok(Value::Null)
            }
            other => Err(HostError::UnknownOperation { op: other.into() }),
        }
    }

    fn place_object(&mut self, op: &str, x: u32, y: u32, kind: &str) -> Result<(), HostError> {
        if !self.in_bounds(x, y) {
            return Err(HostError::invalid(
                op,
                format!("({x}, {y}) is outside the level"),
            ));
        }
        if !self.is_known_type(kind) {
            return Err(HostError::invalid(
                op,
                format!("there is no type of object named {kind}"),
            ));
        }
        if self.player_position() == Some((x, y)) {
            return Err(HostError::invalid(op, "can't place an object on the player"));
        }
        let dynamic = self
            .definitions
            .get(kind)
            .and_then(|d| d.get("type"))
            .and_then(Value::as_str)
            == Some("dynamic");
        self.objects.retain(|o| !(o.x == x && o.y == y));
        self.objects.push(PlacedObject {
            kind: kind.to_string(),
            x,
            y,
            dynamic,
        });
        Ok(())
    }

    fn place_player(&mut self, x: u32, y: u32) -> Result<(), HostError> {
        if !self.start_of_level {
            return Err(HostError::Forbidden {
                op: "placePlayer".into(),
            });
        }
        if self.player.is_some() {
            return Err(HostError::invalid(
                "placePlayer",
                "can't place the player twice",
            ));
        }
        if !self.in_bounds(x, y) {
            return Err(HostError::invalid(
                "placePlayer",
                format!("({x}, {y}) is outside the level"),
            ));
        }
        self.player = Some(Player {
            x,
            y,
            color: DEFAULT_PLAYER_COLOR.into(),
            inventory: Vec::new(),
            last_direction: None,
            can_move: true,
        });
        Ok(())
    }
}

fn arg_u32(op: &str, args: &[Value], index: usize) -> Result<u32, HostError> {
    args.get(index)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            HostError::invalid(
                op,
                format!("argument {} must be a non-negative integer", index + 1),
            )
        })
}

fn optional_u32(args: &[Value], index: usize) -> u32 {
    args.get(index)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn arg_str<'a>(op: &str, args: &'a [Value], index: usize) -> Result<&'a str, HostError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| HostError::invalid(op, format!("argument {} must be a string", index + 1)))
}

fn collect_callbacks(value: &Value, out: &mut BTreeSet<CallbackId>) {
    if let Some(id) = CallbackId::from_json(value) {
        out.insert(id);
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_callbacks(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_callbacks(item, out)),
        _ => {}
    }
}

fn arg_callback(op: &str, args: &[Value], index: usize) -> Result<CallbackId, HostError> {
    args.get(index)
        .and_then(CallbackId::from_json)
        .ok_or_else(|| {
            HostError::invalid(op, format!("argument {} must be a function", index + 1))
        })
}

impl LevelHost for GridLevel {
    fn invoke(
        &mut self,
        kind: CapabilityKind,
        op: &str,
        args: Vec<Value>,
    ) -> Result<Value, HostError> {
        match kind {
            CapabilityKind::Level => self.invoke_level(op, &args),
            CapabilityKind::Actor => self.invoke_actor(op, &args),
        }
    }

    fn private_members(&self, kind: CapabilityKind) -> Vec<String> {
        let names = match kind {
            CapabilityKind::Level => LEVEL_PRIVATE,
            CapabilityKind::Actor => ACTOR_PRIVATE,
        };
        names.iter().map(|n| (*n).to_string()).collect()
    }

    fn read_private(&self, kind: CapabilityKind, name: &str) -> Option<Value> {
        match (kind, name) {
            (CapabilityKind::Level, "_dummy") => Some(json!(self.dummy)),
            (CapabilityKind::Level, "_properties") => serde_json::to_value(&self.properties).ok(),
            (CapabilityKind::Level, "_callbackValidationFailed") => {
                Some(json!(self.callback_validation_failed))
            }
            (CapabilityKind::Level, "_timers") => Some(json!(self.timers.len())),
            (CapabilityKind::Actor, name) => {
                let player = self.player.as_ref()?;
                match name {
                    "_canMove" => Some(json!(player.can_move)),
                    "_x" => Some(json!(player.x)),
                    "_y" => Some(json!(player.y)),
                    "_color" => Some(json!(player.color)),
                    "_inventory" => Some(json!(player.inventory)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn write_private(
        &mut self,
        kind: CapabilityKind,
        name: &str,
        value: Value,
    ) -> Result<(), HostError> {
        let reject = |value: Value| HostError::PrivateValue {
            name: name.to_string(),
            value,
        };
        match (kind, name) {
            (CapabilityKind::Level, "_callbackValidationFailed") => {
                self.callback_validation_failed = value.as_bool().ok_or_else(|| reject(value))?;
            }
            (CapabilityKind::Level, "_properties") => {
                self.properties = serde_json::from_value(value.clone()).map_err(|_| reject(value))?;
            }
            (CapabilityKind::Actor, "_canMove") => {
                let can_move = value.as_bool().ok_or_else(|| reject(value))?;
                self.player_mut("_canMove")?.can_move = can_move;
            }
            (CapabilityKind::Actor, "_x" | "_y") => {
                let coordinate = value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| reject(value))?;
                let player = self.player_mut(name)?;
                if name == "_x" {
                    player.x = coordinate;
                } else {
                    player.y = coordinate;
                }
            }
            (CapabilityKind::Actor, "_color") => {
                let color = value.as_str().ok_or_else(|| reject(value.clone()))?.to_string();
                self.player_mut(name)?.color = color;
            }
            _ => return Err(reject(value)),
        }
        Ok(())
    }

    fn properties(&self) -> LevelProperties {
        self.properties.clone()
    }

    fn reset(&mut self) {
        let fresh = GridLevel::new(self.width, self.height)
            .with_properties(self.properties.clone())
            .with_source_lines(self.source_lines);
        *self = GridLevel {
            dummy: self.dummy,
            ..fresh
        };
    }

    fn clear_timers(&mut self) {
        self.timers.clear();
    }

    fn disable_actor(&mut self) {
        if let Some(player) = &mut self.player {
            player.can_move = false;
        }
    }

    fn mark_callback_validation_failed(&mut self) {
        self.callback_validation_failed = true;
    }

    fn take_pending(&mut self) -> Vec<PendingCallback> {
        self.pending.drain(..).collect()
    }

    fn retained_callbacks(&self) -> BTreeSet<CallbackId> {
        let mut ids: BTreeSet<CallbackId> = self
            .timers
            .iter()
            .map(|timer| timer.callback)
            .chain(self.key_overrides.values().copied())
            .chain(self.phone)
            .chain(self.pending.iter().map(|pending| pending.id))
            .collect();
        for definition in self.definitions.values() {
            collect_callbacks(definition, &mut ids);
        }
        ids
    }

    fn dom(&self) -> String {
        self.dom.clone()
    }

    fn spawn_dummy(&self) -> SharedHost {
        let mut dummy = GridLevel::new(self.width, self.height)
            .with_properties(self.properties.clone())
            .with_source_lines(self.source_lines);
        dummy.dummy = true;
        dummy.dom = self.dom.clone();
        dummy.shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level() -> GridLevel {
        GridLevel::new(5, 5)
    }

    fn call(level: &mut GridLevel, op: &str, args: Value) -> Result<Value, HostError> {
        let args = args.as_array().cloned().unwrap_or_default();
        level.invoke(CapabilityKind::Level, op, args)
    }

    #[test]
    fn place_and_count_objects() {
        let mut level = level();
        call(&mut level, "placeObject", json!([1, 1, "block"])).unwrap();
        call(&mut level, "placeObject", json!([2, 1, "block"])).unwrap();
        assert_eq!(call(&mut level, "countObjects", json!(["block"])).unwrap(), json!(2));
        assert_eq!(
            call(&mut level, "getObjectTypeAt", json!([2, 1])).unwrap(),
            json!("block")
        );
        assert!(call(&mut level, "placeObject", json!([9, 9, "block"])).is_err());
        assert!(call(&mut level, "placeObject", json!([0, 0, "dragon"])).is_err());
    }

    #[test]
    fn validate_operations_report_counts() {
        let mut level = level();
        call(&mut level, "placeObject", json!([1, 1, "tree"])).unwrap();
        assert!(call(&mut level, "validateAtLeastXObjects", json!([1, "tree"])).is_ok());
        let err = call(&mut level, "validateAtLeastXObjects", json!([3, "tree"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Not enough trees on the map! Expected: 3, found: 1"
        );
        assert!(call(&mut level, "validateExactlyXManyObjects", json!([1, "tree"])).is_ok());
        assert!(call(&mut level, "validateAtMostXObjects", json!([0, "tree"])).is_err());
    }

    #[test]
    fn place_player_is_forbidden_after_start() {
        let mut level = level();
        call(&mut level, "placePlayer", json!([0, 0])).unwrap();
        level.reset();
        level.begin_play();
        let err = call(&mut level, "placePlayer", json!([0, 0])).unwrap_err();
        assert!(err.is_forbidden());
    }

    #[test]
    fn player_moves_and_collects_items() {
        let mut level = level();
        call(&mut level, "placePlayer", json!([0, 0])).unwrap();
        call(&mut level, "placeObject", json!([1, 0, "computer"])).unwrap();
        call(&mut level, "placeObject", json!([0, 1, "block"])).unwrap();

        level.press_key("down").unwrap();
        assert_eq!(level.player_position(), Some((0, 0)));

        level.press_key("right").unwrap();
        assert_eq!(level.player_position(), Some((1, 0)));
        let has = level
            .invoke(CapabilityKind::Actor, "hasItem", vec![json!("computer")])
            .unwrap();
        assert_eq!(has, json!(true));
        assert_eq!(level.object_count("computer"), 0);
    }

    #[test]
    fn collisions_queue_callbacks() {
        let mut level = level();
        call(
            &mut level,
            "defineObject",
            json!(["mine", {"onCollision": {"$callback": 4}}]),
        )
        .unwrap();
        call(&mut level, "placePlayer", json!([0, 0])).unwrap();
        call(&mut level, "placeObject", json!([1, 0, "mine"])).unwrap();
        level.press_key("right").unwrap();
        let pending = level.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, CallbackId(4));
        assert_eq!(pending[0].args[0], CallbackArg::Actor);
    }

    #[test]
    fn timers_fire_on_advance() {
        let mut level = level();
        call(&mut level, "startTimer", json!([{"$callback": 1}, 100])).unwrap();
        level.advance(250);
        assert_eq!(level.take_pending().len(), 2);
        assert!(call(&mut level, "validateNoTimers", json!([])).is_err());
        level.clear_timers();
        level.advance(1000);
        assert!(level.take_pending().is_empty());
    }

    #[test]
    fn key_overrides_replace_movement() {
        let mut level = level();
        call(&mut level, "placePlayer", json!([2, 2])).unwrap();
        call(&mut level, "overrideKey", json!(["up", {"$callback": 9}])).unwrap();
        level.press_key("up").unwrap();
        assert_eq!(level.player_position(), Some((2, 2)));
        assert_eq!(level.take_pending()[0].id, CallbackId(9));
    }

    #[test]
    fn retained_callbacks_cover_every_holder() {
        let mut level = level();
        call(&mut level, "placePlayer", json!([0, 0])).unwrap();
        call(&mut level, "startTimer", json!([{"$callback": 1}, 100])).unwrap();
        call(&mut level, "overrideKey", json!(["up", {"$callback": 2}])).unwrap();
        call(&mut level, "overrideKey", json!(["up", {"$callback": 3}])).unwrap();
        call(
            &mut level,
            "defineObject",
            json!(["mine", {"onCollision": {"$callback": 4}}]),
        )
        .unwrap();
        level
            .invoke(CapabilityKind::Actor, "setPhoneCallback", vec![json!({"$callback": 5})])
            .unwrap();
        level.advance(100);

        let ids: Vec<u32> = level.retained_callbacks().into_iter().map(|id| id.0).collect();
        assert_eq!(ids, vec![1, 3, 4, 5]);
    }

    #[test]
    fn private_members_round_trip() {
        let mut level = level();
        call(&mut level, "placePlayer", json!([1, 2])).unwrap();
        assert_eq!(
            level.read_private(CapabilityKind::Actor, "_canMove"),
            Some(json!(true))
        );
        level
            .write_private(CapabilityKind::Actor, "_canMove", json!(false))
            .unwrap();
        assert!(!level.player_can_move());
        assert!(level
            .write_private(CapabilityKind::Actor, "_canMove", json!("yes"))
            .is_err());
        assert_eq!(
            level.read_private(CapabilityKind::Level, "_dummy"),
            Some(json!(false))
        );
    }

    #[test]
    fn dummy_carries_properties_and_reset_clears_state() {
        let props = LevelProperties {
            allow_auxiliary_view: true,
            reduced_integrity: false,
        };
        let mut live = level().with_properties(props.clone());
        call(&mut live, "placeObject", json!([1, 1, "block"])).unwrap();
        let dummy = live.spawn_dummy();
        assert_eq!(dummy.borrow().properties(), props);
        assert_eq!(
            dummy.borrow().read_private(CapabilityKind::Level, "_dummy"),
            Some(json!(true))
        );

        live.reset();
        assert_eq!(live.object_count("block"), 0);
        assert_eq!(live.properties(), props);
    }
}
