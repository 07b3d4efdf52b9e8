#![warn(missing_docs)]

//! playpen: validate and run learner level scripts from the command line.
//!
//! ```text
//! playpen validate <level.js> [--player-code <file>] [--restart]
//! playpen instrument <level.js>
//! playpen run <level.js> [--player-code <file>] [--ticks N] [--tick-ms MS]
//! ```

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use playpen_config::PlaypenConfig;
use playpen_sandbox::audit::TracingAuditLogger;
use playpen_sandbox::instrument::instrument;
use playpen_sandbox::{
    EntryPointNames, GridLevel, LevelProperties, SandboxConfig, SandboxSession, SavedState,
    Submission,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const DEFAULT_WIDTH: u32 = 50;
const DEFAULT_HEIGHT: u32 = 25;

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Version,
    Validate {
        script: PathBuf,
        player_code: Option<PathBuf>,
        restart: bool,
    },
    Instrument {
        script: PathBuf,
    },
    Run {
        script: PathBuf,
        player_code: Option<PathBuf>,
        ticks: u32,
        tick_ms: u64,
    },
}

fn usage() -> &'static str {
    "usage: playpen <validate|instrument|run> <level.js> [--player-code FILE] [--restart] [--ticks N] [--tick-ms MS]"
}

fn parse_args(args: &[String]) -> Result<Command> {
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(Command::Version);
    }
    let Some((command, rest)) = args.split_first() else {
        bail!("{}", usage());
    };

    let mut script = None;
    let mut player_code = None;
    let mut restart = false;
    let mut ticks = 10;
    let mut tick_ms = 100;

    let mut rest = rest.iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--player-code" => {
                let value = rest.next().context("--player-code needs a file")?;
                player_code = Some(PathBuf::from(value));
            }
            "--restart" => restart = true,
            "--ticks" => {
                let value = rest.next().context("--ticks needs a number")?;
                ticks = value
                    .parse()
                    .with_context(|| format!("invalid --ticks value '{value}'"))?;
            }
            "--tick-ms" => {
                let value = rest.next().context("--tick-ms needs a number")?;
                tick_ms = value
                    .parse()
                    .with_context(|| format!("invalid --tick-ms value '{value}'"))?;
            }
            flag if flag.starts_with("--") => bail!("unknown option '{flag}'\n{}", usage()),
            path if script.is_none() => script = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument '{extra}'\n{}", usage()),
        }
    }
    let script = script.with_context(|| format!("missing level script\n{}", usage()))?;

    match command.as_str() {
        "validate" => Ok(Command::Validate {
            script,
            player_code,
            restart,
        }),
        "instrument" => Ok(Command::Instrument { script }),
        "run" => Ok(Command::Run {
            script,
            player_code,
            ticks,
            tick_ms,
        }),
        other => bail!("unknown command '{other}'\n{}", usage()),
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `PLAYPEN_CONFIG` environment variable
/// 2. `./playpen.toml` in the current directory
/// 3. None (defaults apply)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PLAYPEN_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("playpen.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config() -> Result<PlaypenConfig> {
    match find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            PlaypenConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(PlaypenConfig::from_toml("")?)
        }
    }
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(config: &PlaypenConfig) -> SandboxConfig {
    let overrides = &config.sandbox;
    let mut sandbox = SandboxConfig::default();
    if let Some(ms) = overrides.allowed_time_ms {
        sandbox.allowed_time = Duration::from_millis(ms);
    }
    if let Some(kb) = overrides.max_code_size_kb {
        sandbox.max_code_size = kb * 1024;
    }
    if let Some(limit) = overrides.recursion_limit {
        sandbox.recursion_limit = limit;
    }
    if let Some(limit) = overrides.stack_size_limit {
        sandbox.stack_size_limit = limit;
    }
    if let Some(debug) = overrides.debug_transformed {
        sandbox.debug_transformed = debug;
    }

    let names = &config.entry_points;
    let defaults = EntryPointNames::default();
    sandbox.entry_points = EntryPointNames {
        setup: names.setup.clone().unwrap_or(defaults.setup),
        post_check: names.post_check.clone().unwrap_or(defaults.post_check),
        exit_hook: names.exit_hook.clone().unwrap_or(defaults.exit_hook),
        objective: names.objective.clone().unwrap_or(defaults.objective),
    };
    sandbox
}

fn build_level(config: &PlaypenConfig, code: &str) -> GridLevel {
    let level = &config.level;
    let properties = LevelProperties {
        allow_auxiliary_view: level.allow_auxiliary_view.unwrap_or(false),
        reduced_integrity: level.reduced_integrity.unwrap_or(false),
    };
    GridLevel::new(
        level.width.unwrap_or(DEFAULT_WIDTH),
        level.height.unwrap_or(DEFAULT_HEIGHT),
    )
    .with_properties(properties)
    .with_source_lines(code.lines().count())
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Whole script plus the part the lexical guard screens (all of it by default).
fn read_submission(script: &Path, player_code: Option<&Path>) -> Result<(String, String)> {
    let code = read_source(script)?;
    let player = match player_code {
        Some(path) => read_source(path)?,
        None => code.clone(),
    };
    Ok((code, player))
}

fn new_session(
    config: &PlaypenConfig,
    level: GridLevel,
) -> (SandboxSession, Rc<RefCell<GridLevel>>) {
    let grid = Rc::new(RefCell::new(level));
    let session = SandboxSession::new(build_sandbox_config(config), grid.clone())
        .with_audit_logger(Arc::new(TracingAuditLogger));
    (session, grid)
}

fn validate(
    config: &PlaypenConfig,
    script: &Path,
    player_code: Option<&Path>,
    restart: bool,
) -> Result<bool> {
    let (code, player_code) = read_submission(script, player_code)?;
    let (mut session, _) = new_session(config, build_level(config, &code));

    let outcome = if restart {
        session.restart_from_script(&SavedState {
            code,
            player_code,
        })
    } else {
        session.validate(&Submission::fresh(code, player_code))
    };

    let report = match &outcome {
        Ok(entry) => json!({
            "accepted": true,
            "attempt": entry.generation(),
        }),
        Err(rejection) => json!({
            "accepted": false,
            "stage": rejection.stage.as_str(),
            "error_kind": rejection.error.kind(),
            "line": rejection.line,
            "message": rejection.message(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(outcome.is_ok())
}

fn run(
    config: &PlaypenConfig,
    script: &Path,
    player_code: Option<&Path>,
    ticks: u32,
    tick_ms: u64,
) -> Result<bool> {
    let (code, player_code) = read_submission(script, player_code)?;
    let (mut session, grid) = new_session(config, build_level(config, &code));

    let entry = match session.validate(&Submission::fresh(code, player_code)) {
        Ok(entry) => entry,
        Err(rejection) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "accepted": false,
                    "message": rejection.message(),
                }))?
            );
            return Ok(false);
        }
    };

    session.start_level(&entry)?;
    grid.borrow_mut().begin_play();

    let mut callbacks = session.dispatch_pending()?;
    for tick in 0..ticks {
        if session.has_failed_closed() {
            tracing::info!(tick, "level failed closed, stopping");
            break;
        }
        grid.borrow_mut().advance(tick_ms);
        callbacks += session.dispatch_pending()?;
    }

    let failed = session.has_failed_closed();
    let objective = if failed {
        false
    } else {
        session.objective_met()?
    };
    let level = grid.borrow();
    let report = json!({
        "accepted": true,
        "callbacks": callbacks,
        "failed_closed": failed,
        "objective_met": objective,
        "player": level.player_position().map(|(x, y)| json!({"x": x, "y": y})),
        "exit_reached": level.exit_reached(),
        "status": level.status_lines(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(!failed)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Version {
        println!("playpen {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;
    let ok = match command {
        Command::Version => true,
        Command::Validate {
            script,
            player_code,
            restart,
        } => validate(&config, &script, player_code.as_deref(), restart)?,
        Command::Instrument { script } => {
            let source = read_source(&script)?;
            let out = instrument(&source)?;
            tracing::info!(loops = out.loops, "instrumented");
            println!("{}", out.code);
            true
        }
        Command::Run {
            script,
            player_code,
            ticks,
            tick_ms,
        } => run(&config, &script, player_code.as_deref(), ticks, tick_ms)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use playpen_sandbox::LevelHost;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn script_file(code: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(code.as_bytes()).unwrap();
        file
    }

    const LEVEL: &str = "function startLevel(map) {\n    map._startOfStartLevelReached();\n    map.placePlayer(0, 0);\n    map.placeObject(3, 0, 'exit');\n    map.startTimer(function () { map.getPlayer().move('right'); }, 100);\n    map._endOfStartLevelReached();\n}\n";

    #[test]
    fn parse_version_anywhere() {
        assert_eq!(parse_args(&args(&["run", "-V"])).unwrap(), Command::Version);
    }

    #[test]
    fn parse_validate_with_options() {
        let command =
            parse_args(&args(&["validate", "a.js", "--player-code", "p.js", "--restart"])).unwrap();
        assert_eq!(
            command,
            Command::Validate {
                script: "a.js".into(),
                player_code: Some("p.js".into()),
                restart: true,
            }
        );
    }

    #[test]
    fn parse_run_defaults() {
        let command = parse_args(&args(&["run", "a.js"])).unwrap();
        assert_eq!(
            command,
            Command::Run {
                script: "a.js".into(),
                player_code: None,
                ticks: 10,
                tick_ms: 100,
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_input() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["launch", "a.js"])).is_err());
        assert!(parse_args(&args(&["run", "a.js", "--fast"])).is_err());
        assert!(parse_args(&args(&["run", "--ticks", "many", "a.js"])).is_err());
        assert!(parse_args(&args(&["validate"])).is_err());
    }

    #[test]
    fn sandbox_config_from_overrides() {
        let config = PlaypenConfig::from_toml(
            "[sandbox]\nallowed_time_ms = 500\nmax_code_size_kb = 8\n[entry_points]\nsetup = \"begin\"\n",
        )
        .unwrap();
        let sandbox = build_sandbox_config(&config);
        assert_eq!(sandbox.allowed_time, Duration::from_millis(500));
        assert_eq!(sandbox.max_code_size, 8 * 1024);
        assert_eq!(sandbox.entry_points.setup, "begin");
        assert_eq!(sandbox.entry_points.post_check, "validateLevel");
    }

    #[test]
    fn sandbox_config_defaults() {
        let config = PlaypenConfig::from_toml("").unwrap();
        let sandbox = build_sandbox_config(&config);
        let default = SandboxConfig::default();
        assert_eq!(sandbox.allowed_time, default.allowed_time);
        assert_eq!(sandbox.max_code_size, default.max_code_size);
        assert_eq!(sandbox.entry_points, default.entry_points);
    }

    #[test]
    fn level_from_config() {
        let config = PlaypenConfig::from_toml(
            "[level]\nwidth = 12\nheight = 8\nreduced_integrity = true\n",
        )
        .unwrap();
        let level = build_level(&config, "a\nb\n");
        assert!(level.properties().reduced_integrity);
        assert!(!level.properties().allow_auxiliary_view);
    }

    #[test]
    fn validate_reports_acceptance() {
        let config = PlaypenConfig::from_toml("").unwrap();
        let file = script_file(LEVEL);
        assert!(validate(&config, file.path(), None, false).unwrap());
    }

    #[test]
    fn validate_reports_rejection() {
        let config = PlaypenConfig::from_toml("").unwrap();
        let file = script_file("function startLevel(map) { debugger; }\n");
        assert!(!validate(&config, file.path(), None, false).unwrap());
    }

    #[test]
    fn run_moves_the_player_to_the_exit() {
        let config = PlaypenConfig::from_toml("").unwrap();
        let file = script_file(LEVEL);
        assert!(run(&config, file.path(), None, 3, 100).unwrap());
    }

    #[test]
    fn ver_01_cargo_pkg_version() {
        assert_eq!(env!("CARGO_PKG_VERSION"), "0.3.0");
    }
}
