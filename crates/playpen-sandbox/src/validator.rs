//! Lexical guard for player-editable code.
//!
//! A plain substring screen that runs before anything is parsed or executed.
//! It produces false positives and can be defeated by obfuscation; the
//! execution environment and the privileged property guard are the layers
//! behind it.

use crate::error::SandboxError;

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Substrings that may not appear anywhere in player-editable code.
///
/// Checked in order; the first match is reported.
pub const FORBIDDEN_TOKENS: &[&str] = &[
    ".call",
    "call(",
    "apply",
    "bind",        // arbitrary invocation
    "prototype",   // prototype tampering
    "debugger",    // pauses execution
    "delete",      // removes trusted members
    "constructor", // reaches Function through an instance
    "window",
    "top", // global aliasing
    "validate",
    "onExit",
    "objective", // level-author hooks
    "this[",     // this['win' + 'dow']
    "\\u",       // unicode escapes
];

/// Screens player-editable code before it is instrumented or executed.
pub fn screen_source(code: &str) -> Result<(), SandboxError> {
    for token in FORBIDDEN_TOKENS {
        if code.contains(token) {
            return Err(SandboxError::ForbiddenToken {
                token: (*token).to_string(),
            });
        }
    }
    Ok(())
}

/// Rejects level scripts larger than `max_size` bytes (default 64 KB).
pub fn check_size(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);
    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected_token(code: &str) -> String {
        match screen_source(code).unwrap_err() {
            SandboxError::ForbiddenToken { token } => token,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn accepts_ordinary_player_code() {
        let code = r#"
            for (var i = 0; i < 10; i++) {
                map.placeObject(i, 5, 'block');
            }
        "#;
        assert!(screen_source(code).is_ok());
    }

    #[test]
    fn accepts_empty_code() {
        assert!(screen_source("").is_ok());
    }

    #[test]
    fn rejects_constructor_escape() {
        assert_eq!(rejected_token("alert.constructor"), "constructor");
    }

    #[test]
    fn rejects_every_forbidden_token() {
        for token in FORBIDDEN_TOKENS {
            let code = format!("var a = 1; {token}; var b = 2;");
            let reported = rejected_token(&code);
            assert!(
                code.contains(&reported),
                "reported token {reported} must occur in the code"
            );
        }
    }

    #[test]
    fn reports_first_token_in_list_order() {
        // `call(` appears first in the code, `.call` first in the list
        assert_eq!(rejected_token("call(x); y.call"), ".call");
    }

    #[test]
    fn rejects_hook_redefinition() {
        assert_eq!(
            rejected_token("validateLevel = function () {};"),
            "validate"
        );
        assert_eq!(rejected_token("onExit = 1"), "onExit");
    }

    #[test]
    fn rejects_unicode_escape() {
        assert_eq!(rejected_token(r#"var s = "\u0077indow";"#), "\\u");
    }

    #[test]
    fn substring_match_has_false_positives() {
        // `stop` contains `top`; the guard is lexical by nature
        assert_eq!(rejected_token("var stop = true;"), "top");
    }

    #[test]
    fn size_limit() {
        let code = "x".repeat(100);
        assert!(check_size(&code, Some(50)).is_err());
        assert!(check_size(&code, Some(200)).is_ok());
        let big = "x".repeat(DEFAULT_MAX_CODE_SIZE + 1);
        let err = check_size(&big, None).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }
}
