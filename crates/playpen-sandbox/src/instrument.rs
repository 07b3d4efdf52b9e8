//! Loop instrumentation for cooperative timeouts.
//!
//! Parses a level script with `oxc_parser` and splices a deadline check into
//! every loop body. Each loop (or the outermost label in front of it) is
//! wrapped in a block that records the loop's start time:
//!
//! ```text
//! { let __playpenLoop0 = __playpenGuard.enter(); while (c) { __playpenGuard.check(__playpenLoop0, 3); ... } }
//! ```
//!
//! `__playpenGuard` is installed by the execution environment. The line passed
//! to `check` is the line of the loop keyword in the original source, or
//! [`HELPER_LINE`] for loops in the sandbox's own helpers.

use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_ast_visit::{walk, Visit};
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};

use crate::error::SandboxError;

/// Identifier prefix reserved for instrumentation bindings.
pub const RESERVED_PREFIX: &str = "__playpen";

/// Global binding of the loop guard object.
pub const GUARD_BINDING: &str = "__playpenGuard";

const LOOP_BINDING: &str = "__playpenLoop";

/// Line reported by loops inside built-in helpers.
pub const HELPER_LINE: usize = 0;

/// Maximum nesting depth before we reject the code.
/// Prevents parser stack overflow on deeply nested input.
const MAX_NESTING_DEPTH: usize = 256;

/// Result of instrumenting a level script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedSource {
    /// Source with deadline checks spliced in.
    pub code: String,
    /// Number of loops that received a check.
    pub loops: usize,
}

/// Check nesting depth of brackets/braces/parens BEFORE parsing.
pub fn check_nesting_depth(code: &str) -> Result<(), SandboxError> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    for ch in code.chars() {
        match ch {
            '{' | '[' | '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ']' | ')' => {
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(SandboxError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
            actual: max_depth,
        });
    }
    Ok(())
}

/// Instrument every loop in `source` with a deadline check.
///
/// Sources that already mention [`RESERVED_PREFIX`] are rejected, so a
/// script can never be instrumented twice.
pub fn instrument(source: &str) -> Result<InstrumentedSource, SandboxError> {
    if source.contains(RESERVED_PREFIX) {
        return Err(SandboxError::ReservedIdentifier {
            prefix: RESERVED_PREFIX.to_string(),
        });
    }
    check_nesting_depth(source)?;
    instrument_with(source, None)
}

/// Instrument a trusted helper script; its loops report [`HELPER_LINE`].
pub(crate) fn instrument_helper(source: &str) -> Result<InstrumentedSource, SandboxError> {
    instrument_with(source, Some(HELPER_LINE))
}

fn instrument_with(
    source: &str,
    fixed_line: Option<usize>,
) -> Result<InstrumentedSource, SandboxError> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, SourceType::cjs()).parse();
    let lines = LineIndex::new(source);

    if ret.panicked && ret.errors.is_empty() {
        return Err(SandboxError::Syntax {
            message: "parser gave up on malformed input".into(),
            line: None,
        });
    }
    if let Some(err) = ret.errors.first() {
        let offset = err
            .labels
            .as_ref()
            .and_then(|labels| labels.first())
            .map(|label| label.offset());
        return Err(SandboxError::Syntax {
            message: err.message.to_string(),
            line: offset.map(|o| lines.line_of(o)),
        });
    }

    let mut instrumenter = LoopInstrumenter {
        lines,
        fixed_line,
        edits: Vec::new(),
        loops: 0,
        label_start: None,
    };
    instrumenter.visit_program(&ret.program);

    let loops = instrumenter.loops;
    Ok(InstrumentedSource {
        code: splice(source, instrumenter.edits),
        loops,
    })
}

/// Byte offsets of line starts, for offset → 1-based line lookups.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&start| start <= offset)
    }
}

/// A pending text insertion.
struct Edit {
    offset: u32,
    closing: bool,
    seq: usize,
    text: String,
}

struct LoopInstrumenter {
    lines: LineIndex,
    fixed_line: Option<usize>,
    edits: Vec<Edit>,
    loops: usize,
    /// Start of the outermost label directly in front of the next loop.
    label_start: Option<u32>,
}

impl LoopInstrumenter {
    fn insert(&mut self, offset: u32, closing: bool, text: String) {
        let seq = self.edits.len();
        self.edits.push(Edit {
            offset,
            closing,
            seq,
            text,
        });
    }

    fn instrument_loop(&mut self, span: Span, body: &Statement<'_>) {
        let id = self.loops;
        self.loops += 1;

        let start = self.label_start.take().unwrap_or(span.start);
        let line = self
            .fixed_line
            .unwrap_or_else(|| self.lines.line_of(span.start as usize));
        self.insert(
            start,
            false,
            format!("{{ let {LOOP_BINDING}{id} = {GUARD_BINDING}.enter(); "),
        );
        self.insert(span.end, true, " }".to_string());

        let check = format!("{GUARD_BINDING}.check({LOOP_BINDING}{id}, {line});");
        match body {
            Statement::BlockStatement(block) => {
                self.insert(block.span.start + 1, false, format!(" {check}"));
            }
            other => {
                let body_span = other.span();
                self.insert(body_span.start, false, format!("{{ {check} "));
                self.insert(body_span.end, true, " }".to_string());
            }
        }
    }
}

fn is_loop(statement: &Statement<'_>) -> bool {
    matches!(
        statement,
        Statement::ForStatement(_)
            | Statement::ForInStatement(_)
            | Statement::ForOfStatement(_)
            | Statement::WhileStatement(_)
            | Statement::DoWhileStatement(_)
            | Statement::LabeledStatement(_)
    )
}

impl<'a> Visit<'a> for LoopInstrumenter {
    fn visit_labeled_statement(&mut self, it: &LabeledStatement<'a>) {
        let outermost = self.label_start.is_none();
        if outermost {
            self.label_start = Some(it.span.start);
        }
        if !is_loop(&it.body) {
            self.label_start = None;
        }
        walk::walk_labeled_statement(self, it);
        if outermost {
            self.label_start = None;
        }
    }

    fn visit_for_statement(&mut self, it: &ForStatement<'a>) {
        self.instrument_loop(it.span, &it.body);
        walk::walk_for_statement(self, it);
    }

    fn visit_for_in_statement(&mut self, it: &ForInStatement<'a>) {
        self.instrument_loop(it.span, &it.body);
        walk::walk_for_in_statement(self, it);
    }

    fn visit_for_of_statement(&mut self, it: &ForOfStatement<'a>) {
        self.instrument_loop(it.span, &it.body);
        walk::walk_for_of_statement(self, it);
    }

    fn visit_while_statement(&mut self, it: &WhileStatement<'a>) {
        self.instrument_loop(it.span, &it.body);
        walk::walk_while_statement(self, it);
    }

    fn visit_do_while_statement(&mut self, it: &DoWhileStatement<'a>) {
        self.instrument_loop(it.span, &it.body);
        walk::walk_do_while_statement(self, it);
    }
}

/// Apply insertions to `source`.
///
/// At equal offsets closing braces go first (innermost first), then opening
/// text in visit order.
fn splice(source: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|e| {
        let order = if e.closing { usize::MAX - e.seq } else { e.seq };
        (e.offset, !e.closing, order)
    });

    let extra: usize = edits.iter().map(|e| e.text.len()).sum();
    let mut out = String::with_capacity(source.len() + extra);
    let mut cursor = 0usize;
    for edit in edits {
        let at = edit.offset as usize;
        out.push_str(&source[cursor..at]);
        out.push_str(&edit.text);
        cursor = at;
    }
    out.push_str(&source[cursor..]);
    out
}
