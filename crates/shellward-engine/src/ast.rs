//! Shell script parsing and lowering.
//!
//! Scripts are parsed with tree-sitter's bash grammar and lowered into
//! a small typed AST covering the constructs the engine executes.
//! Anything outside that set, including anything the grammar itself
//! rejects, surfaces as a [`EngineError::Parse`] so callers fail closed
//! before any command runs.

use tree_sitter::Node;

use crate::error::{EngineError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// AST types
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed script: the top-level statement list.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

/// One executable statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// A simple command: optional assignment prefix plus argv words.
    Simple(SimpleCommand),
    /// `a | b | c` with at least two stages.
    Pipeline(Vec<Stmt>),
    /// `lhs && rhs` or `lhs || rhs`.
    AndOr {
        op: AndOrOp,
        lhs: Box<Stmt>,
        rhs: Box<Stmt>,
    },
    /// `! cmd`.
    Not(Box<Stmt>),
    /// `( ... )`.
    Subshell(Vec<Stmt>),
    /// `{ ...; }`.
    BraceGroup(Vec<Stmt>),
    /// `if`/`elif` arms plus an optional `else` body.
    If {
        arms: Vec<IfArm>,
        else_body: Vec<Stmt>,
    },
    /// `while` or `until` loop.
    While {
        until: bool,
        cond: Vec<Stmt>,
        body: Vec<Stmt>,
    },
    /// `for var in items; do ...; done`.
    For {
        var: String,
        items: Vec<Word>,
        body: Vec<Stmt>,
    },
    /// `name() { ... }`.
    FunctionDef { name: String, body: Box<Stmt> },
    /// Standalone variable assignments.
    Assign(Vec<Assignment>),
    /// A statement with file redirections applied.
    Redirected {
        stmt: Box<Stmt>,
        redirects: Vec<Redirect>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AndOrOp {
    And,
    Or,
}

/// One `if` or `elif` arm.
#[derive(Debug, Clone, PartialEq)]
pub struct IfArm {
    pub cond: Vec<Stmt>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleCommand {
    pub assignments: Vec<Assignment>,
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub value: Word,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    /// Source descriptor when written explicitly (`2>`).
    pub fd: Option<i32>,
    pub kind: RedirectKind,
    pub target: Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// `< file`
    In,
    /// `> file`
    Out,
    /// `>> file`
    Append,
    /// `&> file` (stdout and stderr)
    OutErr,
    /// `2>&1` style descriptor duplication.
    Dup,
}

/// A word as written, before expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub parts: Vec<WordPart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WordPart {
    Literal(String),
    /// `$name` or `${name}`. `quoted` records double-quote context,
    /// which suppresses field splitting.
    VarRef { name: String, quoted: bool },
    /// `$(...)` or backquoted substitution.
    CmdSubst { program: Program, quoted: bool },
    /// A construct the engine recognizes but does not expand. Carries
    /// the original text for diagnostics.
    Unsupported(String),
}

impl Word {
    /// Returns the word's text when every part is literal.
    pub fn as_literal(&self) -> Option<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                WordPart::Literal(text) => out.push_str(text),
                _ => return None,
            }
        }
        Some(out)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parses `source` as a shell script and lowers it to a [`Program`].
///
/// # Errors
///
/// Returns [`EngineError::Parse`] when the grammar reports a syntax
/// error or the script uses a construct the engine does not execute
/// (here-documents, `case`, background jobs, and so on).
pub fn parse_script(source: &str) -> Result<Program> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .map_err(|err| EngineError::Parse(format!("failed to load shell grammar: {err}")))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| EngineError::Parse("parser produced no syntax tree".to_string()))?;

    let root = tree.root_node();
    if root.has_error() {
        let (row, column) = first_syntax_error(root);
        return Err(EngineError::Parse(format!(
            "syntax error at line {}, column {}",
            row + 1,
            column + 1
        )));
    }

    Ok(Program {
        stmts: lower_statements(root, source)?,
    })
}

fn first_syntax_error(root: Node<'_>) -> (usize, usize) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            return (pos.row, pos.column);
        }
        let mut cursor = node.walk();
        let mut children: Vec<_> = node.children(&mut cursor).collect();
        children.reverse();
        stack.extend(children);
    }
    let pos = root.start_position();
    (pos.row, pos.column)
}

fn text<'s>(node: Node<'_>, src: &'s str) -> &'s str {
    node.utf8_text(src.as_bytes()).unwrap_or("")
}

fn unsupported(what: &str) -> EngineError {
    EngineError::Parse(format!("{what} is not supported"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Statement lowering
// ─────────────────────────────────────────────────────────────────────────────

fn lower_statements(node: Node<'_>, src: &str) -> Result<Vec<Stmt>> {
    let mut stmts = Vec::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if !child.is_named() {
            if child.kind() == "&" {
                return Err(unsupported("background execution"));
            }
            continue;
        }
        if child.kind() == "comment" {
            continue;
        }
        stmts.push(lower_stmt(child, src)?);
    }
    Ok(stmts)
}

fn lower_stmt(node: Node<'_>, src: &str) -> Result<Stmt> {
    match node.kind() {
        "command" => lower_command(node, src),
        "pipeline" => lower_pipeline(node, src),
        "list" => lower_list(node, src),
        "negated_command" => {
            let inner = node
                .named_child(0)
                .ok_or_else(|| EngineError::Parse("malformed negation".to_string()))?;
            Ok(Stmt::Not(Box::new(lower_stmt(inner, src)?)))
        }
        "subshell" => Ok(Stmt::Subshell(lower_statements(node, src)?)),
        "compound_statement" => Ok(Stmt::BraceGroup(lower_statements(node, src)?)),
        "redirected_statement" => lower_redirected(node, src),
        "if_statement" => lower_if(node, src),
        "while_statement" => lower_while(node, src),
        "for_statement" => lower_for(node, src),
        "function_definition" => lower_function(node, src),
        "variable_assignment" => Ok(Stmt::Assign(vec![lower_assignment(node, src)?])),
        "variable_assignments" => {
            let mut assignments = Vec::new();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                assignments.push(lower_assignment(child, src)?);
            }
            Ok(Stmt::Assign(assignments))
        }
        "declaration_command" => lower_declaration(node, src),
        "unset_command" => lower_unset(node, src),
        "case_statement" => Err(unsupported("case statement")),
        "c_style_for_statement" => Err(unsupported("C-style for loop")),
        "test_command" => Err(unsupported("test expression")),
        "heredoc_body" => Err(unsupported("here-document")),
        other => Err(EngineError::Parse(format!(
            "unsupported shell construct '{other}'"
        ))),
    }
}

fn lower_command(node: Node<'_>, src: &str) -> Result<Stmt> {
    let mut assignments = Vec::new();
    let mut words = Vec::new();
    let mut redirects = Vec::new();

    let mut cursor = node.walk();
    if cursor.goto_first_child() {
        loop {
            let child = cursor.node();
            match cursor.field_name() {
                Some("name") | Some("argument") => words.push(collect_word(child, src)?),
                Some("redirect") => redirects.push(lower_file_redirect(child, src)?),
                _ => match child.kind() {
                    "variable_assignment" => assignments.push(lower_assignment(child, src)?),
                    "file_redirect" => redirects.push(lower_file_redirect(child, src)?),
                    "heredoc_redirect" => return Err(unsupported("here-document")),
                    "herestring_redirect" => return Err(unsupported("here-string")),
                    other if child.is_named() => {
                        return Err(EngineError::Parse(format!(
                            "unsupported shell construct '{other}'"
                        )));
                    }
                    _ => {}
                },
            }
            if !cursor.goto_next_sibling() {
                break;
            }
        }
    }

    let simple = Stmt::Simple(SimpleCommand { assignments, words });
    if redirects.is_empty() {
        Ok(simple)
    } else {
        Ok(Stmt::Redirected {
            stmt: Box::new(simple),
            redirects,
        })
    }
}

fn lower_pipeline(node: Node<'_>, src: &str) -> Result<Stmt> {
    let mut stages = Vec::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if !child.is_named() {
            if child.kind() == "|&" {
                return Err(unsupported("'|&' pipeline"));
            }
            continue;
        }
        if child.kind() == "comment" {
            continue;
        }
        stages.push(lower_stmt(child, src)?);
    }
    Ok(Stmt::Pipeline(stages))
}

fn lower_list(node: Node<'_>, src: &str) -> Result<Stmt> {
    let mut op = None;
    let mut operands = Vec::new();
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "&&" => op = Some(AndOrOp::And),
            "||" => op = Some(AndOrOp::Or),
            "&" => return Err(unsupported("background execution")),
            "comment" => {}
            _ if child.is_named() => operands.push(lower_stmt(child, src)?),
            _ => {}
        }
    }
    let op = op.ok_or_else(|| EngineError::Parse("malformed command list".to_string()))?;
    let (Some(rhs), Some(lhs)) = (operands.pop(), operands.pop()) else {
        return Err(EngineError::Parse("malformed command list".to_string()));
    };
    if !operands.is_empty() {
        return Err(EngineError::Parse("malformed command list".to_string()));
    }
    Ok(Stmt::AndOr {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn lower_redirected(node: Node<'_>, src: &str) -> Result<Stmt> {
    let body = node
        .child_by_field_name("body")
        .ok_or_else(|| EngineError::Parse("redirect without a command".to_string()))?;
    let stmt = lower_stmt(body, src)?;

    let mut redirects = Vec::new();
    let mut cursor = node.walk();
    for redirect in node.children_by_field_name("redirect", &mut cursor) {
        redirects.push(lower_file_redirect(redirect, src)?);
    }
    Ok(Stmt::Redirected {
        stmt: Box::new(stmt),
        redirects,
    })
}

fn lower_file_redirect(node: Node<'_>, src: &str) -> Result<Redirect> {
    match node.kind() {
        "file_redirect" => {}
        "heredoc_redirect" => return Err(unsupported("here-document")),
        "herestring_redirect" => return Err(unsupported("here-string")),
        other => {
            return Err(EngineError::Parse(format!(
                "unsupported redirect '{other}'"
            )));
        }
    }

    let fd = match node.child_by_field_name("descriptor") {
        Some(descriptor) => Some(text(descriptor, src).parse::<i32>().map_err(|_| {
            EngineError::Parse("malformed redirect descriptor".to_string())
        })?),
        None => None,
    };

    let mut kind = None;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.is_named() {
            continue;
        }
        match child.kind() {
            "<" => kind = Some(RedirectKind::In),
            ">" | ">|" => kind = Some(RedirectKind::Out),
            ">>" => kind = Some(RedirectKind::Append),
            "&>" => kind = Some(RedirectKind::OutErr),
            ">&" | "<&" => kind = Some(RedirectKind::Dup),
            "&>>" => return Err(unsupported("'&>>' redirection")),
            _ => {}
        }
    }
    let kind = kind.ok_or_else(|| EngineError::Parse("malformed redirect".to_string()))?;

    let destination = node
        .child_by_field_name("destination")
        .ok_or_else(|| EngineError::Parse("redirect without a target".to_string()))?;
    let target = collect_word(destination, src)?;

    Ok(Redirect { fd, kind, target })
}

fn lower_if(node: Node<'_>, src: &str) -> Result<Stmt> {
    let mut arms = Vec::new();
    let mut else_body = Vec::new();
    let mut cond = Vec::new();
    let mut body = Vec::new();
    let mut in_body = false;
    let mut main_closed = false;

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "if" | "fi" | "comment" => {}
            "then" => in_body = true,
            "&" => return Err(unsupported("background execution")),
            "elif_clause" => {
                if !main_closed {
                    arms.push(IfArm {
                        cond: std::mem::take(&mut cond),
                        body: std::mem::take(&mut body),
                    });
                    main_closed = true;
                }
                arms.push(lower_elif(child, src)?);
            }
            "else_clause" => {
                if !main_closed {
                    arms.push(IfArm {
                        cond: std::mem::take(&mut cond),
                        body: std::mem::take(&mut body),
                    });
                    main_closed = true;
                }
                else_body = lower_statements(child, src)?;
            }
            _ if child.is_named() => {
                let stmt = lower_stmt(child, src)?;
                if in_body {
                    body.push(stmt);
                } else {
                    cond.push(stmt);
                }
            }
            _ => {}
        }
    }
    if !main_closed {
        arms.push(IfArm { cond, body });
    }
    Ok(Stmt::If { arms, else_body })
}

fn lower_elif(node: Node<'_>, src: &str) -> Result<IfArm> {
    let mut cond = Vec::new();
    let mut body = Vec::new();
    let mut in_body = false;

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "elif" | "comment" => {}
            "then" => in_body = true,
            "&" => return Err(unsupported("background execution")),
            _ if child.is_named() => {
                let stmt = lower_stmt(child, src)?;
                if in_body {
                    body.push(stmt);
                } else {
                    cond.push(stmt);
                }
            }
            _ => {}
        }
    }
    Ok(IfArm { cond, body })
}

fn lower_while(node: Node<'_>, src: &str) -> Result<Stmt> {
    let mut until = false;
    let mut cond = Vec::new();
    let mut body = Vec::new();

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "until" => until = true,
            "while" | "comment" => {}
            "&" => return Err(unsupported("background execution")),
            "do_group" => body = lower_statements(child, src)?,
            _ if child.is_named() => cond.push(lower_stmt(child, src)?),
            _ => {}
        }
    }
    Ok(Stmt::While { until, cond, body })
}

fn lower_for(node: Node<'_>, src: &str) -> Result<Stmt> {
    let mut cursor = node.walk();
    let has_in = node.children(&mut cursor).any(|c| c.kind() == "in");
    if !has_in {
        return Err(unsupported("for loop without an explicit item list"));
    }

    let var = node
        .child_by_field_name("variable")
        .map(|v| text(v, src).to_string())
        .ok_or_else(|| EngineError::Parse("malformed for loop".to_string()))?;

    let mut items = Vec::new();
    let mut cursor = node.walk();
    for value in node.children_by_field_name("value", &mut cursor) {
        items.push(collect_word(value, src)?);
    }

    let body_node = node
        .child_by_field_name("body")
        .ok_or_else(|| EngineError::Parse("malformed for loop".to_string()))?;
    let body = lower_statements(body_node, src)?;

    Ok(Stmt::For { var, items, body })
}

fn lower_function(node: Node<'_>, src: &str) -> Result<Stmt> {
    let name = node
        .child_by_field_name("name")
        .map(|n| text(n, src).to_string())
        .ok_or_else(|| EngineError::Parse("malformed function definition".to_string()))?;
    let body_node = node
        .child_by_field_name("body")
        .ok_or_else(|| EngineError::Parse("malformed function definition".to_string()))?;
    Ok(Stmt::FunctionDef {
        name,
        body: Box::new(lower_stmt(body_node, src)?),
    })
}

fn lower_assignment(node: Node<'_>, src: &str) -> Result<Assignment> {
    let mut cursor = node.walk();
    if node.children(&mut cursor).any(|c| c.kind() == "+=") {
        return Err(unsupported("append assignment"));
    }

    let name_node = node
        .child_by_field_name("name")
        .ok_or_else(|| EngineError::Parse("malformed assignment".to_string()))?;
    if name_node.kind() != "variable_name" {
        return Err(unsupported("array assignment"));
    }
    let name = text(name_node, src).to_string();

    let value = match node.child_by_field_name("value") {
        Some(value) => collect_word(value, src)?,
        None => Word { parts: Vec::new() },
    };

    Ok(Assignment { name, value })
}

// `export` and `unset` lower to simple commands so the interpreter can
// dispatch them as builtins alongside the `export FOO` spelling.
fn lower_declaration(node: Node<'_>, src: &str) -> Result<Stmt> {
    let keyword = node.child(0).map(|c| text(c, src)).unwrap_or("");
    if keyword != "export" {
        return Err(unsupported(&format!("'{keyword}' declaration")));
    }

    let mut words = vec![Word {
        parts: vec![WordPart::Literal("export".to_string())],
    }];
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        match child.kind() {
            "variable_assignment" => {
                let assignment = lower_assignment(child, src)?;
                let mut parts = vec![WordPart::Literal(format!("{}=", assignment.name))];
                parts.extend(assignment.value.parts);
                words.push(Word { parts });
            }
            "variable_name" | "word" => words.push(Word {
                parts: vec![WordPart::Literal(text(child, src).to_string())],
            }),
            _ => return Err(unsupported("export operand")),
        }
    }

    Ok(Stmt::Simple(SimpleCommand {
        assignments: Vec::new(),
        words,
    }))
}

fn lower_unset(node: Node<'_>, src: &str) -> Result<Stmt> {
    let mut words = vec![Word {
        parts: vec![WordPart::Literal("unset".to_string())],
    }];
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        words.push(Word {
            parts: vec![WordPart::Literal(text(child, src).to_string())],
        });
    }
    Ok(Stmt::Simple(SimpleCommand {
        assignments: Vec::new(),
        words,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Word lowering
// ─────────────────────────────────────────────────────────────────────────────

fn collect_word(node: Node<'_>, src: &str) -> Result<Word> {
    let mut parts = Vec::new();
    collect_parts(node, src, false, &mut parts)?;
    Ok(Word { parts })
}

fn collect_parts(node: Node<'_>, src: &str, quoted: bool, parts: &mut Vec<WordPart>) -> Result<()> {
    match node.kind() {
        "word" | "number" | "file_descriptor" => {
            parts.push(WordPart::Literal(unescape_word(text(node, src))));
        }
        "raw_string" => {
            let raw = text(node, src);
            let inner = if raw.len() >= 2 {
                &raw[1..raw.len() - 1]
            } else {
                raw
            };
            parts.push(WordPart::Literal(inner.to_string()));
        }
        "string" => {
            let before = parts.len();
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if !child.is_named() {
                    // A bare `$` before the closing quote is literal.
                    if child.kind() == "$" {
                        parts.push(WordPart::Literal("$".to_string()));
                    }
                    continue;
                }
                match child.kind() {
                    "string_content" => parts.push(WordPart::Literal(unescape_double_quoted(
                        text(child, src),
                    ))),
                    _ => collect_parts(child, src, true, parts)?,
                }
            }
            // `""` must still produce an (empty) argument.
            if parts.len() == before {
                parts.push(WordPart::Literal(String::new()));
            }
        }
        "simple_expansion" => match node.named_child(0) {
            Some(inner) if inner.kind() == "variable_name" => {
                let name = text(inner, src);
                if name.starts_with(|c: char| c.is_ascii_digit()) {
                    parts.push(WordPart::Unsupported(text(node, src).to_string()));
                } else {
                    parts.push(WordPart::VarRef {
                        name: name.to_string(),
                        quoted,
                    });
                }
            }
            _ => parts.push(WordPart::Unsupported(text(node, src).to_string())),
        },
        "expansion" => {
            let named: Vec<_> = {
                let mut cursor = node.walk();
                node.named_children(&mut cursor).collect()
            };
            let full = text(node, src);
            // Only the plain `${name}` form expands; operators like
            // `${name:-x}` stay opaque.
            if named.len() == 1
                && named[0].kind() == "variable_name"
                && full == format!("${{{}}}", text(named[0], src))
            {
                parts.push(WordPart::VarRef {
                    name: text(named[0], src).to_string(),
                    quoted,
                });
            } else {
                parts.push(WordPart::Unsupported(full.to_string()));
            }
        }
        "command_substitution" => {
            let program = Program {
                stmts: lower_statements(node, src)?,
            };
            parts.push(WordPart::CmdSubst { program, quoted });
        }
        "concatenation" | "command_name" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_parts(child, src, quoted, parts)?;
            }
        }
        _ => parts.push(WordPart::Unsupported(text(node, src).to_string())),
    }
    Ok(())
}

fn unescape_word(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('\n') => {}
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

// Inside double quotes, backslash only escapes `$`, backquote, `"`,
// `\` and newline.
fn unescape_double_quoted(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.peek() {
                Some('$' | '`' | '"' | '\\') => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                Some('\n') => {
                    chars.next();
                }
                _ => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}
