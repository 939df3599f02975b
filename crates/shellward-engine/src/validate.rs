//! Static script validation.
//!
//! [`CommandValidator`] walks every simple command a script can reach,
//! including pipeline stages, list operands, loop and conditional
//! bodies, function bodies, and command substitutions, and evaluates
//! each against the policy before anything runs. Redirect targets are
//! resolved and confined to the allowed directories. Validation is the
//! first line of defense; the interpreter re-checks every launch at
//! runtime.

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use shellward_policy::{Policy, Verdict};

use crate::ast::{
    parse_script, Program, Redirect, RedirectKind, SimpleCommand, Stmt, Word, WordPart,
};
use crate::error::{EngineError, Result};

/// Validates whole scripts against a [`Policy`] without executing them.
pub struct CommandValidator {
    policy: Arc<Policy>,
}

struct WalkContext {
    functions: HashSet<String>,
    redirect_base: PathBuf,
}

impl CommandValidator {
    pub fn new(policy: Arc<Policy>) -> Self {
        Self { policy }
    }

    /// Parses and validates `source`, returning the lowered program so
    /// callers can execute it without re-parsing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Parse`] when the script does not parse
    /// and [`EngineError::Denied`] when any reachable command or
    /// redirect violates the policy.
    pub fn validate_script(&self, source: &str) -> Result<Program> {
        let program = parse_script(source)?;
        self.validate_program(&program)?;
        Ok(program)
    }

    /// Validates an already-parsed program.
    pub fn validate_program(&self, program: &Program) -> Result<()> {
        let mut functions = HashSet::new();
        collect_functions(&program.stmts, &mut functions);
        let cx = WalkContext {
            functions,
            redirect_base: self.redirect_base(),
        };
        self.check_stmts(&program.stmts, &cx)
    }

    // Redirect paths are resolved against the policy working directory
    // when one is set, otherwise against the process working directory.
    fn redirect_base(&self) -> PathBuf {
        self.policy
            .working_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    fn check_stmts(&self, stmts: &[Stmt], cx: &WalkContext) -> Result<()> {
        for stmt in stmts {
            self.check_stmt(stmt, cx)?;
        }
        Ok(())
    }

    fn check_stmt(&self, stmt: &Stmt, cx: &WalkContext) -> Result<()> {
        match stmt {
            Stmt::Simple(cmd) => self.check_simple(cmd, cx),
            Stmt::Pipeline(stages) => self.check_stmts(stages, cx),
            Stmt::AndOr { lhs, rhs, .. } => {
                self.check_stmt(lhs, cx)?;
                self.check_stmt(rhs, cx)
            }
            Stmt::Not(inner) => self.check_stmt(inner, cx),
            Stmt::Subshell(stmts) | Stmt::BraceGroup(stmts) => self.check_stmts(stmts, cx),
            Stmt::If { arms, else_body } => {
                for arm in arms {
                    self.check_stmts(&arm.cond, cx)?;
                    self.check_stmts(&arm.body, cx)?;
                }
                self.check_stmts(else_body, cx)
            }
            Stmt::While { cond, body, .. } => {
                self.check_stmts(cond, cx)?;
                self.check_stmts(body, cx)
            }
            Stmt::For { items, body, .. } => {
                for item in items {
                    self.check_word_substs(item, cx)?;
                }
                self.check_stmts(body, cx)
            }
            Stmt::FunctionDef { body, .. } => self.check_stmt(body, cx),
            Stmt::Assign(assignments) => {
                for assignment in assignments {
                    self.check_word_substs(&assignment.value, cx)?;
                }
                Ok(())
            }
            Stmt::Redirected { stmt, redirects } => {
                self.check_stmt(stmt, cx)?;
                for redirect in redirects {
                    self.check_redirect(redirect, cx)?;
                }
                Ok(())
            }
        }
    }

    fn check_simple(&self, cmd: &SimpleCommand, cx: &WalkContext) -> Result<()> {
        // Substituted programs run no matter where the word appears.
        for assignment in &cmd.assignments {
            self.check_word_substs(&assignment.value, cx)?;
        }
        for word in &cmd.words {
            self.check_word_substs(word, cx)?;
        }

        let Some(name_word) = cmd.words.first() else {
            // Pure assignment prefix, nothing launches.
            return Ok(());
        };
        let Some(name) = name_word.as_literal() else {
            return Err(EngineError::Denied {
                command: "<dynamic>".to_string(),
                reason: "command name is not statically resolvable".to_string(),
            });
        };

        // Function calls dispatch to bodies that were validated at
        // their definition site.
        if cx.functions.contains(&name) {
            return Ok(());
        }

        if let Verdict::Deny(reason) = self.static_verdict(&name, cmd) {
            return Err(EngineError::Denied {
                command: name,
                reason,
            });
        }
        Ok(())
    }

    fn static_verdict(&self, name: &str, cmd: &SimpleCommand) -> Verdict {
        match cmd.words.get(1) {
            None => self.policy.decide(name, &[]),
            Some(first) => match first.as_literal() {
                Some(literal) => self.policy.decide(name, &[literal]),
                // A dynamic first argument defeats subcommand rules, so
                // it only passes when the command is unconstrained.
                None if self.subcommand_constrained(name) => Verdict::Deny(format!(
                    "first argument of '{name}' is not statically resolvable"
                )),
                None => self.policy.decide(name, &[]),
            },
        }
    }

    fn subcommand_constrained(&self, name: &str) -> bool {
        self.policy.allow_commands.iter().any(|rule| {
            rule.command == name
                && (rule.sub_commands.is_some() || rule.deny_sub_commands.is_some())
        })
    }

    fn check_word_substs(&self, word: &Word, cx: &WalkContext) -> Result<()> {
        for part in &word.parts {
            if let WordPart::CmdSubst { program, .. } = part {
                self.check_stmts(&program.stmts, cx)?;
            }
        }
        Ok(())
    }

    fn check_redirect(&self, redirect: &Redirect, cx: &WalkContext) -> Result<()> {
        self.check_word_substs(&redirect.target, cx)?;
        if self.policy.allowed_directories.is_empty() {
            return Ok(());
        }

        if redirect.kind == RedirectKind::Dup {
            return match redirect.target.as_literal().as_deref() {
                Some("0" | "1" | "2") => Ok(()),
                _ => Err(EngineError::Denied {
                    command: "<redirect>".to_string(),
                    reason: "unsupported descriptor duplication target".to_string(),
                }),
            };
        }

        let Some(target) = redirect.target.as_literal() else {
            return Err(EngineError::Denied {
                command: "<redirect>".to_string(),
                reason: "redirect target is not statically resolvable".to_string(),
            });
        };

        let joined = cx.redirect_base.join(&target);
        let resolved = resolve_creatable(&joined).map_err(|err| EngineError::Denied {
            command: "<redirect>".to_string(),
            reason: format!("redirect target '{target}' cannot be resolved: {err}"),
        })?;
        if !self.policy.is_dir_allowed(&resolved) {
            return Err(EngineError::Denied {
                command: "<redirect>".to_string(),
                reason: format!("redirect target '{target}' is outside the allowed directories"),
            });
        }
        Ok(())
    }
}

fn collect_functions(stmts: &[Stmt], names: &mut HashSet<String>) {
    for stmt in stmts {
        collect_functions_in(stmt, names);
    }
}

fn collect_functions_in(stmt: &Stmt, names: &mut HashSet<String>) {
    match stmt {
        Stmt::FunctionDef { name, body } => {
            names.insert(name.clone());
            collect_functions_in(body, names);
        }
        Stmt::Pipeline(stages) => collect_functions(stages, names),
        Stmt::AndOr { lhs, rhs, .. } => {
            collect_functions_in(lhs, names);
            collect_functions_in(rhs, names);
        }
        Stmt::Not(inner) => collect_functions_in(inner, names),
        Stmt::Subshell(stmts) | Stmt::BraceGroup(stmts) => collect_functions(stmts, names),
        Stmt::If { arms, else_body } => {
            for arm in arms {
                collect_functions(&arm.cond, names);
                collect_functions(&arm.body, names);
            }
            collect_functions(else_body, names);
        }
        Stmt::While { cond, body, .. } => {
            collect_functions(cond, names);
            collect_functions(body, names);
        }
        Stmt::For { body, .. } => collect_functions(body, names),
        Stmt::Redirected { stmt, .. } => collect_functions_in(stmt, names),
        Stmt::Simple(_) | Stmt::Assign(_) => {}
    }
}

/// Resolves a path that may not exist yet: symlinks in the deepest
/// existing ancestor are followed, then the missing tail is appended
/// and `.`/`..` segments are folded lexically. The result is what the
/// path would name if its missing directories were created, which is
/// what directory confinement has to judge.
pub(crate) fn resolve_creatable(path: &Path) -> io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(resolved) => return Ok(resolved),
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
        _ => {}
    }

    let mut ancestors = path.ancestors();
    ancestors.next();
    for ancestor in ancestors {
        if let Ok(base) = ancestor.canonicalize() {
            let tail = path.strip_prefix(ancestor).unwrap_or(path);
            return Ok(normalize_lexical(&base.join(tail)));
        }
    }
    Ok(normalize_lexical(path))
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
