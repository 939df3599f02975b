//! The security policy: which commands may run, where, and under what
//! resource bounds.
//!
//! A [`Policy`] is decoded from a JSON file. Deny rules always win over
//! allow rules, and any command with no matching allow rule is denied.
//! [`Policy::decide`] is the single evaluation point used for both
//! static script validation and runtime execution checks.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::rules::{AllowRule, DenyRule};

/// Default execution timeout in seconds.
pub const DEFAULT_EXECUTION_TIMEOUT: u64 = 30;

/// Default cap on captured output in bytes (50 KiB).
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 50 * 1024;

/// Denial message used when no rule supplies its own.
pub const DEFAULT_ERROR_MESSAGE: &str = "Command not allowed by security policy";

/// Outcome of evaluating one command invocation against a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The invocation may proceed.
    Allow,
    /// The invocation is rejected, with the reason to report.
    Deny(String),
}

impl Verdict {
    /// Returns `true` when the invocation may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    /// Returns the denial reason, if any.
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            Verdict::Allow => None,
            Verdict::Deny(reason) => Some(reason),
        }
    }
}

/// Declarative security policy for command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawPolicy", rename_all = "camelCase")]
pub struct Policy {
    /// Absolute path prefixes the working directory must fall under.
    /// An empty list leaves the working directory unrestricted.
    pub allowed_directories: Vec<String>,

    /// Commands that may run, evaluated after `deny_commands`.
    pub allow_commands: Vec<AllowRule>,

    /// Commands that never run, regardless of allow rules.
    pub deny_commands: Vec<DenyRule>,

    /// Denial message for rules that do not carry their own.
    pub default_error_message: String,

    /// File that receives an audit line for every blocked invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_log_path: Option<PathBuf>,

    /// Wall-clock budget in seconds for one `run`/`run_script` call.
    pub max_execution_time: u64,

    /// Cap in bytes applied to each captured output stream.
    pub max_output_size: usize,

    /// Exact environment handed to child processes. The parent
    /// environment is never inherited.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub restricted_env: BTreeMap<String, String>,

    /// Working directory for child processes, validated against
    /// `allowed_directories` before use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_directories: vec!["/home".to_string(), "/tmp".to_string()],
            allow_commands: vec![
                AllowRule::new("ls"),
                AllowRule::new("cat"),
                AllowRule::new("echo"),
            ],
            deny_commands: vec![DenyRule::new("rm").with_message("Remove command is not allowed")],
            default_error_message: DEFAULT_ERROR_MESSAGE.to_string(),
            block_log_path: None,
            max_execution_time: DEFAULT_EXECUTION_TIMEOUT,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            restricted_env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

/// Wire form of [`Policy`]. Numeric fields are decoded as signed so
/// that zero and negative values fall back to defaults instead of
/// failing to parse.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawPolicy {
    allowed_directories: Vec<String>,
    allow_commands: Vec<AllowRule>,
    deny_commands: Vec<DenyRule>,
    default_error_message: String,
    block_log_path: Option<PathBuf>,
    max_execution_time: i64,
    max_output_size: i64,
    restricted_env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl Default for RawPolicy {
    fn default() -> Self {
        Self {
            allowed_directories: Vec::new(),
            allow_commands: Vec::new(),
            deny_commands: Vec::new(),
            default_error_message: String::new(),
            block_log_path: None,
            max_execution_time: 0,
            max_output_size: 0,
            restricted_env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

impl From<RawPolicy> for Policy {
    fn from(raw: RawPolicy) -> Self {
        let default_error_message = if raw.default_error_message.is_empty() {
            DEFAULT_ERROR_MESSAGE.to_string()
        } else {
            raw.default_error_message
        };
        let max_execution_time = if raw.max_execution_time > 0 {
            raw.max_execution_time as u64
        } else {
            DEFAULT_EXECUTION_TIMEOUT
        };
        let max_output_size = if raw.max_output_size > 0 {
            raw.max_output_size as usize
        } else {
            DEFAULT_MAX_OUTPUT_SIZE
        };

        Self {
            allowed_directories: raw.allowed_directories,
            allow_commands: raw.allow_commands,
            deny_commands: raw.deny_commands,
            default_error_message,
            block_log_path: raw.block_log_path,
            max_execution_time,
            max_output_size,
            restricted_env: raw.restricted_env,
            working_dir: raw.working_dir,
        }
    }
}

impl Policy {
    /// Loads a policy from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReadFile`] when the file cannot be read
    /// and [`ConfigError::Decode`] when it is not a valid policy.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let policy: Policy = serde_json::from_str(&contents)?;
        Ok(policy)
    }

    /// Evaluates one invocation against the policy.
    ///
    /// `command` is the program name as invoked and `args` its
    /// arguments. Deny rules are consulted first, then allow rules
    /// with their subcommand constraints, and anything unmatched is
    /// denied.
    pub fn decide(&self, command: &str, args: &[String]) -> Verdict {
        if let Some(rule) = self.deny_commands.iter().find(|r| r.command == command) {
            let reason = rule
                .message
                .clone()
                .unwrap_or_else(|| self.default_error_message.clone());
            return Verdict::Deny(reason);
        }

        let Some(rule) = self.allow_commands.iter().find(|r| r.command == command) else {
            return Verdict::Deny(self.default_error_message.clone());
        };

        if let Some(subs) = &rule.sub_commands {
            return match args.first() {
                Some(first) if subs.iter().any(|s| s == first) => Verdict::Allow,
                Some(first) => Verdict::Deny(format!(
                    "subcommand '{first}' is not permitted for command '{command}'"
                )),
                None => Verdict::Deny(format!(
                    "command '{command}' requires one of its permitted subcommands"
                )),
            };
        }

        if let Some(denied) = &rule.deny_sub_commands {
            if let Some(first) = args.first() {
                if denied.iter().any(|s| s == first) {
                    return Verdict::Deny(format!(
                        "subcommand '{first}' is not permitted for command '{command}'"
                    ));
                }
            }
        }

        Verdict::Allow
    }

    /// Returns `true` when some allow rule names `command`, without
    /// consulting deny rules or subcommand constraints.
    pub fn is_allowed(&self, command: &str) -> bool {
        self.allow_commands.iter().any(|r| r.command == command)
    }

    /// Returns `true` when `dir` falls under one of the allowed
    /// directory prefixes. Matching is per path component, so
    /// `/tmpfoo` does not match the prefix `/tmp`. An empty prefix
    /// list admits every directory.
    pub fn is_dir_allowed(&self, dir: &Path) -> bool {
        if self.allowed_directories.is_empty() {
            return true;
        }
        self.allowed_directories
            .iter()
            .any(|prefix| dir.starts_with(prefix))
    }

    /// Adds an allow rule for `command` unless one already exists.
    pub fn add_allowed_command(&mut self, command: &str) {
        if !self.is_allowed(command) {
            self.allow_commands.push(AllowRule::new(command));
        }
    }

    /// Wall-clock budget for one top-level execution call.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.max_execution_time)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn test_default_policy_contents() {
        let policy = Policy::default();
        assert_eq!(policy.allowed_directories, vec!["/home", "/tmp"]);
        assert!(policy.is_allowed("ls"));
        assert!(policy.is_allowed("cat"));
        assert!(policy.is_allowed("echo"));
        assert!(!policy.is_allowed("rm"));
        assert_eq!(policy.max_execution_time, 30);
        assert_eq!(policy.max_output_size, 50 * 1024);
        assert_eq!(policy.default_error_message, DEFAULT_ERROR_MESSAGE);
    }

    #[test]
    fn test_deny_takes_precedence_over_allow() {
        let mut policy = Policy::default();
        policy.allow_commands.push(AllowRule::new("rm"));

        let verdict = policy.decide("rm", &["-rf".to_string()]);
        assert_eq!(
            verdict.denial_reason(),
            Some("Remove command is not allowed")
        );
    }

    #[test]
    fn test_unknown_command_denied_with_default_message() {
        let policy = Policy::default();
        let verdict = policy.decide("curl", &[]);
        assert_eq!(verdict.denial_reason(), Some(DEFAULT_ERROR_MESSAGE));
    }

    #[test]
    fn test_deny_rule_without_message_uses_default() {
        let mut policy = Policy::default();
        policy.deny_commands.push(DenyRule::new("ls"));

        let verdict = policy.decide("ls", &[]);
        assert_eq!(verdict.denial_reason(), Some(DEFAULT_ERROR_MESSAGE));
    }

    #[test]
    fn test_sub_commands_restrict_first_argument() {
        let mut policy = Policy::default();
        policy
            .allow_commands
            .push(AllowRule::new("git").with_sub_commands(["status", "log"]));

        assert!(policy.decide("git", &["status".to_string()]).is_allowed());
        assert!(
            policy
                .decide("git", &["log".to_string(), "--oneline".to_string()])
                .is_allowed()
        );
        assert!(!policy.decide("git", &["push".to_string()]).is_allowed());
        assert!(!policy.decide("git", &[]).is_allowed());
    }

    #[test]
    fn test_deny_sub_commands_reject_listed_first_argument() {
        let mut policy = Policy::default();
        policy
            .allow_commands
            .push(AllowRule::new("git").with_deny_sub_commands(["push"]));

        assert!(policy.decide("git", &["status".to_string()]).is_allowed());
        assert!(policy.decide("git", &[]).is_allowed());

        let verdict = policy.decide("git", &["push".to_string()]);
        assert_eq!(
            verdict.denial_reason(),
            Some("subcommand 'push' is not permitted for command 'git'")
        );
    }

    #[test]
    fn test_allowed_command_accepts_any_arguments() {
        let policy = Policy::default();
        assert!(
            policy
                .decide("ls", &["-la".to_string(), "/tmp".to_string()])
                .is_allowed()
        );
        assert!(policy.decide("echo", &[]).is_allowed());
    }

    #[test]
    fn test_is_dir_allowed_matches_path_components() {
        let policy = Policy::default();
        assert!(policy.is_dir_allowed(Path::new("/tmp")));
        assert!(policy.is_dir_allowed(Path::new("/tmp/work/sub")));
        assert!(policy.is_dir_allowed(Path::new("/home/user")));
        assert!(!policy.is_dir_allowed(Path::new("/tmpfoo")));
        assert!(!policy.is_dir_allowed(Path::new("/etc")));
        assert!(!policy.is_dir_allowed(Path::new("/")));
    }

    #[test]
    fn test_empty_allowed_directories_is_unrestricted() {
        let policy = Policy {
            allowed_directories: Vec::new(),
            ..Policy::default()
        };
        assert!(policy.is_dir_allowed(Path::new("/anywhere/at/all")));
    }

    #[test]
    fn test_add_allowed_command_is_idempotent() {
        let mut policy = Policy::default();
        let before = policy.allow_commands.len();

        policy.add_allowed_command("grep");
        policy.add_allowed_command("grep");

        assert_eq!(policy.allow_commands.len(), before + 1);
        assert!(policy.is_allowed("grep"));
    }

    #[test]
    fn test_decode_mixed_rule_forms() {
        let json = r#"{
            "allowedDirectories": ["/srv"],
            "allowCommands": [
                "ls",
                {"command": "git", "subCommands": ["status"]},
                {"command": "npm", "denySubCommands": ["publish"]}
            ],
            "denyCommands": [
                "sudo",
                {"command": "rm", "message": "no deleting"}
            ]
        }"#;

        let policy: Policy = serde_json::from_str(json).unwrap();
        assert!(policy.decide("ls", &[]).is_allowed());
        assert!(policy.decide("git", &["status".to_string()]).is_allowed());
        assert!(!policy.decide("git", &["push".to_string()]).is_allowed());
        assert!(!policy.decide("npm", &["publish".to_string()]).is_allowed());
        assert!(policy.decide("npm", &["install".to_string()]).is_allowed());
        assert_eq!(policy.decide("sudo", &[]).denial_reason(), Some(DEFAULT_ERROR_MESSAGE));
        assert_eq!(policy.decide("rm", &[]).denial_reason(), Some("no deleting"));
    }

    #[test]
    fn test_absent_numeric_fields_fall_back_to_defaults() {
        let policy: Policy = serde_json::from_str(r#"{"allowCommands": ["ls"]}"#).unwrap();
        assert_eq!(policy.max_execution_time, DEFAULT_EXECUTION_TIMEOUT);
        assert_eq!(policy.max_output_size, DEFAULT_MAX_OUTPUT_SIZE);
        assert_eq!(policy.default_error_message, DEFAULT_ERROR_MESSAGE);
        assert!(policy.allowed_directories.is_empty());
    }

    #[test]
    fn test_non_positive_numeric_fields_fall_back_to_defaults() {
        let policy: Policy =
            serde_json::from_str(r#"{"maxExecutionTime": 0, "maxOutputSize": -5}"#).unwrap();
        assert_eq!(policy.max_execution_time, DEFAULT_EXECUTION_TIMEOUT);
        assert_eq!(policy.max_output_size, DEFAULT_MAX_OUTPUT_SIZE);
    }

    #[test]
    fn test_explicit_fields_survive_round_trip() {
        let json = r#"{
            "allowedDirectories": ["/srv/data"],
            "allowCommands": [{"command": "git", "subCommands": ["status", "diff"]}],
            "denyCommands": [{"command": "rm", "message": "no"}],
            "defaultErrorMessage": "blocked",
            "blockLogPath": "/var/log/blocked.log",
            "maxExecutionTime": 5,
            "maxOutputSize": 1024,
            "restrictedEnv": {"PATH": "/usr/bin"},
            "workingDir": "/srv/data"
        }"#;

        let policy: Policy = serde_json::from_str(json).unwrap();
        let reencoded = serde_json::to_string(&policy).unwrap();
        let back: Policy = serde_json::from_str(&reencoded).unwrap();

        assert_eq!(back.allowed_directories, policy.allowed_directories);
        assert_eq!(back.allow_commands, policy.allow_commands);
        assert_eq!(back.deny_commands, policy.deny_commands);
        assert_eq!(back.default_error_message, "blocked");
        assert_eq!(back.block_log_path, policy.block_log_path);
        assert_eq!(back.max_execution_time, 5);
        assert_eq!(back.max_output_size, 1024);
        assert_eq!(back.restricted_env, policy.restricted_env);
        assert_eq!(back.working_dir, Some(PathBuf::from("/srv/data")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"allowCommands": ["ls"], "maxExecutionTime": 7}}"#
        )
        .unwrap();

        let policy = Policy::load(file.path()).unwrap();
        assert!(policy.is_allowed("ls"));
        assert_eq!(policy.max_execution_time, 7);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = Policy::load("/nonexistent/policy.json").unwrap_err();
        match err {
            ConfigError::ReadFile { path, .. } => {
                assert_eq!(path, "/nonexistent/policy.json");
            }
            other => panic!("expected ReadFile error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_malformed_file_is_decode_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = Policy::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Decode(_)));
    }
}
