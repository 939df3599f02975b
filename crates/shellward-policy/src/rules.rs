//! Allow and deny rules for individual commands.
//!
//! Both rule kinds accept two wire forms: a bare string naming the
//! command, or an object carrying per-rule options. A policy file can
//! mix the two freely within one list.

use serde::{Deserialize, Serialize};

/// A command the policy permits, optionally constrained to a set of
/// first arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AllowRuleRepr", rename_all = "camelCase")]
pub struct AllowRule {
    /// Command name, matched exactly against argv[0].
    pub command: String,

    /// When present, only these first arguments are permitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_commands: Option<Vec<String>>,

    /// When present (and `sub_commands` is not), these first arguments
    /// are rejected while everything else passes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_sub_commands: Option<Vec<String>>,
}

impl AllowRule {
    /// Creates a rule that permits `command` with any arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sub_commands: None,
            deny_sub_commands: None,
        }
    }

    /// Restricts the rule to the given first arguments.
    pub fn with_sub_commands(mut self, subs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.sub_commands = Some(subs.into_iter().map(Into::into).collect());
        self
    }

    /// Rejects the given first arguments while permitting the rest.
    pub fn with_deny_sub_commands(
        mut self,
        subs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.deny_sub_commands = Some(subs.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AllowRuleRepr {
    Name(String),
    Full {
        command: String,
        #[serde(default, rename = "subCommands")]
        sub_commands: Option<Vec<String>>,
        #[serde(default, rename = "denySubCommands")]
        deny_sub_commands: Option<Vec<String>>,
    },
}

impl From<AllowRuleRepr> for AllowRule {
    fn from(repr: AllowRuleRepr) -> Self {
        match repr {
            AllowRuleRepr::Name(command) => AllowRule::new(command),
            AllowRuleRepr::Full {
                command,
                sub_commands,
                deny_sub_commands,
            } => AllowRule {
                command,
                sub_commands,
                deny_sub_commands,
            },
        }
    }
}

/// A command the policy rejects unconditionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DenyRuleRepr", rename_all = "camelCase")]
pub struct DenyRule {
    /// Command name, matched exactly against argv[0].
    pub command: String,

    /// Message reported instead of the policy-wide default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DenyRule {
    /// Creates a rule that rejects `command` with the default message.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            message: None,
        }
    }

    /// Attaches a rule-specific denial message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DenyRuleRepr {
    Name(String),
    Full {
        command: String,
        #[serde(default)]
        message: Option<String>,
    },
}

impl From<DenyRuleRepr> for DenyRule {
    fn from(repr: DenyRuleRepr) -> Self {
        match repr {
            DenyRuleRepr::Name(command) => DenyRule::new(command),
            DenyRuleRepr::Full { command, message } => DenyRule { command, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_rule_from_string() {
        let rule: AllowRule = serde_json::from_str(r#""ls""#).unwrap();
        assert_eq!(rule.command, "ls");
        assert!(rule.sub_commands.is_none());
        assert!(rule.deny_sub_commands.is_none());
    }

    #[test]
    fn test_allow_rule_from_object() {
        let rule: AllowRule =
            serde_json::from_str(r#"{"command": "git", "subCommands": ["status", "log"]}"#)
                .unwrap();
        assert_eq!(rule.command, "git");
        assert_eq!(
            rule.sub_commands,
            Some(vec!["status".to_string(), "log".to_string()])
        );
    }

    #[test]
    fn test_allow_rule_deny_sub_commands() {
        let rule: AllowRule =
            serde_json::from_str(r#"{"command": "git", "denySubCommands": ["push"]}"#).unwrap();
        assert!(rule.sub_commands.is_none());
        assert_eq!(rule.deny_sub_commands, Some(vec!["push".to_string()]));
    }

    #[test]
    fn test_deny_rule_both_forms() {
        let bare: DenyRule = serde_json::from_str(r#""rm""#).unwrap();
        assert_eq!(bare.command, "rm");
        assert!(bare.message.is_none());

        let full: DenyRule =
            serde_json::from_str(r#"{"command": "rm", "message": "no deleting"}"#).unwrap();
        assert_eq!(full.command, "rm");
        assert_eq!(full.message.as_deref(), Some("no deleting"));
    }

    #[test]
    fn test_rule_object_without_command_is_an_error() {
        assert!(serde_json::from_str::<AllowRule>(r#"{"subCommands": ["x"]}"#).is_err());
        assert!(serde_json::from_str::<DenyRule>(r#"{"message": "no"}"#).is_err());
    }

    #[test]
    fn test_string_form_serializes_as_object() {
        let rule = AllowRule::new("ls");
        let json = serde_json::to_string(&rule).unwrap();
        assert_eq!(json, r#"{"command":"ls"}"#);
        let back: AllowRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
