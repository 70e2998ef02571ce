use aho_corasick::{AhoCorasick, MatchKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use gantry_core::truncate_utf8;

use crate::{DangerousInputReason, SanitizeError, SanitizerPolicy};

/// Characters that carry meaning to any shell and are never accepted in an argument.
pub const DANGEROUS_CHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '\'', '"', '\\',
];

const ERROR_VALUE_PREVIEW_BYTES: usize = 200;

/// One caller-supplied argument prior to sanitization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArg {
    /// A single argv token.
    Plain(String),
    /// A structured payload emitted as `flag` followed by its compact JSON encoding.
    Structured { flag: String, value: Value },
}

impl CommandArg {
    pub fn plain(value: impl Into<String>) -> Self {
        Self::Plain(value.into())
    }

    pub fn structured(flag: impl Into<String>, value: Value) -> Self {
        Self::Structured {
            flag: flag.into(),
            value,
        }
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        Self::Plain(value.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        Self::Plain(value)
    }
}

/// Builds argv vectors that are safe to hand to a shell-less process spawn.
#[derive(Debug, Clone)]
pub struct CommandSanitizer {
    policy: SanitizerPolicy,
    dangerous_commands: AhoCorasick,
}

impl CommandSanitizer {
    /// Creates a sanitizer after validating `policy`.
    pub fn new(policy: SanitizerPolicy) -> Result<Self> {
        policy.validate()?;
        let dangerous_commands = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::Standard)
            .build(&policy.dangerous_commands)
            .context("failed to build dangerous command matcher")?;
        Ok(Self {
            policy,
            dangerous_commands,
        })
    }

    pub fn policy(&self) -> &SanitizerPolicy {
        &self.policy
    }

    /// Validates every input and returns `[base_command, sub_command, args...]`.
    pub fn sanitize(
        &self,
        base_command: &str,
        sub_command: &str,
        args: &[CommandArg],
    ) -> Result<Vec<String>, SanitizeError> {
        if !self
            .policy
            .allowed_commands
            .iter()
            .any(|allowed| allowed == base_command)
        {
            return Err(SanitizeError::UnsupportedCommand {
                command: preview(base_command),
            });
        }
        if !self
            .policy
            .allowed_operations
            .iter()
            .any(|allowed| allowed == sub_command)
        {
            return Err(SanitizeError::InvalidOperation {
                operation: preview(sub_command),
            });
        }

        let mut argv = Vec::with_capacity(args.len() + 2);
        argv.push(base_command.to_string());
        argv.push(sub_command.to_string());
        for arg in args {
            match arg {
                CommandArg::Plain(value) => {
                    self.check_value(value)?;
                    argv.push(value.clone());
                }
                CommandArg::Structured { flag, value } => {
                    self.check_value(flag)?;
                    argv.push(flag.clone());
                    argv.push(self.sanitize_structured(value)?);
                }
            }
        }

        self.scan_dangerous_commands(&argv[1..])?;
        Ok(argv)
    }

    /// Convenience wrapper for callers holding only plain string arguments.
    pub fn sanitize_strings(
        &self,
        base_command: &str,
        sub_command: &str,
        args: &[String],
    ) -> Result<Vec<String>, SanitizeError> {
        let args = args
            .iter()
            .cloned()
            .map(CommandArg::Plain)
            .collect::<Vec<_>>();
        self.sanitize(base_command, sub_command, &args)
    }

    /// Checks a single string against the character denylist and length limit.
    pub fn check_value(&self, value: &str) -> Result<(), SanitizeError> {
        if let Some(reason) = self.first_violation(value) {
            return Err(SanitizeError::DangerousInput {
                value: preview(value),
                reason,
            });
        }
        Ok(())
    }

    /// Walks `value`, validating every object key and string leaf, then encodes it.
    pub fn sanitize_structured(&self, value: &Value) -> Result<String, SanitizeError> {
        self.walk_structured(value, 0)?;
        Ok(value.to_string())
    }

    fn walk_structured(&self, value: &Value, depth: usize) -> Result<(), SanitizeError> {
        if depth > self.policy.max_structured_depth {
            return Err(SanitizeError::DangerousInput {
                value: preview(&value.to_string()),
                reason: DangerousInputReason::NestingTooDeep {
                    max: self.policy.max_structured_depth,
                },
            });
        }
        match value {
            Value::String(text) => self.check_value(text),
            Value::Array(items) => {
                for item in items {
                    self.walk_structured(item, depth + 1)?;
                }
                Ok(())
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.check_value(key)?;
                    self.walk_structured(item, depth + 1)?;
                }
                Ok(())
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        }
    }

    fn first_violation(&self, value: &str) -> Option<DangerousInputReason> {
        if value.is_empty() {
            return Some(DangerousInputReason::Empty);
        }
        let length = value.chars().count();
        if length > self.policy.max_argument_length {
            return Some(DangerousInputReason::TooLong {
                length,
                max: self.policy.max_argument_length,
            });
        }
        if value.contains('\0') {
            return Some(DangerousInputReason::NulByte);
        }
        if value.contains('\n') || value.contains('\r') {
            return Some(DangerousInputReason::LineBreak);
        }
        if let Some(ch) = value.chars().find(|ch| DANGEROUS_CHARACTERS.contains(ch)) {
            return Some(DangerousInputReason::ShellMetacharacter(ch));
        }
        if value.contains("..") {
            return Some(DangerousInputReason::PathTraversal);
        }
        if has_excessive_whitespace(value) {
            return Some(DangerousInputReason::ExcessiveWhitespace);
        }
        None
    }

    fn scan_dangerous_commands(&self, tokens: &[String]) -> Result<(), SanitizeError> {
        for token in tokens {
            let bytes = token.as_bytes();
            for found in self.dangerous_commands.find_overlapping_iter(token.as_str()) {
                let bounded_left = found.start() == 0 || !is_word_byte(bytes[found.start() - 1]);
                let bounded_right = found.end() == bytes.len() || !is_word_byte(bytes[found.end()]);
                if bounded_left && bounded_right {
                    let command = self.policy.dangerous_commands[found.pattern().as_usize()].clone();
                    return Err(SanitizeError::DangerousCommand {
                        command,
                        value: preview(token),
                    });
                }
            }
        }
        Ok(())
    }
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

// Leading/trailing whitespace, non-space whitespace, or runs of spaces.
fn has_excessive_whitespace(value: &str) -> bool {
    let starts_or_ends_blank = value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    starts_or_ends_blank
        || value.chars().any(|ch| ch.is_whitespace() && ch != ' ')
        || value.contains("  ")
}

fn preview(value: &str) -> String {
    truncate_utf8(value, ERROR_VALUE_PREVIEW_BYTES)
}

#[cfg(test)]
mod tests {
    use super::{CommandArg, CommandSanitizer, DANGEROUS_CHARACTERS};
    use crate::{DangerousInputReason, SanitizeError, SanitizerPolicy};
    use proptest::prelude::*;
    use serde_json::json;

    fn sanitizer() -> CommandSanitizer {
        CommandSanitizer::new(SanitizerPolicy::default()).expect("sanitizer")
    }

    #[test]
    fn unit_sanitize_builds_plain_argv_for_allowed_command() {
        let argv = sanitizer()
            .sanitize(
                "docker-mcp",
                "enable",
                &[CommandArg::plain("server"), CommandArg::plain("srv-1")],
            )
            .expect("sanitize");
        assert_eq!(argv, vec!["docker-mcp", "enable", "server", "srv-1"]);
    }

    #[test]
    fn unit_sanitize_rejects_unknown_base_command_and_operation() {
        let error = sanitizer()
            .sanitize("bash", "enable", &[])
            .expect_err("bash is not allowlisted");
        assert_eq!(error.code(), "UNSUPPORTED_COMMAND");

        let error = sanitizer()
            .sanitize("docker-mcp", "exec", &[])
            .expect_err("exec is not an operation");
        assert_eq!(
            error,
            SanitizeError::InvalidOperation {
                operation: "exec".to_string()
            }
        );
    }

    #[test]
    fn regression_sanitize_rejects_injection_payload_with_value_in_error() {
        let error = sanitizer()
            .sanitize("docker-mcp", "install", &[CommandArg::plain("; rm -rf /")])
            .expect_err("injection must be rejected");
        match error {
            SanitizeError::DangerousInput { value, reason } => {
                assert_eq!(value, "; rm -rf /");
                assert_eq!(reason, DangerousInputReason::ShellMetacharacter(';'));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unit_check_value_classifies_each_violation() {
        let sanitizer = sanitizer();
        let cases = [
            ("", DangerousInputReason::Empty),
            ("a\0b", DangerousInputReason::NulByte),
            ("line\nbreak", DangerousInputReason::LineBreak),
            ("carriage\rreturn", DangerousInputReason::LineBreak),
            ("../etc/passwd", DangerousInputReason::PathTraversal),
            ("two  spaces", DangerousInputReason::ExcessiveWhitespace),
            ("tab\tseparated", DangerousInputReason::ExcessiveWhitespace),
            (" leading", DangerousInputReason::ExcessiveWhitespace),
        ];
        for (value, expected) in cases {
            match sanitizer.check_value(value) {
                Err(SanitizeError::DangerousInput { reason, .. }) => {
                    assert_eq!(reason, expected, "value {value:?}")
                }
                other => panic!("value {value:?} produced {other:?}"),
            }
        }
        sanitizer
            .check_value("My Server v1.2")
            .expect("single spaces and dots are allowed");
    }

    #[test]
    fn unit_check_value_enforces_max_length() {
        let sanitizer = sanitizer();
        sanitizer
            .check_value(&"a".repeat(1_000))
            .expect("limit is inclusive");
        let error = sanitizer
            .check_value(&"a".repeat(1_001))
            .expect_err("too long");
        assert!(matches!(
            error,
            SanitizeError::DangerousInput {
                reason: DangerousInputReason::TooLong {
                    length: 1_001,
                    max: 1_000
                },
                ..
            }
        ));
    }

    #[test]
    fn functional_structured_input_walks_keys_and_leaves() {
        let sanitizer = sanitizer();
        let encoded = sanitizer
            .sanitize_structured(&json!({ "image": "mcp/github", "ports": [8080, 9090], "debug": false }))
            .expect("clean payload");
        assert!(encoded.contains("\"image\":\"mcp/github\""));

        let error = sanitizer
            .sanitize_structured(&json!({ "env": { "TOKEN$(id)": "x" } }))
            .expect_err("dangerous key");
        assert_eq!(error.code(), "DANGEROUS_INPUT");

        let error = sanitizer
            .sanitize_structured(&json!({ "args": ["ok", "`reboot`"] }))
            .expect_err("dangerous nested leaf");
        assert_eq!(error.code(), "DANGEROUS_INPUT");
    }

    #[test]
    fn functional_structured_arg_is_emitted_as_flag_and_json_token() {
        let argv = sanitizer()
            .sanitize(
                "docker-mcp",
                "install",
                &[
                    CommandArg::plain("catalog"),
                    CommandArg::plain("github"),
                    CommandArg::structured("--input", json!({ "owner": "octo" })),
                ],
            )
            .expect("sanitize");
        assert_eq!(argv[4], "--input");
        assert_eq!(argv[5], r#"{"owner":"octo"}"#);
    }

    #[test]
    fn regression_dangerous_command_scan_matches_whole_words_only() {
        let sanitizer = sanitizer();
        let error = sanitizer
            .sanitize("docker-mcp", "test", &[CommandArg::plain("rm-rf")])
            .expect_err("rm token");
        assert_eq!(
            error,
            SanitizeError::DangerousCommand {
                command: "rm".to_string(),
                value: "rm-rf".to_string()
            }
        );

        let error = sanitizer
            .sanitize(
                "docker-mcp",
                "install",
                &[CommandArg::structured("--input", json!({ "hook": "SUDO now" }))],
            )
            .expect_err("sudo inside structured payload");
        assert_eq!(error.code(), "DANGEROUS_COMMAND");

        sanitizer
            .sanitize(
                "docker-mcp",
                "enable",
                &[CommandArg::plain("platform-firmware"), CommandArg::plain("skill")],
            )
            .expect("embedded substrings are not whole words");
    }

    proptest! {
        #[test]
        fn property_any_dangerous_character_is_rejected(
            prefix in "[a-z0-9]{0,12}",
            suffix in "[a-z0-9]{0,12}",
            index in 0usize..DANGEROUS_CHARACTERS.len(),
        ) {
            let value = format!("{prefix}{}{suffix}", DANGEROUS_CHARACTERS[index]);
            let result = sanitizer().sanitize("docker-mcp", "enable", &[CommandArg::Plain(value)]);
            prop_assert!(
                matches!(result, Err(SanitizeError::DangerousInput { .. })),
                "unexpected result: {:?}",
                result
            );
        }

        #[test]
        fn property_base_commands_outside_allowlist_are_unsupported(command in "[a-z/._-]{1,24}") {
            prop_assume!(!SanitizerPolicy::default().allowed_commands.contains(&command));
            let result = sanitizer().sanitize(&command, "enable", &[]);
            prop_assert!(
                matches!(result, Err(SanitizeError::UnsupportedCommand { .. })),
                "unexpected result: {:?}",
                result
            );
        }
    }
}
