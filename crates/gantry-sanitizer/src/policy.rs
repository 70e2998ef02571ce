use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ARGUMENT_LENGTH: usize = 1_000;
pub const DEFAULT_MAX_STRUCTURED_DEPTH: usize = 32;

pub fn default_allowed_commands() -> Vec<String> {
    vec!["docker-mcp".to_string(), "docker".to_string()]
}

pub fn default_allowed_operations() -> Vec<String> {
    [
        "install", "start", "stop", "test", "enable", "disable", "delete", "inspect", "list",
        "version",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

pub fn default_dangerous_commands() -> Vec<String> {
    [
        "rm", "sudo", "su", "curl", "wget", "kill", "killall", "pkill", "chmod", "chown", "dd",
        "mkfs", "shutdown", "reboot", "halt", "nc", "netcat", "eval", "bash", "passwd",
        "crontab",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Allowlists and limits enforced by [`crate::CommandSanitizer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizerPolicy {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_allowed_operations")]
    pub allowed_operations: Vec<String>,
    #[serde(default = "default_max_argument_length")]
    pub max_argument_length: usize,
    #[serde(default = "default_max_structured_depth")]
    pub max_structured_depth: usize,
    #[serde(default = "default_dangerous_commands")]
    pub dangerous_commands: Vec<String>,
}

fn default_max_argument_length() -> usize {
    DEFAULT_MAX_ARGUMENT_LENGTH
}

fn default_max_structured_depth() -> usize {
    DEFAULT_MAX_STRUCTURED_DEPTH
}

impl Default for SanitizerPolicy {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            allowed_operations: default_allowed_operations(),
            max_argument_length: DEFAULT_MAX_ARGUMENT_LENGTH,
            max_structured_depth: DEFAULT_MAX_STRUCTURED_DEPTH,
            dangerous_commands: default_dangerous_commands(),
        }
    }
}

impl SanitizerPolicy {
    /// Adds `command` to the base-command allowlist if it is not already present.
    pub fn allow_command(&mut self, command: impl Into<String>) {
        let command = command.into();
        if !self.allowed_commands.iter().any(|existing| *existing == command) {
            self.allowed_commands.push(command);
        }
    }

    /// Validates allowlist contents and limits.
    pub fn validate(&self) -> Result<()> {
        if self.allowed_commands.is_empty() {
            bail!("sanitizer policy allowed_commands must not be empty");
        }
        if self.allowed_operations.is_empty() {
            bail!("sanitizer policy allowed_operations must not be empty");
        }
        if self.max_argument_length == 0 {
            bail!("sanitizer policy max_argument_length must be greater than 0");
        }
        if self.max_structured_depth == 0 {
            bail!("sanitizer policy max_structured_depth must be greater than 0");
        }
        validate_entries("allowed_commands", &self.allowed_commands)?;
        validate_entries("allowed_operations", &self.allowed_operations)?;
        validate_entries("dangerous_commands", &self.dangerous_commands)?;
        Ok(())
    }
}

fn validate_entries(field: &str, entries: &[String]) -> Result<()> {
    let mut seen = HashSet::new();
    for entry in entries {
        if entry.trim().is_empty() || entry.trim() != entry {
            bail!("sanitizer policy {field} contains blank or padded entry '{entry}'");
        }
        if !seen.insert(entry.as_str()) {
            bail!("sanitizer policy {field} contains duplicate entry '{entry}'");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::SanitizerPolicy;

    #[test]
    fn default_policy_is_valid() {
        SanitizerPolicy::default()
            .validate()
            .expect("default policy should validate");
    }

    #[test]
    fn validate_rejects_duplicate_and_padded_entries() {
        let mut policy = SanitizerPolicy::default();
        policy.allowed_operations.push("enable".to_string());
        let error = policy.validate().expect_err("duplicate should fail");
        assert!(error.to_string().contains("duplicate entry 'enable'"));

        let mut policy = SanitizerPolicy::default();
        policy.allowed_commands.push(" docker-mcp".to_string());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn allow_command_does_not_duplicate_entries() {
        let mut policy = SanitizerPolicy::default();
        policy.allow_command("docker-mcp");
        policy.allow_command("/opt/tools/mcp");
        assert_eq!(
            policy
                .allowed_commands
                .iter()
                .filter(|cmd| cmd.as_str() == "docker-mcp")
                .count(),
            1
        );
        assert!(policy.allowed_commands.contains(&"/opt/tools/mcp".to_string()));
    }
}
