//! Command execution abstraction for testability.
//!
//! The packet filter is driven through the `iptables` binary. Going through
//! [`CommandExecutor`] lets the backend be exercised in unit tests with a
//! mocked executor instead of touching the host's filter table.

use anyhow::{Context, Result};
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

/// stderr fragments iptables prints when the rule (or chain) looked up by
/// `-C` / `-D` does not exist.
const RULE_MISSING_MARKERS: &[&str] = &[
    "Bad rule",
    "No chain/target/match",
    "does a matching rule exist",
];

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Whether a failed check/delete merely means "no such rule".
    pub fn rule_missing(&self) -> bool {
        !self.success && RULE_MISSING_MARKERS.iter().any(|m| self.stderr.contains(m))
    }
}

/// Trait for command execution, allowing dependency injection for testing.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute `cmd` with `args` and capture its output.
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs actual system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to execute {}", cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}
