//! External command runner
//!
//! All package-manager, service-manager, and agent-tool invocations go
//! through here so every call carries a bounded timeout and secret-bearing
//! arguments are masked in errors and logs.

use anyhow::{Context, Result};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Default bound on any single external call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// A command plus a display form safe for logs
#[derive(Debug, Clone)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    display: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            display: vec![program.clone()],
            program,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        self.display.push(arg.clone());
        self.args.push(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Add an argument that is masked in the display form
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self.display.push("***".to_string());
        self
    }

    /// Log-safe rendering of the full command line
    pub fn display(&self) -> String {
        self.display.join(" ")
    }
}

/// Run a command under a timeout, returning its captured output
pub async fn run(cmd: &CommandLine, timeout: Duration) -> Result<Output> {
    let display = cmd.display();
    let future = Command::new(&cmd.program)
        .args(&cmd.args)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| anyhow::anyhow!("Command timed out after {:?}: {}", timeout, display))?
        .with_context(|| format!("Failed to run command: {}", display))?;

    Ok(output)
}

/// Run a command and treat any non-zero exit status as an error
pub async fn run_checked(cmd: &CommandLine, timeout: Duration) -> Result<Output> {
    let output = run(cmd, timeout).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(anyhow::anyhow!(
            "Command failed: {}\nexit: {}\nstdout: {}\nstderr: {}",
            cmd.display(),
            output.status.code().unwrap_or(-1),
            stdout.trim(),
            stderr.trim()
        ));
    }

    Ok(output)
}

/// Run a query command, reporting whether it exited successfully
pub async fn status_ok(cmd: &CommandLine, timeout: Duration) -> Result<bool> {
    let output = run(cmd, timeout).await?;
    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_checked_success() {
        let cmd = CommandLine::new("true");
        let result = run_checked(&cmd, DEFAULT_TIMEOUT).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_checked_nonzero_exit() {
        let cmd = CommandLine::new("sh").arg("-c").arg("exit 3");
        let err = run_checked(&cmd, DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("exit: 3"));
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let cmd = CommandLine::new("sleep").arg("5");
        let err = run(&cmd, Duration::from_millis(100)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_status_ok_query() {
        let cmd = CommandLine::new("sh").arg("-c").arg("exit 1");
        let ok = status_ok(&cmd, DEFAULT_TIMEOUT).await.unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_secret_arg_masked_in_display() {
        let cmd = CommandLine::new("observe-agent")
            .arg("init-config")
            .arg("--token")
            .secret_arg("very-secret-token")
            .arg("--observe_url")
            .arg("https://collect.example.com");

        let display = cmd.display();
        assert!(display.contains("--token ***"));
        assert!(!display.contains("very-secret-token"));
        assert!(display.contains("https://collect.example.com"));
    }
}
