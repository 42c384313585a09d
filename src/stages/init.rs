//! Agent initializer stage
//!
//! Invokes the agent's own `init-config` entry point with the collection
//! token, endpoint URL, and the named feature toggles. Success is a zero
//! exit status; anything else is fatal and triggers rollback. The token is
//! passed to the process only and never reaches logs or error messages.

use anyhow::Context;
use std::time::Duration;
use tracing::info;

use crate::cmd::{self, CommandLine};
use crate::error::{StageError, StageResult};
use crate::outcome::StageOutcome;
use crate::vars::DeploymentVariables;

/// Build the init-config invocation with the token masked for display
pub fn init_command(agent_bin: &str, vars: &DeploymentVariables) -> CommandLine {
    let mut cmd = CommandLine::new(agent_bin)
        .arg("init-config")
        .arg("--token")
        .secret_arg(vars.token.expose())
        .arg("--observe_url")
        .arg(&vars.url);

    for (flag, enabled) in vars.features.as_flags() {
        cmd = cmd.arg(flag).arg(format!("enabled={}", enabled));
    }

    cmd
}

/// Run the agent's configuration generation tool
pub async fn run_init_config(
    agent_bin: &str,
    vars: &DeploymentVariables,
    dry_run: bool,
    timeout: Duration,
) -> StageResult {
    let cmd = init_command(agent_bin, vars);

    if dry_run {
        info!(command = %cmd.display(), "Would initialize agent configuration");
        return Ok(StageOutcome::Changed);
    }

    cmd::run_checked(&cmd, timeout)
        .await
        .context("Agent init-config failed")
        .map_err(StageError::initialization)?;

    info!("Initialized agent configuration");
    Ok(StageOutcome::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::DEFAULT_TIMEOUT;
    use crate::error::ErrorKind;
    use crate::vars::{FeatureToggles, Secret};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn test_vars() -> DeploymentVariables {
        DeploymentVariables {
            token: Secret::new("token-value-do-not-log"),
            url: "https://collect.example.com".to_string(),
            features: FeatureToggles::default(),
            files_dir: None,
        }
    }

    /// Stand-in agent binary that exits with the given status
    fn fake_agent(dir: &TempDir, exit_code: i32) -> String {
        let path = dir.path().join("observe-agent");
        fs::write(&path, format!("#!/bin/sh\nexit {}\n", exit_code)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_command_masks_token() {
        let cmd = init_command("observe-agent", &test_vars());
        let display = cmd.display();
        assert!(display.contains("--token ***"));
        assert!(!display.contains("token-value-do-not-log"));
        assert!(display.contains("--observe_url https://collect.example.com"));
        assert!(display.contains("--self-monitoring enabled=true"));
        assert!(display.contains("--host-monitoring-metrics-process enabled=true"));
    }

    #[tokio::test]
    async fn test_zero_exit_succeeds() {
        let dir = TempDir::new().unwrap();
        let agent = fake_agent(&dir, 0);

        let outcome = run_init_config(&agent, &test_vars(), false, DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Changed);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_initialization_error() {
        let dir = TempDir::new().unwrap();
        let agent = fake_agent(&dir, 1);

        let err = run_init_config(&agent, &test_vars(), false, DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Initialization);
        // The failure message must not leak the token either
        assert!(!err.to_string().contains("token-value-do-not-log"));
    }

    #[tokio::test]
    async fn test_dry_run_does_not_invoke_tool() {
        // A binary that would fail if actually run
        let dir = TempDir::new().unwrap();
        let agent = fake_agent(&dir, 7);

        let outcome = run_init_config(&agent, &test_vars(), true, DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Changed);
    }
}
