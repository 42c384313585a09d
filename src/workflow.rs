//! Install and update workflow orchestration
//!
//! Sequences the stages against one host, threading an explicit run context
//! (host facts plus the cross-stage changed signals) instead of ambient
//! state. Mid-sequence failures in the deploy/initialize/edit/service stages
//! trigger best-effort restoration of the tracked configuration files; the
//! package and repository registration are deliberately not reverted.

use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use crate::cmd::DEFAULT_TIMEOUT;
use crate::error::{ErrorKind, StageError};
use crate::facts::{self, HostFacts};
use crate::outcome::{BackupOutcome, BackupRecord, RunReport, Stage, StageOutcome};
use crate::stages::deploy::{self, ConfigArtifact, VariantTable};
use crate::stages::directory::DirSpec;
use crate::stages::repo::AptRepo;
use crate::stages::{backup, directory, init, log_exclude, package, repo, service};
use crate::vars::DeploymentVariables;

/// Everything fixed for a run: names, paths, rules, and the dry-run flag
#[derive(Debug, Clone)]
pub struct Settings {
    pub package: String,
    pub service: String,
    pub agent_bin: String,
    /// Directory holding the configuration file variants to deploy
    pub files_dir: PathBuf,
    /// Agent configuration directory on the host
    pub config_dir: PathBuf,
    /// The configuration file init-config generates
    pub agent_config_path: PathBuf,
    pub repo: AptRepo,
    pub directories: Vec<DirSpec>,
    pub variants: VariantTable,
    pub cmd_timeout: Duration,
    pub dry_run: bool,
}

impl Settings {
    pub fn new(dry_run: bool) -> Self {
        let config_dir = PathBuf::from("/etc/observe-agent");
        Self {
            package: "observe-agent".to_string(),
            service: "observe-agent".to_string(),
            agent_bin: "observe-agent".to_string(),
            files_dir: PathBuf::from("/etc/observe-deploy/files"),
            agent_config_path: config_dir.join("observe-agent.yaml"),
            directories: vec![DirSpec::new(&config_dir).mode(0o755)],
            config_dir,
            repo: AptRepo::observe_default(),
            variants: VariantTable::observe_default(),
            cmd_timeout: DEFAULT_TIMEOUT,
            dry_run,
        }
    }
}

/// Paths restored by the rollback handler
fn tracked_paths(artifacts: &[ConfigArtifact]) -> Vec<PathBuf> {
    artifacts.iter().map(|a| a.dest.clone()).collect()
}

/// Terminate a failed run, rolling back tracked files when the failed stage
/// calls for it. Dry runs never mutated anything, so they never roll back.
fn fail_run(
    mut report: RunReport,
    err: StageError,
    backups: &[BackupRecord],
    dry_run: bool,
) -> RunReport {
    error!(stage = %err.stage(), error = %err, "Run failed");
    report.fail(&err);

    if err.stage().triggers_rollback() && !dry_run {
        report.set_rollback(backup::restore(backups));
    }

    report.finish();
    report
}

/// Full install sequence against the current host
pub async fn install(vars: &DeploymentVariables, settings: &Settings) -> RunReport {
    match facts::probe() {
        Ok(facts) => install_with_facts(facts, vars, settings).await,
        Err(e) => {
            let mut report = RunReport::new("install");
            let err = StageError::new(Stage::Facts, ErrorKind::Preflight, e);
            report.fail(&err);
            report.finish();
            report
        }
    }
}

/// Install sequence with pre-probed facts
pub async fn install_with_facts(
    facts: HostFacts,
    vars: &DeploymentVariables,
    settings: &Settings,
) -> RunReport {
    let mut report = RunReport::new("install");
    let mut backups: Vec<BackupRecord> = Vec::new();
    let dry = settings.dry_run;
    let timeout = settings.cmd_timeout;

    info!(
        os_family = %facts.os_family,
        os_version = %facts.os_version,
        dry_run = dry,
        "Starting install run"
    );
    report.record(Stage::Facts, StageOutcome::Unchanged);

    if !facts.is_debian_family() {
        let err = StageError::preflight(
            Stage::Facts,
            format!("Unsupported OS family {}", facts.os_family),
        );
        return fail_run(report, err, &backups, dry);
    }

    // Preflight: variables and variant sources, before any mutation
    if let Err(e) = vars.validate() {
        let err = StageError::new(Stage::Validate, ErrorKind::Preflight, e);
        return fail_run(report, err, &backups, dry);
    }
    let artifacts = match deploy::resolve_artifacts(
        &settings.files_dir,
        &settings.config_dir,
        &settings.variants,
        &facts,
    ) {
        Ok(artifacts) => artifacts,
        Err(err) => return fail_run(report, err, &backups, dry),
    };
    report.record(Stage::Validate, StageOutcome::Unchanged);

    // Repository registration, index refresh only on change
    let repo_changed = match repo::ensure_registered(&settings.repo, dry) {
        Ok(outcome) => {
            report.record(Stage::Repository, outcome);
            outcome.changed()
        }
        Err(err) => return fail_run(report, err, &backups, dry),
    };
    if repo_changed {
        if let Err(err) = repo::refresh_index(dry, timeout).await {
            return fail_run(report, err, &backups, dry);
        }
    } else {
        info!("Repository unchanged, skipping index refresh");
    }

    // Package install, gating the backup stage
    let install_changed = match package::ensure_latest(&settings.package, dry, timeout).await {
        Ok(outcome) => {
            report.record(Stage::Package, outcome);
            outcome.changed()
        }
        Err(err) => return fail_run(report, err, &backups, dry),
    };

    match directory::ensure_all(&settings.directories, dry) {
        Ok(outcome) => report.record(Stage::Directories, outcome),
        Err(err) => return fail_run(report, err, &backups, dry),
    }

    if install_changed {
        let outcome = backup::backup_files(&tracked_paths(&artifacts), dry);
        backups = outcome.records().to_vec();
        report.record_backup(outcome);
    } else {
        info!("Package unchanged, skipping configuration backup");
        report.record_backup(BackupOutcome::Skipped);
    }

    match deploy::deploy_all(&artifacts, dry) {
        Ok(outcome) => report.record(Stage::Deploy, outcome),
        Err(err) => return fail_run(report, err, &backups, dry),
    }

    match init::run_init_config(&settings.agent_bin, vars, dry, timeout).await {
        Ok(outcome) => report.record(Stage::Initialize, outcome),
        Err(err) => return fail_run(report, err, &backups, dry),
    }

    match log_exclude::apply(&settings.agent_config_path, dry) {
        Ok(outcome) => report.record(Stage::LogExclusion, outcome),
        Err(err) => return fail_run(report, err, &backups, dry),
    }

    // Unit files may have arrived with the package
    if install_changed {
        if let Err(err) = service::daemon_reload(dry, timeout).await {
            return fail_run(report, err, &backups, dry);
        }
    }
    let service_outcome = match service::start_and_enable(&settings.service, dry, timeout).await {
        Ok(outcome) => outcome,
        Err(err) => return fail_run(report, err, &backups, dry),
    };
    if let Err(err) = service::verify_active(&settings.service, dry, timeout).await {
        return fail_run(report, err, &backups, dry);
    }
    report.record(Stage::Service, service_outcome);

    // Pin only after the service is verified live
    match package::pin(&settings.package, dry, timeout).await {
        Ok(outcome) => report.record(Stage::Pin, outcome),
        Err(err) => return fail_run(report, err, &backups, dry),
    }

    report.finish();
    info!(run_id = %report.run_id, "Install run completed");
    report
}

/// Update sequence: stop, replace configuration by OS version, restart, verify
pub async fn update(settings: &Settings) -> RunReport {
    match facts::probe() {
        Ok(facts) => update_with_facts(facts, settings).await,
        Err(e) => {
            let mut report = RunReport::new("update");
            let err = StageError::new(Stage::Facts, ErrorKind::Preflight, e);
            report.fail(&err);
            report.finish();
            report
        }
    }
}

/// Update sequence with pre-probed facts
pub async fn update_with_facts(facts: HostFacts, settings: &Settings) -> RunReport {
    let mut report = RunReport::new("update");
    let mut backups: Vec<BackupRecord> = Vec::new();
    let dry = settings.dry_run;
    let timeout = settings.cmd_timeout;

    info!(
        os_family = %facts.os_family,
        os_version = %facts.os_version,
        dry_run = dry,
        "Starting update run"
    );
    report.record(Stage::Facts, StageOutcome::Unchanged);

    if !facts.is_debian_family() {
        let err = StageError::preflight(
            Stage::Facts,
            format!("Unsupported OS family {}", facts.os_family),
        );
        return fail_run(report, err, &backups, dry);
    }

    let artifacts = match deploy::resolve_artifacts(
        &settings.files_dir,
        &settings.config_dir,
        &settings.variants,
        &facts,
    ) {
        Ok(artifacts) => artifacts,
        Err(err) => return fail_run(report, err, &backups, dry),
    };
    report.record(Stage::Validate, StageOutcome::Unchanged);

    // Backup before the service goes down so any later failure can restore
    let outcome = backup::backup_files(&tracked_paths(&artifacts), dry);
    backups = outcome.records().to_vec();
    report.record_backup(outcome);

    match service::stop(&settings.service, dry, timeout).await {
        Ok(outcome) => report.record(Stage::Service, outcome),
        Err(err) => return fail_run(report, err, &backups, dry),
    }

    match deploy::deploy_all(&artifacts, dry) {
        Ok(outcome) => report.record(Stage::Deploy, outcome),
        Err(err) => return fail_run(report, err, &backups, dry),
    }

    if let Err(err) = service::restart(&settings.service, dry, timeout).await {
        return fail_run(report, err, &backups, dry);
    }
    if let Err(err) = service::verify_active(&settings.service, dry, timeout).await {
        return fail_run(report, err, &backups, dry);
    }
    report.record(Stage::Service, StageOutcome::Changed);

    report.finish();
    info!(run_id = %report.run_id, "Update run completed");
    report
}
