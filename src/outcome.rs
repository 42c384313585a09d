//! Per-stage outcome contract and the run report
//!
//! Every stage reports `Changed`, `Unchanged`, or `Skipped` so downstream
//! stages can branch on it directly (backup only after an install, index
//! refresh only after a repository change). The backup stage has its own
//! outcome type because its failures are tolerated rather than fatal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::StageError;

/// Result of running one workflow stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    /// Stage mutated host state (or would have, in dry-run mode)
    Changed,
    /// Host state already matched the desired state
    Unchanged,
    /// Stage did not run because its gating condition was not met
    Skipped,
}

impl StageOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, StageOutcome::Changed)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Changed => write!(f, "changed"),
            StageOutcome::Unchanged => write!(f, "unchanged"),
            StageOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// A tracked configuration file copied aside before it is overwritten
#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Outcome of the best-effort backup stage
///
/// Distinct from [`StageOutcome`] so callers can assert on a tolerated
/// failure without conflating it with a hard stage failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BackupOutcome {
    /// All present tracked files were backed up
    Success { records: Vec<BackupRecord> },
    /// Nothing to back up (gate not met, or no tracked file existed yet)
    Skipped,
    /// One or more copies failed; the run continues with whatever was saved
    FailedNonFatal {
        reason: String,
        records: Vec<BackupRecord>,
    },
}

impl BackupOutcome {
    /// Records usable by the rollback handler, whatever the outcome
    pub fn records(&self) -> &[BackupRecord] {
        match self {
            BackupOutcome::Success { records } => records,
            BackupOutcome::FailedNonFatal { records, .. } => records,
            BackupOutcome::Skipped => &[],
        }
    }
}

/// Terminal state of the rollback handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// No triggering failure occurred, or the failed stage does not roll back
    NotAttempted,
    /// All tracked files were restored from their most recent backup
    Restored,
    /// No backup existed or a restore copy failed; operator intervention required
    RestoreFailed,
}

/// Workflow stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Facts,
    Validate,
    Repository,
    Package,
    Directories,
    Backup,
    Deploy,
    Initialize,
    LogExclusion,
    Service,
    Pin,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Facts => "facts",
            Stage::Validate => "validate",
            Stage::Repository => "repository",
            Stage::Package => "package",
            Stage::Directories => "directories",
            Stage::Backup => "backup",
            Stage::Deploy => "deploy",
            Stage::Initialize => "initialize",
            Stage::LogExclusion => "log-exclusion",
            Stage::Service => "service",
            Stage::Pin => "pin",
        }
    }

    /// Whether a failure in this stage restores tracked files from backup.
    /// Only the stages that mutate deployed configuration (or depend on it
    /// being live) roll back; earlier stages abort without touching it.
    pub fn triggers_rollback(&self) -> bool {
        matches!(
            self,
            Stage::Deploy | Stage::Initialize | Stage::LogExclusion | Stage::Service
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one stage as recorded in the run report
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// Aggregate result of a full install or update run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub operation: &'static str,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageReport>,
    pub backup: Option<BackupOutcome>,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    pub rollback: RollbackStatus,
}

impl RunReport {
    pub fn new(operation: &'static str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation,
            started_at: Utc::now(),
            finished_at: None,
            stages: Vec::new(),
            backup: None,
            failed_stage: None,
            error: None,
            rollback: RollbackStatus::NotAttempted,
        }
    }

    pub fn record(&mut self, stage: Stage, outcome: StageOutcome) {
        self.stages.push(StageReport { stage, outcome });
    }

    pub fn record_backup(&mut self, outcome: BackupOutcome) {
        let stage_outcome = match &outcome {
            BackupOutcome::Success { .. } => StageOutcome::Changed,
            BackupOutcome::Skipped => StageOutcome::Skipped,
            BackupOutcome::FailedNonFatal { .. } => StageOutcome::Skipped,
        };
        self.stages.push(StageReport {
            stage: Stage::Backup,
            outcome: stage_outcome,
        });
        self.backup = Some(outcome);
    }

    pub fn fail(&mut self, err: &StageError) {
        self.failed_stage = Some(err.stage());
        self.error = Some(err.to_string());
    }

    pub fn set_rollback(&mut self, status: RollbackStatus) {
        self.rollback = status;
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.failed_stage.is_none()
    }

    pub fn stage_outcome(&self, stage: Stage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.outcome)
    }

    /// Human-readable summary printed at the end of every run
    pub fn render(&self) -> String {
        let mut out = format!("run {} ({})\n", self.run_id, self.operation);
        for entry in &self.stages {
            out.push_str(&format!("  {:<14} {}\n", entry.stage.name(), entry.outcome));
        }
        match (&self.failed_stage, &self.error) {
            (Some(stage), Some(error)) => {
                out.push_str(&format!("failed at {}: {}\n", stage, error));
                let rollback = match self.rollback {
                    RollbackStatus::NotAttempted => "not attempted",
                    RollbackStatus::Restored => "success",
                    RollbackStatus::RestoreFailed => "incomplete",
                };
                out.push_str(&format!("rollback: {}\n", rollback));
            }
            _ => out.push_str("result: success\n"),
        }
        out
    }
}
