//! Configuration backup and rollback stage
//!
//! Before tracked configuration files are overwritten, present ones are
//! copied aside with a date suffix. Backup is best-effort insurance: a failed
//! copy is logged and the run continues, because preserving history must not
//! block the deployment itself. The records are consumed only by the
//! rollback handler when a mid-sequence stage fails.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::outcome::{BackupOutcome, BackupRecord, RollbackStatus};

/// Backup path convention: `<path>.backup-<ISO date>`
pub fn backup_path_for(path: &Path) -> PathBuf {
    let date = Utc::now().format("%Y-%m-%d");
    PathBuf::from(format!("{}.backup-{}", path.display(), date))
}

/// Copy each present tracked file to its timestamped backup path
pub fn backup_files(paths: &[PathBuf], dry_run: bool) -> BackupOutcome {
    let mut records = Vec::new();
    let mut failures = Vec::new();

    for path in paths {
        if !path.exists() {
            continue;
        }

        let backup_path = backup_path_for(path);
        if dry_run {
            info!(from = %path.display(), to = %backup_path.display(), "Would back up file");
            continue;
        }

        match copy_backup(path, &backup_path) {
            Ok(record) => {
                info!(from = %path.display(), to = %backup_path.display(), "Backed up file");
                records.push(record);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{:#}", err), "Backup failed, continuing");
                failures.push(format!("{:#}", err));
            }
        }
    }

    if !failures.is_empty() {
        BackupOutcome::FailedNonFatal {
            reason: failures.join("; "),
            records,
        }
    } else if records.is_empty() {
        BackupOutcome::Skipped
    } else {
        BackupOutcome::Success { records }
    }
}

fn copy_backup(path: &Path, backup_path: &Path) -> Result<BackupRecord> {
    fs::copy(path, backup_path).with_context(|| {
        format!(
            "Failed to back up {} to {}",
            path.display(),
            backup_path.display()
        )
    })?;

    Ok(BackupRecord {
        original_path: path.to_path_buf(),
        backup_path: backup_path.to_path_buf(),
        created_at: Utc::now(),
    })
}

/// Restore each tracked file from its most recent backup record. Restore
/// failures are logged but do not escalate; the run is already failing.
pub fn restore(records: &[BackupRecord]) -> RollbackStatus {
    if records.is_empty() {
        warn!("No backups exist to restore from");
        return RollbackStatus::RestoreFailed;
    }

    let mut all_restored = true;
    for record in records {
        match fs::copy(&record.backup_path, &record.original_path) {
            Ok(_) => {
                info!(
                    from = %record.backup_path.display(),
                    to = %record.original_path.display(),
                    "Restored file from backup"
                );
            }
            Err(err) => {
                warn!(
                    path = %record.original_path.display(),
                    error = %err,
                    "Restore failed, operator intervention required"
                );
                all_restored = false;
            }
        }
    }

    if all_restored {
        RollbackStatus::Restored
    } else {
        RollbackStatus::RestoreFailed
    }
}
