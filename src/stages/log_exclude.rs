//! Log-exclusion editor stage
//!
//! After init-config generates the agent's configuration, this stage trims
//! two default log sources from it: the per-application rotated log glob and
//! the syslog file. The edit is managed as a markered block that is fully
//! replaced on each run, so re-applying it to an already-edited file is a
//! byte-identical no-op.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{StageError, StageResult};
use crate::outcome::{Stage, StageOutcome};

/// Marker template for the managed block
pub const MARKER: &str = "# {mark} observe-deploy log exclusions";

/// The log-source entries removed from the generated configuration
const EXCLUDED_SOURCES: [&str; 2] = ["/var/log/**/*.log", "/var/log/syslog"];

/// YAML list lines matching the excluded sources
const EXCLUDED_LINE_PATTERNS: [&str; 2] = [
    r"^\s*-\s*/var/log/\*\*/\*\.log\s*$",
    r"^\s*-\s*/var/log/syslog\s*$",
];

/// Apply the exclusion edit to the generated agent configuration
pub fn apply(path: &Path, dry_run: bool) -> StageResult {
    if !path.exists() {
        if dry_run {
            info!(path = %path.display(), "Would edit generated configuration once present");
            return Ok(StageOutcome::Changed);
        }
        return Err(StageError::tool(
            Stage::LogExclusion,
            anyhow::anyhow!("Generated configuration {} not found", path.display()),
        ));
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))
        .map_err(|e| StageError::tool(Stage::LogExclusion, e))?;

    let edited = edit(&content).map_err(|e| StageError::tool(Stage::LogExclusion, e))?;

    if edited == content {
        info!(path = %path.display(), "Log exclusions already applied");
        return Ok(StageOutcome::Unchanged);
    }

    if dry_run {
        info!(path = %path.display(), "Would remove default log sources");
        return Ok(StageOutcome::Changed);
    }

    fs::write(path, &edited)
        .with_context(|| format!("Failed to write {}", path.display()))
        .map_err(|e| StageError::tool(Stage::LogExclusion, e))?;

    info!(path = %path.display(), "Removed default log sources");
    Ok(StageOutcome::Changed)
}

/// Pure edit: drop the managed block and any matching source lines, then
/// append a fresh managed block. Applying this twice yields identical bytes.
pub fn edit(content: &str) -> Result<String> {
    let begin_marker = MARKER.replace("{mark}", "BEGIN");
    let end_marker = MARKER.replace("{mark}", "END");

    let patterns: Vec<Regex> = EXCLUDED_LINE_PATTERNS
        .iter()
        .map(|p| Regex::new(p).context("Invalid exclusion pattern"))
        .collect::<Result<_>>()?;

    let mut kept: Vec<&str> = Vec::new();
    let mut in_block = false;
    for line in content.lines() {
        if line.trim() == begin_marker {
            in_block = true;
            continue;
        }
        if line.trim() == end_marker {
            in_block = false;
            continue;
        }
        if in_block {
            continue;
        }
        if patterns.iter().any(|re| re.is_match(line)) {
            continue;
        }
        kept.push(line);
    }

    // Normalize trailing blank lines so repeated application converges
    while kept.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        kept.pop();
    }

    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&begin_marker);
    out.push('\n');
    for source in EXCLUDED_SOURCES {
        out.push_str(&format!("# excluded: {}\n", source));
    }
    out.push_str(&end_marker);
    out.push('\n');

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GENERATED: &str = "host_monitoring:\n  logs:\n    include:\n      - /var/log/**/*.log\n      - /var/log/syslog\n      - /var/log/auth.log\n";

    #[test]
    fn test_edit_removes_both_patterns() {
        let edited = edit(GENERATED).unwrap();
        assert!(!edited.contains("- /var/log/**/*.log"));
        assert!(!edited.contains("- /var/log/syslog"));
        // Unrelated sources survive
        assert!(edited.contains("- /var/log/auth.log"));
        assert!(edited.contains("# BEGIN observe-deploy log exclusions"));
        assert!(edited.contains("# END observe-deploy log exclusions"));
    }

    #[test]
    fn test_edit_is_idempotent_byte_for_byte() {
        let once = edit(GENERATED).unwrap();
        let twice = edit(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_apply_then_reapply_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("observe-agent.yaml");
        fs::write(&path, GENERATED).unwrap();

        assert_eq!(apply(&path, false).unwrap(), StageOutcome::Changed);
        assert_eq!(apply(&path, false).unwrap(), StageOutcome::Unchanged);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = apply(&dir.path().join("absent.yaml"), false);
        assert!(result.is_err());
    }

    #[test]
    fn test_dry_run_leaves_file_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("observe-agent.yaml");
        fs::write(&path, GENERATED).unwrap();

        assert_eq!(apply(&path, true).unwrap(), StageOutcome::Changed);
        assert_eq!(fs::read_to_string(&path).unwrap(), GENERATED);
    }

    #[test]
    fn test_indented_entries_match() {
        let content = "include:\n        - /var/log/**/*.log\n        - /var/log/kern.log\n";
        let edited = edit(content).unwrap();
        assert!(!edited.contains("/var/log/**/*.log"));
        assert!(edited.contains("/var/log/kern.log"));
    }
}
