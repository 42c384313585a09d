//! Configuration deployer stage
//!
//! Selects exactly one source variant per logical configuration file based
//! on host facts, validates that its content parses as YAML, and installs it
//! atomically with the requested ownership and mode. The destination is
//! either left in its pre-run state or fully replaced, never partially
//! written.
//!
//! Variant selection is a first-match-wins rule table with a mandatory
//! default fallback, so adding OS coverage is a data change rather than new
//! conditionals. A missing source file for the selected variant fails the
//! run at preflight instead of silently falling back, since the default file
//! may be semantically wrong for that OS version.

use anyhow::{Context, Result};
use nix::unistd::{chown, Group, User};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{StageError, StageResult};
use crate::facts::HostFacts;
use crate::outcome::{Stage, StageOutcome};

/// Logical names of the tracked configuration files
pub const LOGICAL_NAMES: [&str; 2] = ["otel-collector", "logs"];

/// One rule in the variant table: all present predicates must match
#[derive(Debug, Clone)]
pub struct VariantRule {
    pub os_family: Option<String>,
    pub os_version: Option<String>,
    /// File name suffix for the variant, e.g. "-24.04"
    pub suffix: String,
}

impl VariantRule {
    fn matches(&self, facts: &HostFacts) -> bool {
        let family_ok = self
            .os_family
            .as_deref()
            .map(|f| f == facts.os_family)
            .unwrap_or(true);
        let version_ok = self
            .os_version
            .as_deref()
            .map(|v| v == facts.os_version)
            .unwrap_or(true);
        family_ok && version_ok
    }
}

/// Ordered variant rules, evaluated first-match-wins with a default fallback
#[derive(Debug, Clone, Default)]
pub struct VariantTable {
    rules: Vec<VariantRule>,
}

impl VariantTable {
    pub fn new(rules: Vec<VariantRule>) -> Self {
        Self { rules }
    }

    /// The shipped table: 24.04 hosts get the "-24.04" variants
    pub fn observe_default() -> Self {
        Self::new(vec![VariantRule {
            os_family: Some("debian".to_string()),
            os_version: Some("24.04".to_string()),
            suffix: "-24.04".to_string(),
        }])
    }

    /// Suffix of the first matching rule; empty string selects the default
    pub fn select(&self, facts: &HostFacts) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(facts))
            .map(|rule| rule.suffix.as_str())
            .unwrap_or("")
    }
}

/// A configuration file resolved to one concrete source variant
#[derive(Debug, Clone)]
pub struct ConfigArtifact {
    pub logical_name: String,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: u32,
}

/// Resolve the tracked artifacts for this host. Missing variant sources are
/// preflight failures so the run aborts before any mutation.
pub fn resolve_artifacts(
    files_dir: &Path,
    config_dir: &Path,
    table: &VariantTable,
    facts: &HostFacts,
) -> Result<Vec<ConfigArtifact>, StageError> {
    let suffix = table.select(facts);
    let mut artifacts = Vec::new();

    for logical_name in LOGICAL_NAMES {
        let source = files_dir.join(format!("{}{}.yaml", logical_name, suffix));
        if !source.exists() {
            return Err(StageError::preflight(
                Stage::Validate,
                format!(
                    "Source file {} for os_version {} is missing",
                    source.display(),
                    facts.os_version
                ),
            ));
        }

        artifacts.push(ConfigArtifact {
            logical_name: logical_name.to_string(),
            source,
            dest: config_dir.join(format!("{}.yaml", logical_name)),
            owner: None,
            group: None,
            mode: 0o644,
        });
    }

    Ok(artifacts)
}

/// Deploy all artifacts; Changed if any destination content changed
pub fn deploy_all(artifacts: &[ConfigArtifact], dry_run: bool) -> StageResult {
    let mut outcome = StageOutcome::Unchanged;

    for artifact in artifacts {
        if deploy_one(artifact, dry_run)?.changed() {
            outcome = StageOutcome::Changed;
        }
    }

    Ok(outcome)
}

/// Validate and install one artifact
pub fn deploy_one(artifact: &ConfigArtifact, dry_run: bool) -> StageResult {
    let content = fs::read_to_string(&artifact.source)
        .with_context(|| format!("Failed to read source {}", artifact.source.display()))
        .map_err(|e| StageError::tool(Stage::Deploy, e))?;

    // Content validation happens before the destination is touched
    serde_yaml::from_str::<serde_yaml::Value>(&content)
        .with_context(|| {
            format!(
                "Source {} is not well-formed YAML",
                artifact.source.display()
            )
        })
        .map_err(|e| StageError::validation(Stage::Deploy, e))?;

    let current = match fs::read_to_string(&artifact.dest) {
        Ok(existing) => Some(existing),
        Err(_) => None,
    };
    if current.as_deref() == Some(content.as_str()) {
        info!(dest = %artifact.dest.display(), "Configuration already up to date");
        return Ok(StageOutcome::Unchanged);
    }

    if dry_run {
        info!(
            src = %artifact.source.display(),
            dest = %artifact.dest.display(),
            "Would deploy configuration"
        );
        return Ok(StageOutcome::Changed);
    }

    install_atomic(artifact, &content).map_err(|e| StageError::tool(Stage::Deploy, e))?;
    info!(
        src = %artifact.source.display(),
        dest = %artifact.dest.display(),
        "Deployed configuration"
    );
    Ok(StageOutcome::Changed)
}

/// Write through a temp file in the destination directory and rename, so the
/// destination is never observed half-written.
fn install_atomic(artifact: &ConfigArtifact, content: &str) -> Result<()> {
    let dest_dir = artifact
        .dest
        .parent()
        .context("Destination has no parent directory")?;

    let mut tmp = NamedTempFile::new_in(dest_dir)
        .with_context(|| format!("Failed to create temp file in {}", dest_dir.display()))?;
    tmp.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write staged copy of {}", artifact.dest.display()))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(artifact.mode))
        .with_context(|| format!("Failed to set mode on {}", artifact.dest.display()))?;

    tmp.persist(&artifact.dest)
        .with_context(|| format!("Failed to install {}", artifact.dest.display()))?;

    if artifact.owner.is_some() || artifact.group.is_some() {
        let uid = artifact
            .owner
            .as_deref()
            .map(|name| {
                User::from_name(name)?
                    .map(|u| u.uid)
                    .ok_or_else(|| nix::errno::Errno::ENOENT)
            })
            .transpose()
            .with_context(|| format!("Failed to resolve owner for {}", artifact.dest.display()))?;
        let gid = artifact
            .group
            .as_deref()
            .map(|name| {
                Group::from_name(name)?
                    .map(|g| g.gid)
                    .ok_or_else(|| nix::errno::Errno::ENOENT)
            })
            .transpose()
            .with_context(|| format!("Failed to resolve group for {}", artifact.dest.display()))?;

        chown(&artifact.dest, uid, gid)
            .with_context(|| format!("Failed to set ownership on {}", artifact.dest.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn facts(version: &str) -> HostFacts {
        HostFacts {
            os_family: "debian".to_string(),
            os_version: version.to_string(),
            os_id: "ubuntu".to_string(),
            hostname: None,
        }
    }

    fn seed_files_dir(dir: &Path) {
        fs::write(dir.join("otel-collector.yaml"), "receivers: {}\n").unwrap();
        fs::write(
            dir.join("otel-collector-24.04.yaml"),
            "receivers: {}\nextensions: {}\n",
        )
        .unwrap();
        fs::write(dir.join("logs.yaml"), "include:\n  - /var/log/syslog\n").unwrap();
        fs::write(dir.join("logs-24.04.yaml"), "include: []\n").unwrap();
    }

    #[test]
    fn test_variant_selection_2404() {
        let table = VariantTable::observe_default();
        assert_eq!(table.select(&facts("24.04")), "-24.04");
    }

    #[test]
    fn test_variant_selection_default_fallback() {
        let table = VariantTable::observe_default();
        assert_eq!(table.select(&facts("22.04")), "");
    }

    #[test]
    fn test_first_match_wins() {
        let table = VariantTable::new(vec![
            VariantRule {
                os_family: None,
                os_version: Some("24.04".to_string()),
                suffix: "-first".to_string(),
            },
            VariantRule {
                os_family: Some("debian".to_string()),
                os_version: None,
                suffix: "-second".to_string(),
            },
        ]);
        assert_eq!(table.select(&facts("24.04")), "-first");
        assert_eq!(table.select(&facts("12")), "-second");
    }

    #[test]
    fn test_resolve_selects_suffixed_sources_for_2404() {
        let files = TempDir::new().unwrap();
        let config = TempDir::new().unwrap();
        seed_files_dir(files.path());

        let artifacts = resolve_artifacts(
            files.path(),
            config.path(),
            &VariantTable::observe_default(),
            &facts("24.04"),
        )
        .unwrap();

        assert_eq!(artifacts.len(), 2);
        assert!(artifacts[0]
            .source
            .to_string_lossy()
            .ends_with("otel-collector-24.04.yaml"));
        assert!(artifacts[1].source.to_string_lossy().ends_with("logs-24.04.yaml"));
        // Destinations keep the logical names
        assert!(artifacts[0]
            .dest
            .to_string_lossy()
            .ends_with("otel-collector.yaml"));
    }

    #[test]
    fn test_resolve_selects_defaults_for_2204() {
        let files = TempDir::new().unwrap();
        let config = TempDir::new().unwrap();
        seed_files_dir(files.path());

        let artifacts = resolve_artifacts(
            files.path(),
            config.path(),
            &VariantTable::observe_default(),
            &facts("22.04"),
        )
        .unwrap();

        assert!(artifacts[0]
            .source
            .to_string_lossy()
            .ends_with("otel-collector.yaml"));
        assert!(artifacts[1].source.to_string_lossy().ends_with("logs.yaml"));
    }

    #[test]
    fn test_missing_variant_source_is_preflight_failure() {
        let files = TempDir::new().unwrap();
        let config = TempDir::new().unwrap();
        // Only default files; the 24.04 variants are missing
        fs::write(files.path().join("otel-collector.yaml"), "a: 1\n").unwrap();
        fs::write(files.path().join("logs.yaml"), "b: 2\n").unwrap();

        let err = resolve_artifacts(
            files.path(),
            config.path(),
            &VariantTable::observe_default(),
            &facts("24.04"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Preflight);
    }

    #[test]
    fn test_deploy_writes_and_is_idempotent() {
        let files = TempDir::new().unwrap();
        let config = TempDir::new().unwrap();
        seed_files_dir(files.path());

        let artifacts = resolve_artifacts(
            files.path(),
            config.path(),
            &VariantTable::observe_default(),
            &facts("22.04"),
        )
        .unwrap();

        assert_eq!(deploy_all(&artifacts, false).unwrap(), StageOutcome::Changed);
        assert_eq!(
            deploy_all(&artifacts, false).unwrap(),
            StageOutcome::Unchanged
        );

        let deployed = fs::read_to_string(config.path().join("logs.yaml")).unwrap();
        assert!(deployed.contains("/var/log/syslog"));
    }

    #[test]
    fn test_validation_failure_leaves_destination_untouched() {
        let files = TempDir::new().unwrap();
        let config = TempDir::new().unwrap();
        fs::write(files.path().join("bad.yaml"), "key: [unclosed\n").unwrap();

        let dest = config.path().join("bad.yaml");
        fs::write(&dest, "previous: contents\n").unwrap();

        let artifact = ConfigArtifact {
            logical_name: "bad".to_string(),
            source: files.path().join("bad.yaml"),
            dest: dest.clone(),
            owner: None,
            group: None,
            mode: 0o644,
        };

        let err = deploy_one(&artifact, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "previous: contents\n");
    }

    #[test]
    fn test_deploy_sets_mode() {
        let files = TempDir::new().unwrap();
        let config = TempDir::new().unwrap();
        fs::write(files.path().join("conf.yaml"), "a: 1\n").unwrap();

        let artifact = ConfigArtifact {
            logical_name: "conf".to_string(),
            source: files.path().join("conf.yaml"),
            dest: config.path().join("conf.yaml"),
            owner: None,
            group: None,
            mode: 0o640,
        };

        assert_eq!(deploy_one(&artifact, false).unwrap(), StageOutcome::Changed);
        let mode = fs::metadata(&artifact.dest).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_dry_run_does_not_write() {
        let files = TempDir::new().unwrap();
        let config = TempDir::new().unwrap();
        fs::write(files.path().join("conf.yaml"), "a: 1\n").unwrap();

        let artifact = ConfigArtifact {
            logical_name: "conf".to_string(),
            source: files.path().join("conf.yaml"),
            dest: config.path().join("conf.yaml"),
            owner: None,
            group: None,
            mode: 0o644,
        };

        assert_eq!(deploy_one(&artifact, true).unwrap(), StageOutcome::Changed);
        assert!(!artifact.dest.exists());
    }
}
