//! Host facts probe
//!
//! Reads OS family and version from `/etc/os-release`, captured once per run
//! before any branch that depends on them. A host that cannot be identified
//! is fatal for the whole run since every later conditional depends on it.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Read-only facts about the target host
#[derive(Debug, Clone, Serialize)]
pub struct HostFacts {
    /// Normalized family, "debian" for Debian/Ubuntu and derivatives
    pub os_family: String,
    /// Distribution version, e.g. "24.04" or "12"
    pub os_version: String,
    /// Distribution identifier as reported, e.g. "ubuntu"
    pub os_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl HostFacts {
    pub fn is_debian_family(&self) -> bool {
        self.os_family == "debian"
    }
}

/// Probe facts for the current host
pub fn probe() -> Result<HostFacts> {
    let content = fs::read_to_string(Path::new(OS_RELEASE_PATH))
        .with_context(|| format!("Failed to read {}", OS_RELEASE_PATH))?;
    let mut facts = from_os_release(&content)?;

    if let Ok(name) = hostname::get() {
        facts.hostname = name.to_str().map(|s| s.to_string());
    }

    Ok(facts)
}

/// Parse facts out of os-release content
pub fn from_os_release(content: &str) -> Result<HostFacts> {
    let fields = parse_os_release(content);

    let os_id = fields
        .get("ID")
        .cloned()
        .context("os-release is missing ID")?;
    let os_version = fields
        .get("VERSION_ID")
        .cloned()
        .context("os-release is missing VERSION_ID")?;

    let id_like = fields.get("ID_LIKE").map(String::as_str).unwrap_or("");
    let os_family = if os_id == "debian" || id_like.split_whitespace().any(|id| id == "debian") {
        "debian".to_string()
    } else {
        os_id.clone()
    };

    Ok(HostFacts {
        os_family,
        os_version,
        os_id,
        hostname: None,
    })
}

/// Split os-release KEY=VALUE lines, stripping surrounding quotes
fn parse_os_release(content: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            fields.insert(key.trim().to_string(), value.to_string());
        }
    }

    fields
}
