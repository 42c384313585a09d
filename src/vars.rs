//! Deployment variables
//!
//! Supplies the collection token, endpoint URL, and feature toggles for the
//! run. Variables load from a YAML, JSON, or TOML file chosen by extension,
//! with environment variables as a fallback, and are validated before any
//! mutating stage executes. The token is held in a [`Secret`] whose Debug,
//! Display, and Serialize output never reveal the value.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const TOKEN_ENV: &str = "OBSERVE_TOKEN";
pub const URL_ENV: &str = "OBSERVE_URL";

/// A value that must never reach a log sink or persisted report
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying value. Callers must not pass the result to any
    /// logging or serialization path.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Secret(String::deserialize(deserializer)?))
    }
}

/// Named feature toggles passed to the agent's init-config tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureToggles {
    #[serde(default = "default_true")]
    pub self_monitoring: bool,
    #[serde(default = "default_true")]
    pub host_monitoring: bool,
    #[serde(default = "default_true")]
    pub host_monitoring_logs: bool,
    #[serde(default = "default_true")]
    pub host_monitoring_metrics_host: bool,
    #[serde(default = "default_true")]
    pub host_monitoring_metrics_process: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            self_monitoring: true,
            host_monitoring: true,
            host_monitoring_logs: true,
            host_monitoring_metrics_host: true,
            host_monitoring_metrics_process: true,
        }
    }
}

impl FeatureToggles {
    /// Flag name / enabled pairs in the order the agent tool expects them
    pub fn as_flags(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("--self-monitoring", self.self_monitoring),
            ("--host-monitoring", self.host_monitoring),
            ("--host-monitoring-logs", self.host_monitoring_logs),
            (
                "--host-monitoring-metrics-host",
                self.host_monitoring_metrics_host,
            ),
            (
                "--host-monitoring-metrics-process",
                self.host_monitoring_metrics_process,
            ),
        ]
    }
}

pub fn default_true() -> bool {
    true
}

/// Variables supplied externally for one run; immutable once loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentVariables {
    /// Collection token for the Observe endpoint
    pub token: Secret,
    /// Observe endpoint URL
    pub url: String,
    /// Feature toggles, all enabled unless overridden
    #[serde(default)]
    pub features: FeatureToggles,
    /// Override for the directory holding configuration file variants
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_dir: Option<PathBuf>,
}

impl DeploymentVariables {
    /// Fail fast if the token or URL is absent or empty. Runs before any
    /// mutating stage so a misconfigured run never partially installs.
    pub fn validate(&self) -> Result<()> {
        if self.token.is_empty() {
            anyhow::bail!("token must be supplied and non-empty");
        }
        if self.url.trim().is_empty() {
            anyhow::bail!("url must be supplied and non-empty");
        }
        Ok(())
    }
}

/// Load variables from a file, format chosen by extension
pub fn load(path: &Path) -> Result<DeploymentVariables> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read variables file {}", path.display()))?;

    let vars: DeploymentVariables = match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML variables file {}", path.display()))?,
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse JSON variables file {}", path.display()))?,
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML variables file {}", path.display()))?,
        other => anyhow::bail!(
            "Unsupported variables file extension {:?} for {}",
            other,
            path.display()
        ),
    };

    Ok(vars)
}

/// Build variables from `OBSERVE_TOKEN` / `OBSERVE_URL` when no file is given
pub fn from_env() -> Result<DeploymentVariables> {
    let token = std::env::var(TOKEN_ENV)
        .with_context(|| format!("{} is not set and no variables file was given", TOKEN_ENV))?;
    let url = std::env::var(URL_ENV)
        .with_context(|| format!("{} is not set and no variables file was given", URL_ENV))?;

    Ok(DeploymentVariables {
        token: Secret::new(token),
        url,
        features: FeatureToggles::default(),
        files_dir: None,
    })
}
