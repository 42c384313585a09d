//! Stage error taxonomy
//!
//! Every fatal failure carries the stage it occurred in and a kind from the
//! fixed taxonomy, so the workflow can decide whether rollback fires and the
//! report can state exactly what went wrong. Leaf errors stay `anyhow` and
//! are wrapped here at the stage boundary.

use serde::Serialize;
use std::fmt;

use crate::outcome::Stage;

/// Classification of a fatal stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing variable or missing source file; nothing was mutated
    Preflight,
    /// A package/service manager or filesystem call failed
    Tool,
    /// A configuration file failed its structural parse; destination untouched
    Validation,
    /// The agent's init-config tool exited non-zero
    Initialization,
    /// The service reported not-active after start/enable
    ServiceVerification,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Preflight => "preflight error",
            ErrorKind::Tool => "tool error",
            ErrorKind::Validation => "validation error",
            ErrorKind::Initialization => "initialization error",
            ErrorKind::ServiceVerification => "service verification error",
        };
        f.write_str(name)
    }
}

/// A fatal failure in one workflow stage
#[derive(Debug)]
pub struct StageError {
    stage: Stage,
    kind: ErrorKind,
    source: anyhow::Error,
}

impl StageError {
    pub fn new(stage: Stage, kind: ErrorKind, source: anyhow::Error) -> Self {
        Self {
            stage,
            kind,
            source,
        }
    }

    pub fn preflight(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, ErrorKind::Preflight, anyhow::anyhow!(message.into()))
    }

    pub fn tool(stage: Stage, source: anyhow::Error) -> Self {
        Self::new(stage, ErrorKind::Tool, source)
    }

    pub fn validation(stage: Stage, source: anyhow::Error) -> Self {
        Self::new(stage, ErrorKind::Validation, source)
    }

    pub fn initialization(source: anyhow::Error) -> Self {
        Self::new(Stage::Initialize, ErrorKind::Initialization, source)
    }

    pub fn service_verification(message: impl Into<String>) -> Self {
        Self::new(
            Stage::Service,
            ErrorKind::ServiceVerification,
            anyhow::anyhow!(message.into()),
        )
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {} stage: {:#}", self.kind, self.stage, self.source)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Outcome-or-error contract every stage function returns
pub type StageResult = Result<crate::outcome::StageOutcome, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_stage_and_kind() {
        let err = StageError::preflight(Stage::Validate, "token must not be empty");
        let rendered = err.to_string();
        assert!(rendered.contains("preflight error"));
        assert!(rendered.contains("validate"));
        assert!(rendered.contains("token must not be empty"));
    }

    #[test]
    fn test_error_kinds() {
        let err = StageError::initialization(anyhow::anyhow!("exit status 1"));
        assert_eq!(err.kind(), ErrorKind::Initialization);
        assert_eq!(err.stage(), Stage::Initialize);

        let err = StageError::service_verification("unit reported inactive");
        assert_eq!(err.kind(), ErrorKind::ServiceVerification);
        assert_eq!(err.stage(), Stage::Service);
    }
}
