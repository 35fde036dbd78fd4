use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// Outcome of one file change within a patch.
#[derive(Debug)]
pub enum ApplyResult {
    Applied { path: String, detail: String },
    Skipped { path: String, reason: String },
    Failed { path: String, error: SandboxError },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    Skipped,
    Failed,
}

/// Wire shape of an [`ApplyResult`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub path: String,
    pub status: ApplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApplyResult {
    pub fn path(&self) -> &str {
        match self {
            ApplyResult::Applied { path, .. }
            | ApplyResult::Skipped { path, .. }
            | ApplyResult::Failed { path, .. } => path,
        }
    }

    pub fn status(&self) -> ApplyStatus {
        match self {
            ApplyResult::Applied { .. } => ApplyStatus::Applied,
            ApplyResult::Skipped { .. } => ApplyStatus::Skipped,
            ApplyResult::Failed { .. } => ApplyStatus::Failed,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ApplyResult::Failed { .. })
    }

    pub fn report(&self) -> FileReport {
        let detail = match self {
            ApplyResult::Applied { detail, .. } if detail.is_empty() => None,
            ApplyResult::Applied { detail, .. } => Some(detail.clone()),
            ApplyResult::Skipped { reason, .. } => Some(reason.clone()),
            ApplyResult::Failed { error, .. } => Some(format!("{}: {error}", error.kind())),
        };
        FileReport {
            path: self.path().to_string(),
            status: self.status(),
            detail,
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "exit_code={code}")?,
            None => write!(f, "exit_code=<none>")?,
        }
        write!(
            f,
            ", timed_out={}, stdout=\"{}\", stderr=\"{}\"",
            self.timed_out, self.stdout, self.stderr
        )
    }
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStatus::Applied => write!(f, "applied"),
            ApplyStatus::Skipped => write!(f, "skipped"),
            ApplyStatus::Failed => write!(f, "failed"),
        }
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.report();
        match report.detail {
            Some(detail) => write!(f, "{} {}: {}", report.status, report.path, detail),
            None => write!(f, "{} {}", report.status, report.path),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("Patch parse error on line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("Path '{path}' is outside the sandbox root: {reason}")]
pub struct PathEscapeError {
    pub path: String,
    pub reason: String,
}

impl PathEscapeError {
    pub fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    PathEscape(#[from] PathEscapeError),
    #[error("'{path}' already exists.")]
    FileConflict { path: String },
    #[error("'{path}' not found.")]
    NotFound { path: String },
    #[error("Hunk {hunk} does not match the content of '{path}':\n{snippet}")]
    HunkMismatch {
        path: String,
        hunk: usize,
        snippet: String,
    },
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid sandbox root '{}': {reason}", .path.display())]
    InvalidRoot { path: PathBuf, reason: String },
    #[error("Failed to {action} '{}': {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SandboxError::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Stable label used in structured reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Parse(_) => "parse_error",
            SandboxError::PathEscape(_) => "path_escape",
            SandboxError::FileConflict { .. } => "file_conflict",
            SandboxError::NotFound { .. } => "not_found",
            SandboxError::HunkMismatch { .. } => "hunk_mismatch",
            SandboxError::Spawn { .. } => "spawn_error",
            SandboxError::InvalidArgument(_) => "invalid_argument",
            SandboxError::InvalidRoot { .. } => "invalid_root",
            SandboxError::Io { .. } => "io_error",
            SandboxError::Config(_) => "config_error",
        }
    }

    /// Errors caused by the request rather than by the host.
    pub fn is_caller_error(&self) -> bool {
        !matches!(
            self,
            SandboxError::Spawn { .. }
                | SandboxError::InvalidRoot { .. }
                | SandboxError::Io { .. }
                | SandboxError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_report_carries_kind_and_message() {
        let result = ApplyResult::Failed {
            path: "src/lib.rs".to_string(),
            error: SandboxError::NotFound {
                path: "src/lib.rs".to_string(),
            },
        };

        let report = result.report();
        assert_eq!(report.status, ApplyStatus::Failed);
        assert_eq!(
            report.detail.as_deref(),
            Some("not_found: 'src/lib.rs' not found.")
        );
    }

    #[test]
    fn applied_report_omits_empty_detail() {
        let result = ApplyResult::Applied {
            path: "a/b.txt".to_string(),
            detail: String::new(),
        };

        let value = serde_json::to_value(result.report()).expect("serialize report");
        assert_eq!(
            value,
            serde_json::json!({ "path": "a/b.txt", "status": "applied" })
        );
    }

    #[test]
    fn path_escape_formats_error() {
        let err: SandboxError = PathEscapeError::new("../etc/passwd", "resolves above the root").into();
        assert_eq!(
            err.to_string(),
            "Path '../etc/passwd' is outside the sandbox root: resolves above the root"
        );
        assert_eq!(err.kind(), "path_escape");
        assert!(err.is_caller_error());
    }

    #[test]
    fn execution_result_formats_missing_exit_code() {
        let result = ExecutionResult {
            exit_code: None,
            timed_out: true,
            ..Default::default()
        };
        let message = result.to_string();
        assert!(message.contains("exit_code=<none>"));
        assert!(message.contains("timed_out=true"));
        assert!(!result.success());
    }
}
