use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 200_000;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_MAX_RESULTS: usize = 20;
pub const DEFAULT_ENV_DENY_PREFIXES: &[&str] =
    &["AWS_", "GCP_", "AZURE_", "DOCKER_", "KUBECONFIG", "SSH_"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShellConfig {
    pub binary: Option<String>,
    pub args: Option<Vec<String>>,
    pub default_timeout_secs: Option<u64>,
    pub max_output_bytes: Option<usize>,
    pub env_deny_prefixes: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FetchConfig {
    pub max_file_bytes: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SearchConfig {
    pub max_results: Option<usize>,
}

impl ShellConfig {
    pub fn default_timeout_secs(&self) -> u64 {
        self.default_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }
}

impl FetchConfig {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes.unwrap_or(DEFAULT_MAX_FILE_BYTES)
    }
}

impl SearchConfig {
    pub fn max_results(&self) -> usize {
        self.max_results.unwrap_or(DEFAULT_MAX_RESULTS)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl From<ConfigError> for crate::domain::SandboxError {
    fn from(error: ConfigError) -> Self {
        crate::domain::SandboxError::Config(error.to_string())
    }
}
