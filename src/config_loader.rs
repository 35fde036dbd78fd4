use std::fs;
use std::path::Path;

use crate::config::{Config, ConfigError, FetchConfig, SearchConfig, ShellConfig};

pub const BASE_CONFIG_FILE: &str = ".sandpit.toml";
pub const LOCAL_CONFIG_FILE: &str = ".sandpit.local.toml";

/// Loads and parses a single TOML configuration file into a Config struct.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let contents =
        fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound(path.to_path_buf()))?;

    toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Merges two Config structs, with values from `local` overriding `base`.
pub fn merge(base: Config, local: Config) -> Config {
    Config {
        shell: ShellConfig {
            binary: local.shell.binary.or(base.shell.binary),
            args: local.shell.args.or(base.shell.args),
            default_timeout_secs: local
                .shell
                .default_timeout_secs
                .or(base.shell.default_timeout_secs),
            max_output_bytes: local.shell.max_output_bytes.or(base.shell.max_output_bytes),
            env_deny_prefixes: local
                .shell
                .env_deny_prefixes
                .or(base.shell.env_deny_prefixes),
        },
        fetch: FetchConfig {
            max_file_bytes: local.fetch.max_file_bytes.or(base.fetch.max_file_bytes),
        },
        search: SearchConfig {
            max_results: local.search.max_results.or(base.search.max_results),
        },
    }
}

/// Loads the final merged configuration from defaults, .sandpit.toml, and .sandpit.local.toml.
pub fn load_final() -> Result<Config, ConfigError> {
    load_from_dir(Path::new("."))
}

/// Same as [`load_final`], reading the config files from `dir`.
pub fn load_from_dir(dir: &Path) -> Result<Config, ConfigError> {
    let mut merged = Config::default();

    // Merge: defaults <- project <- local
    for name in [BASE_CONFIG_FILE, LOCAL_CONFIG_FILE] {
        let path = dir.join(name);
        if path.exists() {
            merged = merge(merged, load_file(&path)?);
        }
    }

    validate(&merged)?;
    Ok(merged)
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let zero_limits = [
        (
            "shell.default-timeout-secs",
            config.shell.default_timeout_secs == Some(0),
        ),
        ("shell.max-output-bytes", config.shell.max_output_bytes == Some(0)),
        ("fetch.max-file-bytes", config.fetch.max_file_bytes == Some(0)),
        ("search.max-results", config.search.max_results == Some(0)),
    ];
    if let Some((key, _)) = zero_limits.iter().find(|(_, is_zero)| *is_zero) {
        return Err(invalid(key, "must be greater than zero"));
    }

    if config.shell.args.is_some() && config.shell.binary.is_none() {
        return Err(invalid("shell.args", "requires shell.binary to be set"));
    }
    if config
        .shell
        .binary
        .as_deref()
        .is_some_and(|binary| binary.trim().is_empty())
    {
        return Err(invalid("shell.binary", "must not be empty"));
    }

    Ok(())
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
