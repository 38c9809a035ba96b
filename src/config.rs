//! Configuration management for marche.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use crate::error::ConfigError;

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/marche/marche.yaml";

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Process bootstrap settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Map of job names to their respective configurations.
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

/// Settings applied once at startup, before any job is constructed.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct DaemonConfig {
    /// Account to switch to when started as root.
    pub user: Option<String>,
    /// Group to switch to when started as root.
    pub group: Option<String>,
    /// Directory receiving `marched.pid`.
    pub piddir: Option<PathBuf>,
    /// Default log filter when neither the CLI nor `RUST_LOG` set one.
    pub loglevel: Option<String>,
    /// Status poll period for the `serve` loop.
    pub poll_interval: Option<String>,
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        match self.poll_interval.as_deref() {
            Some(raw) => parse_duration("poll_interval", raw),
            None => Ok(Duration::from_secs(5)),
        }
    }
}

/// The backend family a job section selects.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Systemd,
    #[serde(alias = "nicos")]
    Initscript,
    Taco,
}

/// One `jobs.<name>` section: the backend type plus its string parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    #[serde(rename = "type")]
    pub kind: JobKind,
    #[serde(flatten)]
    pub params: HashMap<String, String>,
}

impl JobConfig {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            params: HashMap::new(),
        }
    }

    /// Builder helper used when constructing jobs programmatically.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Returns a trimmed, non-empty parameter value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Splits a comma-separated parameter, dropping empty entries.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Optional watchdog bounding every command the job launches.
    pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.get("timeout")
            .map(|raw| parse_duration("timeout", raw))
            .transpose()
    }
}

/// Parses `10s`, `5m`, `2h` or a bare number of seconds.
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    };

    let trimmed = raw.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('s') => (&trimmed[..trimmed.len() - 1], 1),
        Some('m') => (&trimmed[..trimmed.len() - 1], 60),
        Some('h') => (&trimmed[..trimmed.len() - 1], 3600),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => return Err(invalid()),
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    let seconds = value.checked_mul(multiplier).ok_or_else(invalid)?;
    Ok(Duration::from_secs(seconds))
}

fn env_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("valid env var pattern")
    })
}

/// Expands environment variables within a string.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = env_var_regex();
    if let Some(missing) = re
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|name| env::var(name).is_err())
    {
        return Err(ConfigError::MissingVariable(missing));
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });
    Ok(result.to_string())
}

/// Parses configuration text, expanding environment variables first.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let expanded = expand_env_vars(content)?;
    let config: Config = serde_yaml::from_str(&expanded)?;
    Ok(config)
}

/// Loads and parses the configuration file.
pub fn load_config(config_path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    parse_config(&content)
}
