//! Keeping the SUT up to date: updaters and the conditions that trigger them.

use crate::config::{ConfigError, Options, parse_options};
use crate::process::monitor_child;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Failed to spawn update command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Update I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Rebuilds or refreshes a SUT.
pub trait Update {
    fn update(&mut self) -> Result<(), UpdateError>;
}

/// Decides whether a SUT needs an update before the next fuzz job.
pub trait UpdateCondition {
    fn should_update(&mut self) -> Result<bool, UpdateError>;
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SubprocessUpdateOptions {
    /// Shell command, e.g. `git pull && make`.
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Seconds; unlimited if absent.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Runs a shell command; its stdout is logged on success, its stderr on
/// failure. A failing command does not fail the job.
pub struct SubprocessUpdate {
    options: SubprocessUpdateOptions,
}

impl SubprocessUpdate {
    pub fn new(options: SubprocessUpdateOptions) -> Self {
        Self { options }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        Ok(Self::new(parse_options("SubprocessUpdate", options)?))
    }
}

impl Update for SubprocessUpdate {
    fn update(&mut self) -> Result<(), UpdateError> {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&self.options.command)
            .envs(&self.options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.options.cwd {
            command.current_dir(cwd);
        }
        let mut child = command.spawn().map_err(|source| UpdateError::Spawn {
            command: self.options.command.clone(),
            source,
        })?;
        let timeout = self
            .options
            .timeout
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64);
        let captured = monitor_child(&mut child, timeout, &mut |_, _| false)?;
        if captured.exit_code == Some(0) {
            info!(command = %self.options.command, "update succeeded: {}", captured.stdout.trim_end());
        } else {
            warn!(
                command = %self.options.command,
                exit_code = ?captured.exit_code,
                timed_out = captured.timed_out,
                "update failed: {}",
                captured.stderr.trim_end()
            );
        }
        Ok(())
    }
}

/// Parses `[days:][hours:][minutes:]seconds`.
pub fn parse_age(age: &str) -> Option<Duration> {
    const UNITS: [u64; 4] = [1, 60, 3600, 86400];
    let parts: Vec<&str> = age.trim().split(':').collect();
    if parts.is_empty() || parts.len() > UNITS.len() {
        return None;
    }
    let mut seconds = 0u64;
    for (part, unit) in parts.iter().rev().zip(UNITS) {
        let value: u64 = part.trim().parse().ok()?;
        seconds = seconds.checked_add(value.checked_mul(unit)?)?;
    }
    Some(Duration::from_secs(seconds))
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TimestampUpdateConditionOptions {
    pub path: PathBuf,
    pub age: String,
}

/// True if `path` is missing or was last modified longer than `age` ago.
pub struct TimestampUpdateCondition {
    path: PathBuf,
    age: Duration,
}

impl TimestampUpdateCondition {
    pub fn new(path: PathBuf, age: Duration) -> Self {
        Self { path, age }
    }

    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let options: TimestampUpdateConditionOptions = parse_options("TimestampUpdateCondition", options)?;
        let age = parse_age(&options.age).ok_or_else(|| ConfigError::Options {
            plugin: "TimestampUpdateCondition".to_string(),
            message: format!("invalid age '{}', expected [days:][hours:][minutes:]seconds", options.age),
        })?;
        Ok(Self::new(options.path, age))
    }
}

impl UpdateCondition for TimestampUpdateCondition {
    fn should_update(&mut self) -> Result<bool, UpdateError> {
        let modified = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let elapsed = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        Ok(elapsed > self.age)
    }
}
