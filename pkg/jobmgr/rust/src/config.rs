// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use log::debug;
use normalize_path::NormalizePath;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Mutable roots that `additional_volumes` must live strictly beneath.
pub const ALLOWED_VOLUME_ROOTS: [&str; 2] = ["/var/vcap/data", "/var/vcap/store"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read job config {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse job config {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid job config: {}", join_violations(.0))]
    Invalid(Vec<Violation>),
}

/// A single validation rule failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Index of the offending process in `JobConfig::processes`, or `None`
    /// when the rule applies to the job as a whole.
    pub process_index: Option<usize>,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.process_index {
            Some(i) => write!(f, "process[{i}]: {}", self.message),
            None => write!(f, "job: {}", self.message),
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub processes: Vec<ProcessConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProcessConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub workdir: Option<String>,
    pub limits: Option<Limits>,
    pub hooks: Option<Hooks>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub persistent_disk: bool,
    #[serde(default)]
    pub ephemeral_disk: bool,
    #[serde(default)]
    pub additional_volumes: Vec<Volume>,
    /// Explicit opt-out of the default sandbox. Absent means unprivileged
    /// with path-restricted volumes.
    #[serde(rename = "unsafe")]
    pub unsafe_config: Option<UnsafeConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Limits {
    /// Memory ceiling such as `512M` or `100G`.
    pub memory: Option<String>,
    pub open_files: Option<u64>,
    pub processes: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Hooks {
    pub pre_start: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UnsafeConfig {
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub unrestricted_volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Volume {
    pub path: String,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub allow_executions: bool,
}

impl ProcessConfig {
    pub fn is_privileged(&self) -> bool {
        self.unsafe_config.as_ref().is_some_and(|u| u.privileged)
    }

    pub fn unrestricted_volumes(&self) -> &[Volume] {
        self.unsafe_config
            .as_ref()
            .map(|u| u.unrestricted_volumes.as_slice())
            .unwrap_or_default()
    }

    pub fn pre_start(&self) -> Option<&str> {
        self.hooks
            .as_ref()
            .and_then(|h| h.pre_start.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Read and parse a YAML job config. The result is not validated.
pub fn parse_job_config(path: &Path) -> Result<JobConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: JobConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(
        "parsed {} process config(s) from {}",
        config.processes.len(),
        path.display()
    );
    Ok(config)
}

/// The volumes every job gets by default. `additional_volumes` may not
/// shadow them.
pub fn default_volume_paths(job_name: &str) -> Vec<String> {
    ALLOWED_VOLUME_ROOTS
        .iter()
        .map(|root| format!("{root}/{job_name}"))
        .collect()
}

impl JobConfig {
    /// Check every process against the sandbox rules and return all
    /// violations at once.
    pub fn validate(&self, default_volume_paths: &[String]) -> Result<(), ConfigError> {
        let defaults: HashSet<PathBuf> = default_volume_paths
            .iter()
            .map(|p| Path::new(p).normalize())
            .collect();

        let mut violations = Vec::new();
        let mut push = |process_index: Option<usize>, message: String| {
            violations.push(Violation {
                process_index,
                message,
            })
        };

        if self.processes.is_empty() {
            push(None, "job must declare at least one process".to_string());
        }

        let mut seen_names = HashSet::new();
        for (i, process) in self.processes.iter().enumerate() {
            let i = Some(i);
            if process.name.is_empty() {
                push(i, "process must have a name".to_string());
            } else if !is_single_path_segment(&process.name) {
                push(
                    i,
                    format!(
                        "process name {:?} must be a single path segment",
                        process.name
                    ),
                );
            } else if !seen_names.insert(process.name.as_str()) {
                push(i, format!("duplicate process name: {}", process.name));
            }

            if process.executable.is_empty() {
                push(i, "process must have an executable".to_string());
            }

            for volume in &process.additional_volumes {
                match check_volume_path(&volume.path) {
                    Ok(normalized) if defaults.contains(&normalized) => push(
                        i,
                        format!(
                            "volume {} conflicts with a default job volume",
                            volume.path
                        ),
                    ),
                    Ok(_) => {}
                    Err(reason) => push(i, format!("volume {}: {reason}", volume.path)),
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations))
        }
    }
}

/// Process names become a directory under the job's bundle, log and PID
/// dirs, so they must not navigate or nest.
fn is_single_path_segment(name: &str) -> bool {
    name != "." && name != ".." && !name.contains(['/', '\0'])
}

/// Returns the normalized path if it sits strictly beneath one of
/// [`ALLOWED_VOLUME_ROOTS`].
fn check_volume_path(raw: &str) -> Result<PathBuf, String> {
    if !raw.starts_with('/') {
        return Err("path must be absolute".to_string());
    }
    if raw.starts_with("//") {
        return Err("path must not start with a double slash".to_string());
    }

    let path = Path::new(raw);
    if path.components().any(|c| c == Component::ParentDir) {
        return Err("path must not contain '..'".to_string());
    }

    let normalized = path.normalize();
    let nested = ALLOWED_VOLUME_ROOTS.iter().any(|root| {
        normalized
            .strip_prefix(root)
            .is_ok_and(|rest| rest.components().next().is_some())
    });

    if nested {
        Ok(normalized)
    } else {
        Err(format!(
            "path must be nested under one of: {}",
            ALLOWED_VOLUME_ROOTS.join(", ")
        ))
    }
}
