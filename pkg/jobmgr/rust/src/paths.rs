// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! On-disk layout of a job. Every path here is derived from the system root,
//! the job name and the process name only, so separate lifecycle calls agree
//! on where a job lives without sharing any state.

use std::path::{Path, PathBuf};

/// Product directory name used under `data/` and `sys/run/`.
pub const PRODUCT: &str = "jobmgr";

const DEFAULT_SYSTEM_ROOT: &str = "/var/vcap";

/// The system root, overridable with `DD_JOBMGR_SYSTEM_ROOT`.
pub fn system_root() -> PathBuf {
    std::env::var("DD_JOBMGR_SYSTEM_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SYSTEM_ROOT))
}

/// Container ID of a process: `<job>-<process>`.
pub fn container_id(job_name: &str, process_name: &str) -> String {
    format!("{job_name}-{process_name}")
}

/// `<system_root>/data/jobmgr/bundles/<job>/<process>`
pub fn bundle_path(system_root: &Path, job_name: &str, process_name: &str) -> PathBuf {
    bundles_root(system_root).join(job_name).join(process_name)
}

pub fn bundles_root(system_root: &Path) -> PathBuf {
    system_root.join("data").join(PRODUCT).join("bundles")
}

/// `<pid_dir>/<process>.pid`
pub fn pid_file(pid_dir: &Path, process_name: &str) -> PathBuf {
    pid_dir.join(format!("{process_name}.pid"))
}

/// Where the runtime keeps its own container state.
pub fn runtime_root(system_root: &Path) -> PathBuf {
    system_root.join("sys").join("run").join(format!("{PRODUCT}-runc"))
}

/// Host directories belonging to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub system_root: PathBuf,
    pub job_name: String,
}

impl JobPaths {
    pub fn new(system_root: &Path, job_name: &str) -> Self {
        Self {
            system_root: system_root.to_path_buf(),
            job_name: job_name.to_string(),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.system_root.join("sys").join("log").join(&self.job_name)
    }

    pub fn stdout_log(&self, process_name: &str) -> PathBuf {
        self.log_dir().join(format!("{process_name}.stdout.log"))
    }

    pub fn stderr_log(&self, process_name: &str) -> PathBuf {
        self.log_dir().join(format!("{process_name}.stderr.log"))
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.system_root
            .join("sys")
            .join("run")
            .join(PRODUCT)
            .join(&self.job_name)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.system_root.join("data").join(&self.job_name)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.system_root.join("store").join(&self.job_name)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.system_root
            .join("data")
            .join(PRODUCT)
            .join("tmp")
            .join(&self.job_name)
    }

    pub fn job_dir(&self) -> PathBuf {
        self.system_root.join("jobs").join(&self.job_name)
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.system_root.join("packages")
    }

    pub fn data_packages_dir(&self) -> PathBuf {
        self.system_root.join("data").join("packages")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id() {
        assert_eq!(container_id("example", "server"), "example-server");
    }

    #[test]
    fn test_bundle_path() {
        assert_eq!(
            bundle_path(Path::new("/var/vcap"), "example", "server"),
            PathBuf::from("/var/vcap/data/jobmgr/bundles/example/server")
        );
        assert_eq!(
            bundle_path(Path::new("system-root"), "example", "server"),
            PathBuf::from("system-root/data/jobmgr/bundles/example/server")
        );
    }

    #[test]
    fn test_pid_file() {
        assert_eq!(
            pid_file(Path::new("a-pid-dir"), "server"),
            PathBuf::from("a-pid-dir/server.pid")
        );
    }

    #[test]
    fn test_job_paths() {
        let paths = JobPaths::new(Path::new("/var/vcap"), "redis");
        assert_eq!(paths.log_dir(), PathBuf::from("/var/vcap/sys/log/redis"));
        assert_eq!(
            paths.stdout_log("server"),
            PathBuf::from("/var/vcap/sys/log/redis/server.stdout.log")
        );
        assert_eq!(
            paths.stderr_log("server"),
            PathBuf::from("/var/vcap/sys/log/redis/server.stderr.log")
        );
        assert_eq!(paths.pid_dir(), PathBuf::from("/var/vcap/sys/run/jobmgr/redis"));
        assert_eq!(paths.data_dir(), PathBuf::from("/var/vcap/data/redis"));
        assert_eq!(paths.store_dir(), PathBuf::from("/var/vcap/store/redis"));
        assert_eq!(
            paths.tmp_dir(),
            PathBuf::from("/var/vcap/data/jobmgr/tmp/redis")
        );
        assert_eq!(paths.job_dir(), PathBuf::from("/var/vcap/jobs/redis"));
    }

    #[test]
    fn test_default_volumes_match_job_dirs() {
        let paths = JobPaths::new(Path::new("/var/vcap"), "redis");
        let defaults = crate::config::default_volume_paths("redis");
        assert_eq!(
            defaults,
            vec![
                paths.data_dir().display().to_string(),
                paths.store_dir().display().to_string()
            ]
        );
    }

    #[test]
    fn test_runtime_root() {
        assert_eq!(
            runtime_root(Path::new("/var/vcap")),
            PathBuf::from("/var/vcap/sys/run/jobmgr-runc")
        );
    }

    #[test]
    fn test_system_root_from_env() {
        temp_env::with_var("DD_JOBMGR_SYSTEM_ROOT", Some("/tmp/vcap"), || {
            assert_eq!(system_root(), PathBuf::from("/tmp/vcap"));
        });
        temp_env::with_var_unset("DD_JOBMGR_SYSTEM_ROOT", || {
            assert_eq!(system_root(), PathBuf::from("/var/vcap"));
        });
    }
}
