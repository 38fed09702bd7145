// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Translates a process config into host-side prerequisites and a container
//! spec.

use crate::config::{ProcessConfig, Volume};
use crate::paths::{self, JobPaths};
use crate::spec::{
    self, ALL_CAPABILITIES, Capabilities, ContainerSpec, Linux, Memory, Mount, Namespace, Pids,
    Resources, Rlimit, Root,
};
use crate::usertools::User;
use anyhow::{Context, Result};
use log::debug;
use nix::unistd::{Gid, Uid, chown};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host directories bind mounted read-only at the same path.
const SYSTEM_IDENTITY_MOUNTS: [&str; 6] = ["/bin", "/etc", "/lib", "/lib64", "/sbin", "/usr"];

const MASKED_PATHS: [&str; 7] = [
    "/proc/kcore",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const READONLY_PATHS: [&str; 6] = [
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Host-side artifacts a process needs before its container can run.
#[derive(Debug)]
pub struct JobPrerequisites {
    pub pid_dir: PathBuf,
    pub stdout: File,
    pub stderr: File,
}

pub trait Adapter: Send + Sync {
    fn create_job_prerequisites(
        &self,
        system_root: &Path,
        job_name: &str,
        config: &ProcessConfig,
        user: &User,
    ) -> Result<JobPrerequisites>;

    fn build_spec(
        &self,
        system_root: &Path,
        job_name: &str,
        config: &ProcessConfig,
        user: &User,
    ) -> Result<ContainerSpec>;
}

/// Produces bundles for runc.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuncAdapter;

impl Adapter for RuncAdapter {
    fn create_job_prerequisites(
        &self,
        system_root: &Path,
        job_name: &str,
        config: &ProcessConfig,
        user: &User,
    ) -> Result<JobPrerequisites> {
        let paths = JobPaths::new(system_root, job_name);

        let mut dirs = vec![paths.log_dir(), paths.pid_dir(), paths.tmp_dir()];
        if config.ephemeral_disk {
            dirs.push(paths.data_dir());
        }
        if config.persistent_disk {
            dirs.push(paths.store_dir());
        }
        for dir in &dirs {
            create_owned_dir(dir, user)?;
        }

        let stdout = open_log(&paths.stdout_log(&config.name), user)?;
        let stderr = open_log(&paths.stderr_log(&config.name), user)?;

        debug!(
            "[{}] prepared {} job directories",
            paths::container_id(job_name, &config.name),
            dirs.len()
        );

        Ok(JobPrerequisites {
            pid_dir: paths.pid_dir(),
            stdout,
            stderr,
        })
    }

    fn build_spec(
        &self,
        system_root: &Path,
        job_name: &str,
        config: &ProcessConfig,
        user: &User,
    ) -> Result<ContainerSpec> {
        let paths = JobPaths::new(system_root, job_name);
        let privileged = config.is_privileged();

        let capabilities = if privileged {
            ALL_CAPABILITIES.iter().map(|c| c.to_string()).collect()
        } else {
            let mut caps: Vec<String> = Vec::with_capacity(config.capabilities.len());
            for cap in config.capabilities.iter().map(|c| capability_name(c)) {
                if !caps.contains(&cap) {
                    caps.push(cap);
                }
            }
            caps
        };

        let rlimits = config
            .limits
            .as_ref()
            .and_then(|l| l.open_files)
            .map(|n| Rlimit {
                kind: "RLIMIT_NOFILE".to_string(),
                hard: n,
                soft: n,
            })
            .into_iter()
            .collect();

        Ok(ContainerSpec {
            oci_version: spec::OCI_VERSION.to_string(),
            process: spec::Process {
                terminal: false,
                user: user.clone(),
                args: process_args(config),
                env: process_env(config),
                cwd: config
                    .workdir
                    .clone()
                    .unwrap_or_else(|| paths.job_dir().display().to_string()),
                capabilities: Capabilities::uniform(capabilities),
                rlimits,
                no_new_privileges: !privileged,
            },
            root: Root {
                path: "rootfs".to_string(),
                readonly: true,
            },
            hostname: config.name.clone(),
            mounts: mounts(&paths, config),
            linux: Linux {
                resources: resources(config)?,
                namespaces: ["ipc", "mount", "pid", "uts"]
                    .into_iter()
                    .map(Namespace::new)
                    .collect(),
                masked_paths: MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
                readonly_paths: READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
            },
        })
    }
}

fn create_owned_dir(dir: &Path, user: &User) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("creating {}", dir.display()))?;
    chown_to(dir, user)
}

fn open_log(path: &Path, user: &User) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    chown_to(path, user)?;
    Ok(file)
}

fn chown_to(path: &Path, user: &User) -> Result<()> {
    chown(
        path,
        Some(Uid::from_raw(user.uid)),
        Some(Gid::from_raw(user.gid)),
    )
    .with_context(|| format!("chowning {} to {}:{}", path.display(), user.uid, user.gid))
}

/// `NET_BIND_SERVICE` and `CAP_NET_BIND_SERVICE` both mean the same thing.
fn capability_name(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();
    if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    }
}

/// With a pre-start hook the shell runs the hook and then execs the real
/// executable, passing it through `$0`/`$@` so nothing is re-quoted.
fn process_args(config: &ProcessConfig) -> Vec<String> {
    let mut args = Vec::with_capacity(config.args.len() + 4);
    if let Some(hook) = config.pre_start() {
        args.push("/bin/sh".to_string());
        args.push("-c".to_string());
        args.push(format!("{hook} && exec \"$0\" \"$@\""));
    }
    args.push(config.executable.clone());
    args.extend(config.args.iter().cloned());
    args
}

fn process_env(config: &ProcessConfig) -> Vec<String> {
    let mut env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if !config.env.contains_key("PATH") {
        env.push(format!("PATH={DEFAULT_PATH}"));
    }
    if !config.env.contains_key("TMPDIR") {
        env.push("TMPDIR=/tmp".to_string());
    }
    env.sort();
    env
}

fn resources(config: &ProcessConfig) -> Result<Option<Resources>> {
    let Some(limits) = config.limits.as_ref() else {
        return Ok(None);
    };

    let memory = limits
        .memory
        .as_deref()
        .map(spec::parse_memory_limit)
        .transpose()?
        .map(|limit| Memory { limit, swap: limit });
    let pids = limits.processes.map(|limit| Pids { limit });

    if memory.is_none() && pids.is_none() {
        return Ok(None);
    }
    Ok(Some(Resources { memory, pids }))
}

fn mounts(paths: &JobPaths, config: &ProcessConfig) -> Vec<Mount> {
    let mut mounts = system_mounts();

    for dir in SYSTEM_IDENTITY_MOUNTS {
        mounts.push(Mount::identity(dir, &["nodev", "nosuid", "ro"]));
    }
    for dir in [
        paths.data_packages_dir(),
        paths.packages_dir(),
        paths.job_dir(),
    ] {
        mounts.push(Mount::identity(
            &dir.display().to_string(),
            &["nodev", "nosuid", "ro"],
        ));
    }

    let mut writable = vec![paths.log_dir(), paths.pid_dir()];
    if config.ephemeral_disk {
        writable.push(paths.data_dir());
    }
    if config.persistent_disk {
        writable.push(paths.store_dir());
    }
    for dir in writable {
        mounts.push(Mount::identity(
            &dir.display().to_string(),
            &["nodev", "nosuid", "noexec", "rw"],
        ));
    }

    let tmp = paths.tmp_dir().display().to_string();
    for destination in ["/tmp", "/var/tmp"] {
        mounts.push(Mount {
            destination: destination.to_string(),
            kind: "bind".to_string(),
            source: tmp.clone(),
            options: ["bind", "nodev", "nosuid", "noexec", "rw"]
                .iter()
                .map(|o| o.to_string())
                .collect(),
        });
    }

    mounts.extend(
        config
            .additional_volumes
            .iter()
            .chain(config.unrestricted_volumes())
            .map(volume_mount),
    );
    mounts
}

fn volume_mount(volume: &Volume) -> Mount {
    let mut options = vec!["nodev", "nosuid"];
    if !volume.allow_executions {
        options.push("noexec");
    }
    options.push(if volume.writable { "rw" } else { "ro" });
    Mount::identity(&volume.path, &options)
}

fn system_mounts() -> Vec<Mount> {
    let mount = |destination: &str, kind: &str, options: &[&str]| Mount {
        destination: destination.to_string(),
        kind: kind.to_string(),
        source: kind.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
    };
    vec![
        mount("/proc", "proc", &["nosuid", "noexec", "nodev"]),
        mount("/sys", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        mount(
            "/dev",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        mount(
            "/dev/pts",
            "devpts",
            &[
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
                "gid=5",
            ],
        ),
        mount(
            "/dev/shm",
            "tmpfs",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        mount("/dev/mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
    ]
}
