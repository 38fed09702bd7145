// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::paths;
use crate::spec::ContainerSpec;
use crate::usertools::User;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::ffi::OsStr;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Status the runtime reports once a container's init process has exited.
pub const STATUS_STOPPED: &str = "stopped";

const DEFAULT_RUNC_PATH: &str = "runc";

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerState {
    pub id: String,
    #[serde(rename = "pid")]
    pub init_process_pid: i32,
    pub status: String,
}

/// Operations the lifecycle needs from an OCI runtime.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn create_bundle(
        &self,
        bundle_path: &Path,
        spec: &ContainerSpec,
        user: &User,
    ) -> Result<()>;

    async fn run_container(
        &self,
        pid_file: &Path,
        bundle_path: &Path,
        container_id: &str,
        stdout: File,
        stderr: File,
    ) -> Result<()>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn container_state(&self, container_id: &str) -> Result<ContainerState>;

    async fn delete_container(&self, container_id: &str) -> Result<()>;

    async fn destroy_bundle(&self, bundle_path: &Path) -> Result<()>;

    async fn list_containers(&self) -> Result<Vec<ContainerState>>;
}

/// Drives the `runc` binary.
#[derive(Debug, Clone)]
pub struct RuncClient {
    runc_path: PathBuf,
    runc_root: PathBuf,
}

impl RuncClient {
    pub fn new(runc_path: impl Into<PathBuf>, runc_root: impl Into<PathBuf>) -> Self {
        Self {
            runc_path: runc_path.into(),
            runc_root: runc_root.into(),
        }
    }

    /// `runc` from `DD_JOBMGR_RUNC_PATH` (or `$PATH`), with its state kept
    /// under the system root.
    pub fn from_env(system_root: &Path) -> Self {
        let runc_path = std::env::var("DD_JOBMGR_RUNC_PATH")
            .unwrap_or_else(|_| DEFAULT_RUNC_PATH.to_string());
        Self::new(runc_path, paths::runtime_root(system_root))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.runc_path);
        cmd.arg("--root").arg(&self.runc_root);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run `runc <args>` and return its stdout. A non-zero exit is an error
    /// carrying runc's stderr.
    async fn output<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let rendered = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("running runc {rendered}");

        let output = self
            .command()
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", self.runc_path.display()))?;

        if !output.status.success() {
            bail!(
                "runc {rendered} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl RuntimeClient for RuncClient {
    async fn create_bundle(
        &self,
        bundle_path: &Path,
        spec: &ContainerSpec,
        user: &User,
    ) -> Result<()> {
        let rootfs = bundle_path.join("rootfs");
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&rootfs)
            .await
            .with_context(|| format!("creating {}", rootfs.display()))?;

        nix::unistd::chown(
            &rootfs,
            Some(nix::unistd::Uid::from_raw(user.uid)),
            Some(nix::unistd::Gid::from_raw(user.gid)),
        )
        .with_context(|| format!("chowning {} to {}", rootfs.display(), user.uid))?;

        let config = serde_json::to_vec_pretty(spec).context("serializing container spec")?;
        let config_path = bundle_path.join("config.json");
        tokio::fs::write(&config_path, config)
            .await
            .with_context(|| format!("writing {}", config_path.display()))?;
        Ok(())
    }

    async fn run_container(
        &self,
        pid_file: &Path,
        bundle_path: &Path,
        container_id: &str,
        stdout: File,
        stderr: File,
    ) -> Result<()> {
        let status = self
            .command()
            .arg("run")
            .arg("--bundle")
            .arg(bundle_path)
            .arg("--pid-file")
            .arg(pid_file)
            .arg("--detach")
            .arg(container_id)
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .await
            .with_context(|| format!("failed to execute {}", self.runc_path.display()))?;

        if !status.success() {
            bail!("runc run {container_id} exited with {status}");
        }
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.output(["kill", container_id, "TERM"]).await?;
        Ok(())
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        let stdout = self.output(["state", container_id]).await?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("parsing state of container {container_id}"))
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        self.output(["delete", "--force", container_id]).await?;
        Ok(())
    }

    async fn destroy_bundle(&self, bundle_path: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(bundle_path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(e).with_context(|| format!("removing {}", bundle_path.display()))
            }
            _ => Ok(()),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerState>> {
        let stdout = self.output(["list", "--format", "json"]).await?;
        // runc prints `null` rather than `[]` when there are no containers.
        let containers: Option<Vec<ContainerState>> =
            serde_json::from_slice(&stdout).context("parsing container list")?;
        Ok(containers.unwrap_or_default())
    }
}
