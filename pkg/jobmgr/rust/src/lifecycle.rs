// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Start, stop, remove and list job processes. Nothing is cached between
//! calls; every operation recomputes container IDs and paths from the job
//! name and process config.

use crate::adapter::{Adapter, RuncAdapter};
use crate::client::{RuncClient, RuntimeClient, STATUS_STOPPED};
use crate::clock::{Clock, TokioClock};
use crate::config::ProcessConfig;
use crate::error::LifecycleError;
use crate::models::Job;
use crate::paths;
use crate::usertools::{SystemUserFinder, User, UserFinder, VCAP_USER};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How often a stopping container's state is queried.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct JobLifecycle {
    client: Arc<dyn RuntimeClient>,
    adapter: Arc<dyn Adapter>,
    user_finder: Arc<dyn UserFinder>,
    clock: Arc<dyn Clock>,
    system_root: PathBuf,
}

impl JobLifecycle {
    pub fn new(
        client: Arc<dyn RuntimeClient>,
        adapter: Arc<dyn Adapter>,
        user_finder: Arc<dyn UserFinder>,
        clock: Arc<dyn Clock>,
        system_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            adapter,
            user_finder,
            clock,
            system_root: system_root.into(),
        }
    }

    /// Production wiring: runc, the host passwd database and wall-clock time,
    /// rooted at [`paths::system_root`].
    pub fn from_env() -> Self {
        let system_root = paths::system_root();
        Self::new(
            Arc::new(RuncClient::from_env(&system_root)),
            Arc::new(RuncAdapter),
            Arc::new(SystemUserFinder),
            Arc::new(TokioClock),
            system_root,
        )
    }

    pub fn system_root(&self) -> &Path {
        &self.system_root
    }

    fn resolve_user(&self, config: &ProcessConfig) -> Result<User, LifecycleError> {
        if config.is_privileged() {
            return Ok(User::root());
        }
        self.user_finder
            .lookup(VCAP_USER)
            .map_err(|source| LifecycleError::UserLookup {
                username: VCAP_USER.to_string(),
                source,
            })
    }

    /// Prepare the host, write the bundle and launch the process's container.
    /// A failing step aborts without undoing the steps before it.
    pub async fn start_job(
        &self,
        job_name: &str,
        config: &ProcessConfig,
    ) -> Result<(), LifecycleError> {
        let container_id = paths::container_id(job_name, &config.name);
        let user = self.resolve_user(config)?;

        let prereqs = self
            .adapter
            .create_job_prerequisites(&self.system_root, job_name, config, &user)
            .map_err(|source| LifecycleError::Prerequisites {
                container_id: container_id.clone(),
                source,
            })?;

        let spec = self
            .adapter
            .build_spec(&self.system_root, job_name, config, &user)
            .map_err(|source| LifecycleError::BuildSpec {
                container_id: container_id.clone(),
                source,
            })?;

        let bundle_path = paths::bundle_path(&self.system_root, job_name, &config.name);
        self.client
            .create_bundle(&bundle_path, &spec, &user)
            .await
            .map_err(|source| LifecycleError::CreateBundle {
                container_id: container_id.clone(),
                bundle_path: bundle_path.clone(),
                source,
            })?;

        let pid_file = paths::pid_file(&prereqs.pid_dir, &config.name);
        self.client
            .run_container(
                &pid_file,
                &bundle_path,
                &container_id,
                prereqs.stdout,
                prereqs.stderr,
            )
            .await
            .map_err(|source| LifecycleError::RunContainer {
                container_id: container_id.clone(),
                source,
            })?;

        info!("[{container_id}] started as uid {}", user.uid);
        Ok(())
    }

    /// Ask the container to stop, then wait up to `exit_timeout` for it to
    /// report `stopped`. On [`LifecycleError::Timeout`] the caller should
    /// escalate with [`JobLifecycle::remove_job`].
    pub async fn stop_job(
        &self,
        job_name: &str,
        config: &ProcessConfig,
        exit_timeout: Duration,
    ) -> Result<(), LifecycleError> {
        let container_id = paths::container_id(job_name, &config.name);
        let mut timer = self.clock.timer(exit_timeout);

        info!("[{container_id}] stopping (timeout {exit_timeout:?})");
        self.client
            .stop_container(&container_id)
            .await
            .map_err(|source| LifecycleError::StopContainer {
                container_id: container_id.clone(),
                source,
            })?;

        let mut ticker = self.clock.ticker(STATE_POLL_INTERVAL);
        loop {
            match self.client.container_state(&container_id).await {
                Ok(state) if state.status == STATUS_STOPPED => {
                    info!("[{container_id}] stopped");
                    return Ok(());
                }
                Ok(state) => debug!("[{container_id}] still {}", state.status),
                Err(e) => debug!("[{container_id}] state query failed: {e:#}"),
            }

            tokio::select! {
                biased;
                _ = &mut timer => {
                    warn!("[{container_id}] did not stop within {exit_timeout:?}");
                    return Err(LifecycleError::Timeout { container_id });
                }
                _ = ticker.tick() => {}
            }
        }
    }

    /// Force-delete the container and remove its bundle. Both steps always
    /// run; the first failure is returned.
    pub async fn remove_job(
        &self,
        job_name: &str,
        config: &ProcessConfig,
    ) -> Result<(), LifecycleError> {
        let container_id = paths::container_id(job_name, &config.name);
        let bundle_path = paths::bundle_path(&self.system_root, job_name, &config.name);

        let deleted = self
            .client
            .delete_container(&container_id)
            .await
            .map_err(|source| LifecycleError::DeleteContainer {
                container_id: container_id.clone(),
                source,
            });
        let destroyed = self
            .client
            .destroy_bundle(&bundle_path)
            .await
            .map_err(|source| LifecycleError::DestroyBundle {
                container_id: container_id.clone(),
                bundle_path,
                source,
            });

        match (deleted, destroyed) {
            (Ok(()), Ok(())) => {
                info!("[{container_id}] removed");
                Ok(())
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(first), Err(second)) => {
                warn!("{:#}", anyhow::Error::new(second));
                Err(first)
            }
        }
    }

    /// Every container the runtime knows about, in the runtime's order.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, LifecycleError> {
        let containers = self
            .client
            .list_containers()
            .await
            .map_err(|source| LifecycleError::ListContainers { source })?;

        Ok(containers
            .into_iter()
            .map(|c| Job {
                name: c.id,
                pid: c.init_process_pid,
                status: c.status,
            })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use crate::client::ContainerState;
    use crate::config::UnsafeConfig;
    use crate::error::ErrorKind;
    use crate::spec::ContainerSpec;
    use crate::testing::{
        AdapterCall, FakeAdapter, FakeClock, FakeRuntimeClient, FakeUserFinder, RuntimeCall,
        RuntimeOp, wait_until,
    };
    use std::os::unix::fs::PermissionsExt;

    const JOB: &str = "example";

    fn vcap() -> User {
        User {
            uid: 2000,
            gid: 3000,
            username: VCAP_USER.to_string(),
        }
    }

    fn make_config() -> ProcessConfig {
        ProcessConfig {
            name: "server".to_string(),
            executable: "/var/vcap/packages/server/bin/server".to_string(),
            ..Default::default()
        }
    }

    struct Harness {
        runtime: Arc<FakeRuntimeClient>,
        adapter: Arc<FakeAdapter>,
        users: Arc<FakeUserFinder>,
        clock: FakeClock,
        lifecycle: Arc<JobLifecycle>,
    }

    fn harness() -> Harness {
        let runtime = Arc::new(FakeRuntimeClient::new());
        let spec = ContainerSpec {
            hostname: "server".to_string(),
            ..Default::default()
        };
        let adapter = Arc::new(FakeAdapter::new("/var/vcap/sys/run/jobmgr/example", spec));
        let users = Arc::new(FakeUserFinder::new().with_user(vcap()));
        let clock = FakeClock::new();
        let lifecycle = Arc::new(JobLifecycle::new(
            runtime.clone(),
            adapter.clone(),
            users.clone(),
            Arc::new(clock.clone()),
            "/var/vcap",
        ));
        Harness {
            runtime,
            adapter,
            users,
            clock,
            lifecycle,
        }
    }

    // -- wiring tests --

    #[tokio::test]
    async fn test_from_env_uses_system_root_and_runc_path() {
        let dir = tempfile::tempdir().unwrap();
        let runc = dir.path().join("runc");
        std::fs::write(
            &runc,
            "#!/bin/sh\nshift 2\n[ \"$1\" = list ] && echo '[{\"id\":\"example-server\",\"pid\":7,\"status\":\"running\"}]'\n",
        )
        .unwrap();
        std::fs::set_permissions(&runc, std::fs::Permissions::from_mode(0o755)).unwrap();

        let root = dir.path().join("vcap");
        let lifecycle = temp_env::with_vars(
            [
                ("DD_JOBMGR_SYSTEM_ROOT", Some(root.as_os_str())),
                ("DD_JOBMGR_RUNC_PATH", Some(runc.as_os_str())),
            ],
            JobLifecycle::from_env,
        );

        assert_eq!(lifecycle.system_root(), root.as_path());
        assert_eq!(
            lifecycle.list_jobs().await.unwrap(),
            vec![Job {
                name: "example-server".to_string(),
                pid: 7,
                status: "running".to_string(),
            }]
        );
    }

    // -- start_job tests --

    #[tokio::test]
    async fn test_start_job_steps_in_order() {
        let h = harness();
        h.lifecycle.start_job(JOB, &make_config()).await.unwrap();

        assert_eq!(h.users.lookups(), vec![VCAP_USER]);
        assert_eq!(
            h.adapter.calls(),
            vec![
                AdapterCall::CreateJobPrerequisites {
                    system_root: PathBuf::from("/var/vcap"),
                    job_name: JOB.to_string(),
                    process_name: "server".to_string(),
                    user: vcap(),
                },
                AdapterCall::BuildSpec {
                    system_root: PathBuf::from("/var/vcap"),
                    job_name: JOB.to_string(),
                    process_name: "server".to_string(),
                    user: vcap(),
                },
            ]
        );

        let bundle_path = PathBuf::from("/var/vcap/data/jobmgr/bundles/example/server");
        assert_eq!(
            h.runtime.calls(),
            vec![
                RuntimeCall::CreateBundle {
                    bundle_path: bundle_path.clone(),
                    spec: ContainerSpec {
                        hostname: "server".to_string(),
                        ..Default::default()
                    },
                    user: vcap(),
                },
                RuntimeCall::RunContainer {
                    pid_file: PathBuf::from("/var/vcap/sys/run/jobmgr/example/server.pid"),
                    bundle_path,
                    container_id: "example-server".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_start_job_privileged_runs_as_root_without_lookup() {
        let h = harness();
        let mut cfg = make_config();
        cfg.unsafe_config = Some(UnsafeConfig {
            privileged: true,
            unrestricted_volumes: vec![],
        });

        h.lifecycle.start_job(JOB, &cfg).await.unwrap();

        assert!(h.users.lookups().is_empty());
        match &h.runtime.calls()[0] {
            RuntimeCall::CreateBundle { user, .. } => assert_eq!(user, &User::root()),
            other => panic!("unexpected first call {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_job_user_lookup_failure() {
        let h = harness();
        h.users.fail_with("passwd unavailable");

        let err = h.lifecycle.start_job(JOB, &make_config()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(h.adapter.calls().is_empty());
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_job_prerequisites_failure() {
        let h = harness();
        h.adapter.fail_prerequisites("disk full");

        let err = h.lifecycle.start_job(JOB, &make_config()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Prerequisite);
        assert_eq!(h.adapter.calls().len(), 1);
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_job_build_spec_failure() {
        let h = harness();
        h.adapter.fail_build_spec("bad memory limit");

        let err = h.lifecycle.start_job(JOB, &make_config()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Spec);
        assert!(h.runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_job_create_bundle_failure() {
        let h = harness();
        h.runtime.fail(RuntimeOp::CreateBundle, "read-only fs");

        let err = h.lifecycle.start_job(JOB, &make_config()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bundle);
        assert_eq!(h.runtime.ops(), vec![RuntimeOp::CreateBundle]);
    }

    #[tokio::test]
    async fn test_start_job_run_failure() {
        let h = harness();
        h.runtime.fail(RuntimeOp::RunContainer, "exit status 1");

        let err = h.lifecycle.start_job(JOB, &make_config()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::RunContainer { .. }));
        assert_eq!(
            format!("{:#}", anyhow::Error::from(err)),
            "[example-server] failed to run container: exit status 1"
        );
    }

    // -- stop_job tests --

    #[tokio::test]
    async fn test_stop_job_stopped_after_second_query() {
        let h = harness();
        h.runtime.push_status("running");
        h.runtime.set_status(STATUS_STOPPED);

        let lifecycle = h.lifecycle.clone();
        let task = tokio::spawn(async move {
            lifecycle
                .stop_job(JOB, &make_config(), Duration::from_secs(5))
                .await
        });

        let runtime = h.runtime.clone();
        assert!(wait_until(|| runtime.count(RuntimeOp::ContainerState) == 1).await);
        h.clock.advance(STATE_POLL_INTERVAL);

        task.await.unwrap().unwrap();
        assert_eq!(
            h.runtime.ops(),
            vec![
                RuntimeOp::StopContainer,
                RuntimeOp::ContainerState,
                RuntimeOp::ContainerState,
            ]
        );
        assert_eq!(h.clock.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_job_already_stopped() {
        let h = harness();
        h.runtime.set_status(STATUS_STOPPED);

        h.lifecycle
            .stop_job(JOB, &make_config(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(h.runtime.count(RuntimeOp::ContainerState), 1);
    }

    #[tokio::test]
    async fn test_stop_job_times_out() {
        let h = harness();
        h.runtime.set_status("running");

        let lifecycle = h.lifecycle.clone();
        let task = tokio::spawn(async move {
            lifecycle
                .stop_job(JOB, &make_config(), Duration::from_secs(5))
                .await
        });

        let runtime = h.runtime.clone();
        for expected in 1..=5 {
            assert!(wait_until(|| runtime.count(RuntimeOp::ContainerState) == expected).await);
            h.clock.advance(STATE_POLL_INTERVAL);
        }

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(h.runtime.count(RuntimeOp::StopContainer), 1);
        assert_eq!(h.runtime.count(RuntimeOp::ContainerState), 5);
    }

    #[tokio::test]
    async fn test_stop_job_clock_jumps_past_timeout() {
        let h = harness();
        h.runtime.set_status("running");

        let lifecycle = h.lifecycle.clone();
        let task = tokio::spawn(async move {
            lifecycle
                .stop_job(JOB, &make_config(), Duration::from_secs(5))
                .await
        });

        let runtime = h.runtime.clone();
        assert!(wait_until(|| runtime.count(RuntimeOp::ContainerState) == 1).await);
        h.clock.advance(STATE_POLL_INTERVAL);
        assert!(wait_until(|| runtime.count(RuntimeOp::ContainerState) == 2).await);
        h.clock.advance(Duration::from_secs(5));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::Timeout { ref container_id } if container_id == "example-server"));
        assert_eq!(h.runtime.count(RuntimeOp::ContainerState), 2);
    }

    #[tokio::test]
    async fn test_stop_job_query_errors_keep_polling() {
        let h = harness();
        h.runtime.push_state_error("container not found");
        h.runtime.push_state_error("container not found");
        h.runtime.set_status(STATUS_STOPPED);

        let lifecycle = h.lifecycle.clone();
        let task = tokio::spawn(async move {
            lifecycle
                .stop_job(JOB, &make_config(), Duration::from_secs(5))
                .await
        });

        let runtime = h.runtime.clone();
        for expected in 1..=2 {
            assert!(wait_until(|| runtime.count(RuntimeOp::ContainerState) == expected).await);
            h.clock.advance(STATE_POLL_INTERVAL);
        }

        task.await.unwrap().unwrap();
        assert_eq!(h.runtime.count(RuntimeOp::ContainerState), 3);
    }

    #[tokio::test]
    async fn test_stop_job_stop_failure() {
        let h = harness();
        h.runtime.fail(RuntimeOp::StopContainer, "no such container");

        let err = h
            .lifecycle
            .stop_job(JOB, &make_config(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::StopContainer { .. }));
        assert_eq!(h.runtime.ops(), vec![RuntimeOp::StopContainer]);
    }

    // -- remove_job tests --

    #[tokio::test]
    async fn test_remove_job() {
        let h = harness();
        h.lifecycle.remove_job(JOB, &make_config()).await.unwrap();
        assert_eq!(
            h.runtime.calls(),
            vec![
                RuntimeCall::DeleteContainer {
                    container_id: "example-server".to_string(),
                },
                RuntimeCall::DestroyBundle {
                    bundle_path: PathBuf::from("/var/vcap/data/jobmgr/bundles/example/server"),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_job_destroys_bundle_after_delete_failure() {
        let h = harness();
        h.runtime.fail(RuntimeOp::DeleteContainer, "runc delete failed");

        let err = h.lifecycle.remove_job(JOB, &make_config()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DeleteContainer { .. }));
        assert_eq!(
            h.runtime.ops(),
            vec![RuntimeOp::DeleteContainer, RuntimeOp::DestroyBundle]
        );
    }

    #[tokio::test]
    async fn test_remove_job_destroy_failure() {
        let h = harness();
        h.runtime.fail(RuntimeOp::DestroyBundle, "busy");

        let err = h.lifecycle.remove_job(JOB, &make_config()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DestroyBundle { .. }));
    }

    #[tokio::test]
    async fn test_remove_job_both_fail_returns_first() {
        let h = harness();
        h.runtime.fail(RuntimeOp::DeleteContainer, "delete failed");
        h.runtime.fail(RuntimeOp::DestroyBundle, "destroy failed");

        let err = h.lifecycle.remove_job(JOB, &make_config()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DeleteContainer { .. }));
    }

    // -- list_jobs tests --

    #[tokio::test]
    async fn test_list_jobs_maps_containers() {
        let h = harness();
        h.runtime.set_containers(vec![
            ContainerState {
                id: "example-server".to_string(),
                init_process_pid: 1234,
                status: "running".to_string(),
            },
            ContainerState {
                id: "example-worker".to_string(),
                init_process_pid: 0,
                status: STATUS_STOPPED.to_string(),
            },
        ]);

        let jobs = h.lifecycle.list_jobs().await.unwrap();
        assert_eq!(
            jobs,
            vec![
                Job {
                    name: "example-server".to_string(),
                    pid: 1234,
                    status: "running".to_string(),
                },
                Job {
                    name: "example-worker".to_string(),
                    pid: 0,
                    status: STATUS_STOPPED.to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_list_jobs_empty() {
        let h = harness();
        assert!(h.lifecycle.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_jobs_failure() {
        let h = harness();
        h.runtime.fail(RuntimeOp::ListContainers, "runc missing");
        let err = h.lifecycle.list_jobs().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeCall);
    }
}
