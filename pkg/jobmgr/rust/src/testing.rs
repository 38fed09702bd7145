// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! In-memory stand-ins for every collaborator of [`JobLifecycle`]. Each fake
//! records the calls it receives, in order, and can be told to fail.
//!
//! [`JobLifecycle`]: crate::lifecycle::JobLifecycle

use crate::adapter::{Adapter, JobPrerequisites};
use crate::client::{ContainerState, RuntimeClient};
use crate::clock::{Clock, Ticker, Timer};
use crate::config::ProcessConfig;
use crate::spec::ContainerSpec;
use crate::usertools::{User, UserFinder};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `cond` between scheduler yields so spawned tasks get to run.
/// Returns whether the condition was met before giving up.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    cond()
}

// -- users --

#[derive(Debug, Default)]
pub struct FakeUserFinder {
    users: Mutex<HashMap<String, User>>,
    error: Mutex<Option<String>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeUserFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `user` resolvable under its username.
    pub fn with_user(self, user: User) -> Self {
        lock(&self.users).insert(user.username.clone(), user);
        self
    }

    pub fn fail_with(&self, message: &str) {
        *lock(&self.error) = Some(message.to_string());
    }

    pub fn lookups(&self) -> Vec<String> {
        lock(&self.lookups).clone()
    }
}

impl UserFinder for FakeUserFinder {
    fn lookup(&self, username: &str) -> Result<User> {
        lock(&self.lookups).push(username.to_string());
        if let Some(message) = lock(&self.error).as_ref() {
            return Err(anyhow!("{message}"));
        }
        lock(&self.users)
            .get(username)
            .cloned()
            .ok_or_else(|| anyhow!("user {username} not found"))
    }
}

// -- adapter --

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    CreateJobPrerequisites {
        system_root: PathBuf,
        job_name: String,
        process_name: String,
        user: User,
    },
    BuildSpec {
        system_root: PathBuf,
        job_name: String,
        process_name: String,
        user: User,
    },
}

/// Returns a fixed PID directory and spec. The stdout/stderr sinks it hands
/// out write to `/dev/null`.
#[derive(Debug)]
pub struct FakeAdapter {
    pid_dir: PathBuf,
    spec: ContainerSpec,
    prerequisites_error: Mutex<Option<String>>,
    spec_error: Mutex<Option<String>>,
    calls: Mutex<Vec<AdapterCall>>,
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self::new("/pid/dir", ContainerSpec::default())
    }
}

impl FakeAdapter {
    pub fn new(pid_dir: impl Into<PathBuf>, spec: ContainerSpec) -> Self {
        Self {
            pid_dir: pid_dir.into(),
            spec,
            prerequisites_error: Mutex::new(None),
            spec_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_prerequisites(&self, message: &str) {
        *lock(&self.prerequisites_error) = Some(message.to_string());
    }

    pub fn fail_build_spec(&self, message: &str) {
        *lock(&self.spec_error) = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        lock(&self.calls).clone()
    }
}

fn null_sink() -> Result<File> {
    OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null")
}

impl Adapter for FakeAdapter {
    fn create_job_prerequisites(
        &self,
        system_root: &Path,
        job_name: &str,
        config: &ProcessConfig,
        user: &User,
    ) -> Result<JobPrerequisites> {
        lock(&self.calls).push(AdapterCall::CreateJobPrerequisites {
            system_root: system_root.to_path_buf(),
            job_name: job_name.to_string(),
            process_name: config.name.clone(),
            user: user.clone(),
        });
        if let Some(message) = lock(&self.prerequisites_error).as_ref() {
            return Err(anyhow!("{message}"));
        }
        Ok(JobPrerequisites {
            pid_dir: self.pid_dir.clone(),
            stdout: null_sink()?,
            stderr: null_sink()?,
        })
    }

    fn build_spec(
        &self,
        system_root: &Path,
        job_name: &str,
        config: &ProcessConfig,
        user: &User,
    ) -> Result<ContainerSpec> {
        lock(&self.calls).push(AdapterCall::BuildSpec {
            system_root: system_root.to_path_buf(),
            job_name: job_name.to_string(),
            process_name: config.name.clone(),
            user: user.clone(),
        });
        if let Some(message) = lock(&self.spec_error).as_ref() {
            return Err(anyhow!("{message}"));
        }
        Ok(self.spec.clone())
    }
}

// -- runtime --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    CreateBundle,
    RunContainer,
    StopContainer,
    ContainerState,
    DeleteContainer,
    DestroyBundle,
    ListContainers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    CreateBundle {
        bundle_path: PathBuf,
        spec: ContainerSpec,
        user: User,
    },
    RunContainer {
        pid_file: PathBuf,
        bundle_path: PathBuf,
        container_id: String,
    },
    StopContainer {
        container_id: String,
    },
    ContainerState {
        container_id: String,
    },
    DeleteContainer {
        container_id: String,
    },
    DestroyBundle {
        bundle_path: PathBuf,
    },
    ListContainers,
}

impl RuntimeCall {
    pub fn op(&self) -> RuntimeOp {
        match self {
            RuntimeCall::CreateBundle { .. } => RuntimeOp::CreateBundle,
            RuntimeCall::RunContainer { .. } => RuntimeOp::RunContainer,
            RuntimeCall::StopContainer { .. } => RuntimeOp::StopContainer,
            RuntimeCall::ContainerState { .. } => RuntimeOp::ContainerState,
            RuntimeCall::DeleteContainer { .. } => RuntimeOp::DeleteContainer,
            RuntimeCall::DestroyBundle { .. } => RuntimeOp::DestroyBundle,
            RuntimeCall::ListContainers => RuntimeOp::ListContainers,
        }
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    calls: Vec<RuntimeCall>,
    failures: HashMap<RuntimeOp, String>,
    /// Scripted answers to `container_state`, consumed front to back.
    statuses: VecDeque<Result<String, String>>,
    /// Answer once the script is exhausted. `None` means "no such container".
    sticky_status: Option<String>,
    containers: Vec<ContainerState>,
}

#[derive(Debug, Default)]
pub struct FakeRuntimeClient {
    state: Mutex<RuntimeState>,
}

impl FakeRuntimeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail with `message`.
    pub fn fail(&self, op: RuntimeOp, message: &str) {
        lock(&self.state).failures.insert(op, message.to_string());
    }

    /// Queue the status returned by the next unscripted state query.
    pub fn push_status(&self, status: &str) {
        lock(&self.state).statuses.push_back(Ok(status.to_string()));
    }

    /// Queue a failed state query.
    pub fn push_state_error(&self, message: &str) {
        lock(&self.state)
            .statuses
            .push_back(Err(message.to_string()));
    }

    /// Status reported once the queued answers run out.
    pub fn set_status(&self, status: &str) {
        lock(&self.state).sticky_status = Some(status.to_string());
    }

    pub fn set_containers(&self, containers: Vec<ContainerState>) {
        lock(&self.state).containers = containers;
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.state).calls.clone()
    }

    pub fn ops(&self) -> Vec<RuntimeOp> {
        lock(&self.state).calls.iter().map(RuntimeCall::op).collect()
    }

    pub fn count(&self, op: RuntimeOp) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.op() == op)
            .count()
    }

    fn record(&self, call: RuntimeCall) -> Result<()> {
        let mut state = lock(&self.state);
        let op = call.op();
        state.calls.push(call);
        match state.failures.get(&op) {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntimeClient {
    async fn create_bundle(
        &self,
        bundle_path: &Path,
        spec: &ContainerSpec,
        user: &User,
    ) -> Result<()> {
        self.record(RuntimeCall::CreateBundle {
            bundle_path: bundle_path.to_path_buf(),
            spec: spec.clone(),
            user: user.clone(),
        })
    }

    async fn run_container(
        &self,
        pid_file: &Path,
        bundle_path: &Path,
        container_id: &str,
        _stdout: File,
        _stderr: File,
    ) -> Result<()> {
        self.record(RuntimeCall::RunContainer {
            pid_file: pid_file.to_path_buf(),
            bundle_path: bundle_path.to_path_buf(),
            container_id: container_id.to_string(),
        })
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.record(RuntimeCall::StopContainer {
            container_id: container_id.to_string(),
        })
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        self.record(RuntimeCall::ContainerState {
            container_id: container_id.to_string(),
        })?;

        let mut state = lock(&self.state);
        let status = match state.statuses.pop_front() {
            Some(scripted) => scripted.map_err(|message| anyhow!("{message}"))?,
            None => state
                .sticky_status
                .clone()
                .ok_or_else(|| anyhow!("container {container_id} does not exist"))?,
        };
        Ok(ContainerState {
            id: container_id.to_string(),
            init_process_pid: 0,
            status,
        })
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        self.record(RuntimeCall::DeleteContainer {
            container_id: container_id.to_string(),
        })
    }

    async fn destroy_bundle(&self, bundle_path: &Path) -> Result<()> {
        self.record(RuntimeCall::DestroyBundle {
            bundle_path: bundle_path.to_path_buf(),
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerState>> {
        self.record(RuntimeCall::ListContainers)?;
        Ok(lock(&self.state).containers.clone())
    }
}

// -- clock --

#[derive(Debug)]
struct ClockInner {
    now: watch::Sender<Duration>,
    watchers: AtomicUsize,
}

/// Keeps [`FakeClock::watcher_count`] accurate for as long as a timer or
/// ticker is alive.
struct WatcherGuard(Arc<ClockInner>);

impl WatcherGuard {
    fn new(inner: &Arc<ClockInner>) -> Self {
        inner.watchers.fetch_add(1, Ordering::SeqCst);
        Self(inner.clone())
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.0.watchers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A clock that only moves when [`FakeClock::advance`] is called.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<ClockInner>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    pub fn new() -> Self {
        let (now, _) = watch::channel(Duration::ZERO);
        Self {
            inner: Arc::new(ClockInner {
                now,
                watchers: AtomicUsize::new(0),
            }),
        }
    }

    /// Time elapsed since the clock was created.
    pub fn now(&self) -> Duration {
        *self.inner.now.borrow()
    }

    pub fn advance(&self, by: Duration) {
        self.inner.now.send_modify(|now| *now += by);
    }

    /// Number of live timers and tickers created from this clock.
    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.load(Ordering::SeqCst)
    }
}

impl Clock for FakeClock {
    fn timer(&self, duration: Duration) -> Timer {
        let guard = WatcherGuard::new(&self.inner);
        let mut rx = self.inner.now.subscribe();
        let deadline = *rx.borrow() + duration;
        Box::pin(async move {
            let _guard = guard;
            loop {
                if *rx.borrow_and_update() >= deadline {
                    return;
                }
                // The sender lives in the guard's Arc, so this cannot close.
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    fn ticker(&self, interval: Duration) -> Box<dyn Ticker> {
        let guard = WatcherGuard::new(&self.inner);
        let rx = self.inner.now.subscribe();
        let next = *rx.borrow() + interval;
        Box::new(FakeTicker {
            rx,
            interval,
            next,
            _guard: guard,
        })
    }
}

struct FakeTicker {
    rx: watch::Receiver<Duration>,
    interval: Duration,
    next: Duration,
    _guard: WatcherGuard,
}

#[async_trait]
impl Ticker for FakeTicker {
    async fn tick(&mut self) {
        loop {
            let now = *self.rx.borrow_and_update();
            if now >= self.next {
                while self.next <= now && !self.interval.is_zero() {
                    self.next += self.interval;
                }
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
