// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of one lifecycle step. Each variant names the step that failed so
/// callers can map it to an exit code without string matching.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("failed to look up user {username}")]
    UserLookup {
        username: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{container_id}] failed to create job prerequisites")]
    Prerequisites {
        container_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{container_id}] failed to build container spec")]
    BuildSpec {
        container_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{container_id}] failed to create bundle at {}", bundle_path.display())]
    CreateBundle {
        container_id: String,
        bundle_path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{container_id}] failed to destroy bundle at {}", bundle_path.display())]
    DestroyBundle {
        container_id: String,
        bundle_path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{container_id}] failed to run container")]
    RunContainer {
        container_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{container_id}] failed to stop container")]
    StopContainer {
        container_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("[{container_id}] failed to delete container")]
    DeleteContainer {
        container_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to list containers")]
    ListContainers {
        #[source]
        source: anyhow::Error,
    },

    /// The exit timeout elapsed before the container reported `stopped`.
    /// Callers escalate by removing the job.
    #[error("[{container_id}] timed out waiting for container to stop")]
    Timeout { container_id: String },
}

/// Coarse classification of a [`LifecycleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Resolution,
    Prerequisite,
    Spec,
    Bundle,
    RuntimeCall,
    Timeout,
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::UserLookup { .. } => ErrorKind::Resolution,
            LifecycleError::Prerequisites { .. } => ErrorKind::Prerequisite,
            LifecycleError::BuildSpec { .. } => ErrorKind::Spec,
            LifecycleError::CreateBundle { .. } | LifecycleError::DestroyBundle { .. } => {
                ErrorKind::Bundle
            }
            LifecycleError::RunContainer { .. }
            | LifecycleError::StopContainer { .. }
            | LifecycleError::DeleteContainer { .. }
            | LifecycleError::ListContainers { .. } => ErrorKind::RuntimeCall,
            LifecycleError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Resolution => write!(f, "resolution"),
            ErrorKind::Prerequisite => write!(f, "prerequisite"),
            ErrorKind::Spec => write!(f, "spec"),
            ErrorKind::Bundle => write!(f, "bundle"),
            ErrorKind::RuntimeCall => write!(f, "runtime call"),
            ErrorKind::Timeout => write!(f, "timeout"),
        }
    }
}
