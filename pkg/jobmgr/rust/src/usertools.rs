// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Result, anyhow};
use log::debug;
use serde::{Deserialize, Serialize};

/// Unprivileged account every non-privileged process runs as.
pub const VCAP_USER: &str = "vcap";

/// The identity a container's init process runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
}

impl User {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            username: "root".to_string(),
        }
    }
}

pub trait UserFinder: Send + Sync {
    fn lookup(&self, username: &str) -> Result<User>;
}

/// Resolves users from the host's passwd database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUserFinder;

impl UserFinder for SystemUserFinder {
    fn lookup(&self, username: &str) -> Result<User> {
        let user = uzers::get_user_by_name(username)
            .ok_or_else(|| anyhow!("user {username} not found"))?;
        debug!(
            "resolved user {username} (uid={}, gid={})",
            user.uid(),
            user.primary_group_id()
        );
        Ok(User {
            uid: user.uid(),
            gid: user.primary_group_id(),
            username: username.to_string(),
        })
    }
}
