// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Time source for the stop loop. Production code uses [`TokioClock`]; tests
//! inject a fake that only moves when told to.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Resolves once, after the timer's duration has elapsed.
pub type Timer = Pin<Box<dyn Future<Output = ()> + Send>>;

#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick. The first tick arrives one interval after the
    /// ticker was created. Ticks missed while nobody was waiting collapse
    /// into one.
    async fn tick(&mut self);
}

pub trait Clock: Send + Sync {
    fn timer(&self, duration: Duration) -> Timer;
    fn ticker(&self, interval: Duration) -> Box<dyn Ticker>;
}

/// Wall-clock time via the tokio timer wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn timer(&self, duration: Duration) -> Timer {
        Box::pin(tokio::time::sleep(duration))
    }

    fn ticker(&self, interval: Duration) -> Box<dyn Ticker> {
        let mut inner = tokio::time::interval_at(Instant::now() + interval, interval);
        inner.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Box::new(TokioTicker(inner))
    }
}

struct TokioTicker(Interval);

#[async_trait]
impl Ticker for TokioTicker {
    async fn tick(&mut self) {
        self.0.tick().await;
    }
}
