#![forbid(unsafe_code)]

//! Randomised waits between playlist items and between retry attempts.
//!
//! Both are the same primitive: pick a duration uniformly from a
//! [`WaitWindow`] and sleep, unless the operator interrupts first. The retry
//! backoff simply scales its window by the attempt number.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Interrupted;

/// Backoff window for the first retry; later retries scale it linearly.
pub const DEFAULT_BACKOFF: WaitWindow = WaitWindow {
    min: Duration::from_secs(2),
    max: Duration::from_secs(3),
};

/// Inclusive `[min, max]` range a wait is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitWindow {
    pub min: Duration,
    pub max: Duration,
}

impl WaitWindow {
    pub fn new(min: Duration, max: Duration) -> Result<Self> {
        if max < min {
            bail!(
                "maximum delay ({}s) is shorter than the minimum ({}s)",
                max.as_secs_f64(),
                min.as_secs_f64()
            );
        }
        Ok(Self { min, max })
    }

    /// Builds the inter-item window from the `--delay` / `--max-delay` pair.
    /// Returns `None` when neither bound was given.
    pub fn from_bounds(min_seconds: Option<u64>, max_seconds: Option<u64>) -> Result<Option<Self>> {
        match (min_seconds, max_seconds) {
            (None, None) => Ok(None),
            (Some(min), None) => Ok(Some(Self::fixed(Duration::from_secs(min)))),
            (None, Some(max)) => Self::new(Duration::ZERO, Duration::from_secs(max)).map(Some),
            (Some(min), Some(max)) => {
                Self::new(Duration::from_secs(min), Duration::from_secs(max)).map(Some)
            }
        }
    }

    pub const fn fixed(duration: Duration) -> Self {
        Self {
            min: duration,
            max: duration,
        }
    }

    /// Draws a duration uniformly from the window (millisecond resolution).
    pub fn pick(&self) -> Duration {
        let min_ms = u64::try_from(self.min.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        if max_ms <= min_ms {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
    }

    pub fn scaled(&self, factor: u32) -> Self {
        let factor = factor.max(1);
        Self {
            min: self.min.saturating_mul(factor),
            max: self.max.saturating_mul(factor),
        }
    }
}

/// The only suspension primitive the scheduler uses. Tests swap it for one
/// that records durations instead of sleeping.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Paces a batch. Owns the run's cancellation token so every wait can be cut
/// short by Ctrl-C.
pub struct DelayScheduler {
    between_items: Option<WaitWindow>,
    backoff: WaitWindow,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
}

impl DelayScheduler {
    pub fn new(
        between_items: Option<WaitWindow>,
        backoff: WaitWindow,
        sleeper: Arc<dyn Sleeper>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            between_items,
            backoff,
            sleeper,
            cancel,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Waits a random duration from the inter-item window, if one is set.
    pub async fn wait_between_items(&self) -> Result<Duration, Interrupted> {
        match self.between_items {
            Some(window) => self.wait(window, "between items").await,
            None => Ok(Duration::ZERO),
        }
    }

    /// Waits before retry number `attempt + 1`. The window grows with the
    /// attempt number so repeated throttling backs off further each time.
    pub async fn wait_backoff(&self, attempt: u32) -> Result<Duration, Interrupted> {
        self.wait(self.backoff.scaled(attempt), "retry backoff").await
    }

    async fn wait(&self, window: WaitWindow, reason: &str) -> Result<Duration, Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted);
        }
        let duration = window.pick();
        if duration.is_zero() {
            return Ok(duration);
        }
        debug!(delay_ms = duration.as_millis() as u64, reason, "pausing");
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupted),
            _ = self.sleeper.sleep(duration) => Ok(duration),
        }
    }
}
