//! Restart wrapper.
//!
//! [`Restart`] decorates any [`Runner`] with a [`RestartPolicy`]. It owns the
//! retry loop, so callers see one long-running `run` regardless of how many
//! attempts happen underneath.
//!
//! ```text
//! loop {
//!   ├─► attempt += 1
//!   ├─► inner.run()
//!   ├─► closed?                    ─► return Ok
//!   ├─► Once                       ─► return result
//!   ├─► UntilSuccess and Ok        ─► return Ok
//!   ├─► wait backoff.next(attempt) (cancellable by close)
//!   └─► inner.open()
//! }
//! ```

use crate::error::Result;
use crate::events::EventSink;
use crate::runner::Runner;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// When to start the inner runner again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart after every exit, successful or not, until closed.
    Forever,
    /// Run exactly once.
    Once,
    /// Restart after failures until one attempt succeeds.
    UntilSuccess,
}

/// Delay growth between restarts.
///
/// The delay for attempt `n` (0-indexed) is `first × factor^n`, capped at
/// `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// 1s doubling up to 30s.
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Runner decorator applying a [`RestartPolicy`].
pub struct Restart {
    inner: Box<dyn Runner>,
    policy: RestartPolicy,
    backoff: Option<BackoffPolicy>,
    stop: CancellationToken,
    attempts: AtomicU32,
}

impl Restart {
    pub fn new(inner: Box<dyn Runner>, policy: RestartPolicy) -> Self {
        Self {
            inner,
            policy,
            backoff: None,
            stop: CancellationToken::new(),
            attempts: AtomicU32::new(0),
        }
    }

    /// Wait between attempts. Without a backoff policy the next attempt
    /// starts as soon as the previous one returned.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Sleep before the next attempt. Returns false when closed meanwhile.
    async fn pause(&self, attempt: u32) -> bool {
        let delay = self
            .backoff
            .map(|b| b.next(attempt.saturating_sub(1)))
            .unwrap_or_default();

        if delay.is_zero() {
            tokio::task::yield_now().await;
            return !self.stop.is_cancelled();
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.stop.is_cancelled(),
            _ = self.stop.cancelled() => false,
        }
    }
}

#[async_trait]
impl Runner for Restart {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn open(&self) -> Result<()> {
        self.inner.open().await
    }

    async fn run(&self, events: &EventSink) -> Result<()> {
        let id = self.inner.id();

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let result = self.inner.run(events).await;

            if self.stop.is_cancelled() {
                return Ok(());
            }

            match (self.policy, &result) {
                (RestartPolicy::Once, _) => return result,
                (RestartPolicy::UntilSuccess, Ok(())) => return Ok(()),
                (_, Err(e)) => {
                    warn!(service = %id, attempt = attempt, error = %e, "Runner failed, restarting");
                    events.running(format!("Failed: {}, restarting", e));
                }
                (RestartPolicy::Forever, Ok(())) => {
                    info!(service = %id, attempt = attempt, "Runner exited, restarting");
                    events.running("Exited, restarting");
                }
            }

            if !self.pause(attempt).await {
                return Ok(());
            }

            if let Err(e) = self.inner.open().await {
                warn!(service = %id, error = %e, "Failed to reopen runner");
                if self.policy == RestartPolicy::Once {
                    return Err(e);
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.stop.cancel();
        self.inner.close().await
    }
}
