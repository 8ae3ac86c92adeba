//! Bounded retry-with-reconnect.
//!
//! Connection-oriented calls get a small fixed budget. Every attempt after the
//! first runs on a freshly established session, and only the exhausted budget
//! surfaces as a single transport error.

use std::future::Future;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{PluginError, Result};
use crate::ratelimit::RateLimiter;

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;

/// Something that can throw away its connection and establish a new one.
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn reconnect(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }

    /// Runs `operation`, reconnecting `session` before each retry.
    ///
    /// Only [`PluginError::Transport`] is retried; anything else returns at once.
    pub async fn run<S, F, Fut, T>(&self, session: &S, mut operation: F) -> Result<T>
    where
        S: Reconnect + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                if let Err(err) = session.reconnect().await {
                    warn!(attempt, error = %err, "reconnect failed");
                    last_error = err.to_string();
                    continue;
                }
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(PluginError::Transport(message)) => {
                    debug!(
                        attempt,
                        attempts,
                        error = %message,
                        "transport failure, will reconnect"
                    );
                    last_error = message;
                }
                Err(err) => return Err(err),
            }
        }

        warn!(attempts, error = %last_error, "retry budget exhausted");
        Err(PluginError::transport(format!(
            "gave up after {attempts} attempts: {last_error}"
        )))
    }

    /// Like [`ReconnectPolicy::run`], but every attempt, retries included, is
    /// admitted by `limiter` under `key` before it is sent.
    pub async fn run_limited<S, F, Fut, T>(
        &self,
        session: &S,
        limiter: &RateLimiter,
        key: &str,
        mut operation: F,
    ) -> Result<T>
    where
        S: Reconnect + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(session, || {
            let attempt = operation();
            async move {
                limiter.wait(key).await;
                attempt.await
            }
        })
        .await
    }
}
