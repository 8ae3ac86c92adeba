//! Keyed sliding-window rate limiter for outbound vendor calls.
//!
//! Each configured key keeps a log of admission instants behind its own mutex,
//! so unrelated endpoints never contend. The log only changes when a caller is
//! admitted; a waiter dropped mid-sleep leaves nothing behind.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PluginError, Result};

/// At most `limit` admissions within any `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub limit: u32,
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl LimitConfig {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub const fn per_second(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

struct KeyWindow {
    config: LimitConfig,
    admitted: Mutex<VecDeque<Instant>>,
}

impl KeyWindow {
    /// Admits the caller or returns the instant at which a slot frees up.
    fn try_acquire(&self, now: Instant) -> std::result::Result<(), Option<Instant>> {
        if self.config.limit == 0 {
            return Err(None);
        }
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());

        while let Some(&oldest) = admitted.front() {
            if now.duration_since(oldest) >= self.config.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() < self.config.limit as usize {
            admitted.push_back(now);
            return Ok(());
        }
        Err(admitted.front().map(|oldest| *oldest + self.config.window))
    }
}

/// Per-adapter limiter built from a static key map.
#[derive(Default)]
pub struct RateLimiter {
    windows: HashMap<String, KeyWindow>,
}

impl RateLimiter {
    pub fn new<I, K>(configs: I) -> Self
    where
        I: IntoIterator<Item = (K, LimitConfig)>,
        K: Into<String>,
    {
        let windows = configs
            .into_iter()
            .map(|(key, config)| {
                (
                    key.into(),
                    KeyWindow {
                        config,
                        admitted: Mutex::new(VecDeque::with_capacity(config.limit as usize)),
                    },
                )
            })
            .collect();
        Self { windows }
    }

    /// A limiter with no configured keys; every wait is a no-op.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn config(&self, key: &str) -> Option<LimitConfig> {
        self.windows.get(key).map(|window| window.config)
    }

    /// Blocks until `key` has a free slot. Unknown keys return immediately.
    pub async fn wait(&self, key: &str) {
        let cancel = CancellationToken::new();
        // An uncancelled token never fires, so the only exit is admission.
        let _ = self.wait_cancellable(key, &cancel).await;
    }

    /// Like [`RateLimiter::wait`] but gives up with [`PluginError::Cancelled`]
    /// once `cancel` fires.
    pub async fn wait_cancellable(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(window) = self.windows.get(key) else {
            return Ok(());
        };

        let started = Instant::now();
        let mut deferred = false;
        let mut warned = false;

        loop {
            let now = Instant::now();
            let retry_at = match window.try_acquire(now) {
                Ok(()) => break,
                Err(retry_at) => retry_at,
            };

            if !deferred {
                deferred = true;
                counter!("plugins_ratelimit_wait_total", "key" => key.to_string()).increment(1);
                debug!(
                    key,
                    limit = window.config.limit,
                    window_ms = window.config.window.as_millis() as u64,
                    "rate limit reached, waiting"
                );
            }

            let sleep_until = match retry_at {
                Some(at) => at,
                None => {
                    if !warned {
                        warned = true;
                        warn!(
                            key,
                            "rate limit configured with zero admissions; waiting until cancelled"
                        );
                    }
                    cancel.cancelled().await;
                    return Err(PluginError::Cancelled);
                }
            };

            if !warned && now.duration_since(started) > window.config.window * 2 {
                warned = true;
                warn!(
                    key,
                    waited_ms = now.duration_since(started).as_millis() as u64,
                    "rate limit wait exceeds twice the window"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(key, "rate limit wait cancelled");
                    return Err(PluginError::Cancelled);
                }
                _ = tokio::time::sleep_until(sleep_until) => {}
            }
        }

        let waited = started.elapsed();
        counter!("plugins_ratelimit_admitted_total", "key" => key.to_string()).increment(1);
        if deferred {
            histogram!("plugins_ratelimit_wait_seconds", "key" => key.to_string())
                .record(waited.as_secs_f64());
        }
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self
            .windows
            .iter()
            .map(|(key, window)| (key.as_str(), window.config))
            .collect();
        keys.sort_by(|a, b| a.0.cmp(b.0));
        f.debug_struct("RateLimiter").field("keys", &keys).finish()
    }
}
