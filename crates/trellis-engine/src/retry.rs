use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use trellis_core::config::RetryConfig;
use trellis_core::error::TrellisError;

/// Outcome of a retry request.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    /// Whether the caller may retry. A denial is terminal for this run's
    /// retry policy; the caller must escalate to failure.
    pub allowed: bool,
    /// How long to back off before re-entering the node.
    pub delay: Duration,
    /// 1-based index of this retry within the run.
    pub retry_index: u32,
    /// Human-readable explanation.
    pub reason: String,
}

/// Run-scoped retry budget allocator.
///
/// One shared counter per run, global across all nodes: a pathological
/// single node cannot starve the rest of the run's allowance, and many
/// small node failures drain the same pool. Access to the counter's
/// read-modify-write is serialized; the counter never decrements.
pub struct RetryController {
    config: RetryConfig,
    consumed: Mutex<u32>,
}

impl RetryController {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            consumed: Mutex::new(0),
        }
    }

    /// Rebuild a controller mid-run (resume) with retries already consumed.
    pub fn with_consumed(config: RetryConfig, consumed: u32) -> Self {
        Self {
            config,
            consumed: Mutex::new(consumed),
        }
    }

    /// Total retries consumed so far.
    pub fn total_retries(&self) -> u32 {
        *self.consumed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask for permission to retry after a node failure.
    ///
    /// While the budget holds, each call increments the shared counter and
    /// returns the backoff delay for that retry index. Once the ceiling is
    /// reached every subsequent call is denied.
    pub fn request_retry(&self, node_id: &str, last_error: &TrellisError) -> RetryDecision {
        let mut consumed = self.consumed.lock().unwrap_or_else(|e| e.into_inner());

        if *consumed >= self.config.max_total_retries {
            warn!(
                node_id = %node_id,
                consumed = *consumed,
                ceiling = self.config.max_total_retries,
                "Retry budget exhausted"
            );
            return RetryDecision {
                allowed: false,
                delay: Duration::ZERO,
                retry_index: *consumed,
                reason: format!(
                    "retry budget exhausted ({}/{} consumed), last error at '{}': {}",
                    *consumed, self.config.max_total_retries, node_id, last_error
                ),
            };
        }

        *consumed += 1;
        let index = *consumed;
        let delay = self.backoff(index);

        debug!(
            node_id = %node_id,
            retry_index = index,
            delay_ms = delay.as_millis() as u64,
            "Retry granted"
        );

        RetryDecision {
            allowed: true,
            delay,
            retry_index: index,
            reason: format!(
                "retry {}/{} after error at '{}': {}",
                index, self.config.max_total_retries, node_id, last_error
            ),
        }
    }

    /// Exponential backoff with uniform jitter, floored at zero.
    fn backoff(&self, retry_index: u32) -> Duration {
        let exp = retry_index.saturating_sub(1);
        let base = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exp as i32);
        let capped = base.min(self.config.max_delay_ms as f64);

        // Scale by a uniform factor in [1-jitter, 1+jitter]
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
        let ms = (capped * factor).max(0.0);

        Duration::from_millis(ms as u64)
    }
}
