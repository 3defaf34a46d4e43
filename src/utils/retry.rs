use anyhow::{Result, anyhow};
use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{error, warn};

use crate::utils::strip_html;

/// Backoff settings for store setup calls (dataset and table creation).
/// Block writes are never retried here; redelivery by the feed is their only retry.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            exponential: 2.0,
        }
    }
}

impl RetryConfig {
    // Full jitter: the next delay is uniform in [0, delay * exponential), capped
    fn next_delay(&self, delay: u64) -> u64 {
        let ceiling = delay as f64 * self.exponential;
        std::cmp::min(self.max_delay_ms, (fastrand::f64() * ceiling) as u64)
    }
}

/// Run `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or `config.max_attempts` is reached.
pub async fn retry<F, Fut, T, E, P>(
    operation: F,
    is_transient: P,
    config: &RetryConfig,
    context: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;
    let mut delay = config.base_delay_ms;

    loop {
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        let message = strip_html(&e.to_string());

        if !is_transient(&e) {
            error!("Operation '{}' failed with a permanent error: {}", context, message);
            return Err(anyhow!(message).context(format!("'{context}' failed on attempt {attempt}")));
        }

        if attempt >= config.max_attempts {
            error!(
                "Operation '{}' failed after {} attempts. Final error: {}",
                context, attempt, message
            );
            return Err(anyhow!(message).context(format!("Failed after {attempt} attempts")));
        }

        warn!(
            "Attempt {}/{} for '{}' failed: {}. Retrying in {}ms...",
            attempt, config.max_attempts, context, message, delay
        );

        sleep(Duration::from_millis(delay)).await;
        delay = config.next_delay(delay);
        attempt += 1;
    }
}
