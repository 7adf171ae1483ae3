//! Fixed back-off between broker attempts

use crate::error::{OffloadError, RetryClass};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry configuration shared by acceptors and DNS sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Wait after the broker refused the TCP connection
    #[serde(with = "duration_secs", default = "default_refused_backoff")]
    pub refused_backoff: Duration,
    /// Wait after the broker closed a control connection early
    #[serde(with = "duration_secs", default = "default_eof_backoff")]
    pub eof_backoff: Duration,
    /// Consecutive retryable failures tolerated (None = unlimited)
    #[serde(default)]
    pub max_attempts: Option<usize>,
}

fn default_refused_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_eof_backoff() -> Duration {
    Duration::from_secs(1)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            refused_backoff: default_refused_backoff(),
            eof_backoff: default_eof_backoff(),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Back-off for a retryable class, `None` for fatal errors
    pub fn delay_for(&self, class: RetryClass) -> Option<Duration> {
        match class {
            RetryClass::Refused => Some(self.refused_backoff),
            RetryClass::EndOfStream => Some(self.eof_backoff),
            RetryClass::Fatal => None,
        }
    }
}

/// Outcome of waiting before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Tracks consecutive retryable failures for one acceptor or session
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Sleep for the delay matching `class`, or until `cancel` fires.
    ///
    /// Fails with `RetriesExhausted` once `max_attempts` consecutive waits
    /// have been taken.
    pub async fn wait(
        &mut self,
        class: RetryClass,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, OffloadError> {
        let Some(delay) = self.policy.delay_for(class) else {
            return Ok(WaitOutcome::Elapsed);
        };

        self.attempt += 1;
        if let Some(max_attempts) = self.policy.max_attempts {
            if self.attempt > max_attempts {
                return Err(OffloadError::RetriesExhausted(max_attempts));
            }
        }

        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting before next broker attempt"
        );

        tokio::select! {
            _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(WaitOutcome::Elapsed),
        }
    }

    /// Call after a broker exchange succeeded
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// Serialize Durations as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
