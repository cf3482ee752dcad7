//! Retry policy between tunnel connection attempts
//!
//! The default waits a fixed 5 seconds between attempts. A multiplier above
//! 1.0 turns it into capped exponential backoff.

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay before reconnecting after a failed or finished session
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Growth factor applied after each wait
    pub multiplier: f64,
    /// Maximum number of retries (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_DELAY)
    }
}

impl ReconnectConfig {
    /// Same delay before every retry
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Doubling delay starting at `initial`, capped at `max`
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial_backoff: initial,
            max_backoff: max,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Tracks the current delay and attempt count
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current delay, then grow it
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current_backoff, self.attempt
        );

        sleep(self.current_backoff).await;

        let next_backoff = self
            .current_backoff
            .mul_f64(self.config.multiplier.max(1.0));
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// [`wait`](Self::wait), cut short by `cancel`
    pub async fn wait_or_cancel(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), ReconnectError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            result = self.wait() => result,
        }
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_default_is_fixed_five_seconds() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());

        for attempt in 1..=3 {
            let start = Instant::now();
            manager.wait().await.unwrap();
            assert_eq!(start.elapsed(), Duration::from_secs(5));
            assert_eq!(manager.attempt(), attempt);
            assert_eq!(manager.current_backoff(), Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_caps() {
        let mut manager = ReconnectManager::new(ReconnectConfig::exponential(
            Duration::from_millis(10),
            Duration::from_millis(50),
        ));

        let mut seen = Vec::new();
        for _ in 0..4 {
            manager.wait().await.unwrap();
            seen.push(manager.current_backoff());
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(50),
                Duration::from_millis(50),
            ]
        );

        manager.reset();
        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.current_backoff(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts() {
        let mut manager = ReconnectManager::new(ReconnectConfig {
            max_attempts: Some(2),
            ..ReconnectConfig::fixed(Duration::from_millis(1))
        });

        assert!(manager.wait().await.is_ok());
        assert!(manager.wait().await.is_ok());
        assert!(matches!(
            manager.wait().await,
            Err(ReconnectError::MaxAttemptsReached)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = Instant::now();
        assert!(matches!(
            manager.wait_or_cancel(&cancel).await,
            Err(ReconnectError::Cancelled)
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
