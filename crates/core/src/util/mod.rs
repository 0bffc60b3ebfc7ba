pub mod retry;

pub use retry::{retry_with_backoff, RetryConfig, RetryExhausted};

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        assert!(sleep_or_cancel(Duration::from_secs(3), &cancel).await);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
