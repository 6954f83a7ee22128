use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Clock used for backoff waits, renewal ticks and elapsed-time checks.
/// Swappable so timing behavior can be driven by a controlled clock.
#[async_trait]
pub trait TimeService: Send + Sync {
    async fn sleep(&self, duration: Duration);

    fn now(&self) -> Instant;
}
