use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use varlock::domain::ports::time_service::TimeService;

/// Tokio-backed clock that remembers every sleep it was asked for.
#[derive(Default)]
pub struct RecordingTimeService {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingTimeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl TimeService for RecordingTimeService {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}
