use crate::domain::errors::{LeaserError, LeaserResult, LockError, LockResult};
use crate::domain::ports::locker::Locker;
use crate::domain::ports::time_service::TimeService;
use crate::infrastructure::runtime::TokioTimeService;
use futures::FutureExt;
use rand::Rng;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Renew once this fraction of the TTL has passed.
pub const DEFAULT_RENEWAL_FACTOR: f64 = 0.7;

/// Wait this multiple of the TTL between acquisition attempts, so a valid
/// holder is never starved by eager competitors.
pub const DEFAULT_WAIT_FACTOR: f64 = 1.1;

/// Upper bound of the random delay before the first acquisition attempt.
pub const DEFAULT_MAX_INITIAL_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialDelay {
    /// Uniformly random in `[0, max)`.
    Random { max: Duration },
    Fixed(Duration),
}

/// What to do when another holder owns the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Wait out the wait period and try to acquire again.
    #[default]
    Retry,
    /// Stop with `LeaserError::Abandoned` as soon as the lock turns out to
    /// be held elsewhere or a held lease is lost.
    Abandon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaserOptions {
    pub renewal_factor: f64,
    pub wait_factor: f64,
    pub initial_delay: InitialDelay,
    pub conflict_policy: ConflictPolicy,
    /// Release the lock and return once the protected function returns
    /// `Ok`. Otherwise the lease is kept and renewed until shutdown.
    pub release_on_completion: bool,
}

impl Default for LeaserOptions {
    fn default() -> Self {
        Self {
            renewal_factor: DEFAULT_RENEWAL_FACTOR,
            wait_factor: DEFAULT_WAIT_FACTOR,
            initial_delay: InitialDelay::Random {
                max: DEFAULT_MAX_INITIAL_DELAY,
            },
            conflict_policy: ConflictPolicy::Retry,
            release_on_completion: false,
        }
    }
}

/// How a holding cycle ended.
#[derive(Debug)]
enum HoldOutcome {
    /// The outer token was canceled.
    Canceled,
    /// The protected function returned `Ok` and the leaser releases on
    /// completion.
    Finished,
    /// The protected function returned an error on its own.
    Failed(anyhow::Error),
    /// A renewal failed; the lease can no longer be assumed.
    LeaseLost(LockError),
}

/// Runs a protected function only while holding a lease on a lock,
/// renewing the lease in the background and releasing it on exit.
///
/// Multiple leasers, usually in different processes, may point at the
/// same lock; the remote service decides which of them holds it.
pub struct LockLeaser {
    id: String,
    locker: Arc<dyn Locker>,
    ttl: Duration,
    renewal_period: Duration,
    wait_period: Duration,
    initial_delay: Duration,
    conflict_policy: ConflictPolicy,
    release_on_completion: bool,
    time_service: Arc<dyn TimeService>,
}

impl LockLeaser {
    /// `ttl` must match the TTL the locker requests from the service.
    pub fn new(
        id: impl Into<String>,
        locker: Arc<dyn Locker>,
        ttl: Duration,
        options: LeaserOptions,
    ) -> Self {
        let initial_delay = match options.initial_delay {
            InitialDelay::Fixed(delay) => delay,
            InitialDelay::Random { max } if max.is_zero() => Duration::ZERO,
            InitialDelay::Random { max } => {
                let upper = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
                Duration::from_nanos(rand::thread_rng().gen_range(0..upper))
            }
        };

        Self {
            id: id.into(),
            locker,
            ttl,
            renewal_period: scale(ttl, options.renewal_factor),
            wait_period: scale(ttl, options.wait_factor),
            initial_delay,
            conflict_policy: options.conflict_policy,
            release_on_completion: options.release_on_completion,
            time_service: TokioTimeService::shared(),
        }
    }

    pub fn with_time_service(mut self, time_service: Arc<dyn TimeService>) -> Self {
        self.time_service = time_service;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn renewal_period(&self) -> Duration {
        self.renewal_period
    }

    pub fn wait_period(&self) -> Duration {
        self.wait_period
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Blocks until `cancel` fires or a terminal error occurs. A release is
    /// attempted on every exit path.
    ///
    /// `protected` is invoked once per held lease with a token that is
    /// canceled when the lease is lost or the leaser shuts down; it must
    /// return promptly once that happens. A protected function that
    /// returns `Ok` leaves the lease held and renewed, unless
    /// `release_on_completion` is set. Returns `Ok(())` for a
    /// caller-initiated shutdown.
    pub async fn start<F, Fut>(&self, cancel: CancellationToken, protected: F) -> LeaserResult<()>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!(
            "Lock leaser {} starting (renewal every {:?}, retry every {:?})",
            self.id, self.renewal_period, self.wait_period
        );

        let result = if self.wait(&cancel, self.initial_delay).await {
            self.run(&cancel, &protected).await
        } else {
            Ok(())
        };

        if let Err(e) = &result {
            error!("Lock leaser {} stopping: {}", self.id, e);
        }

        let release = match self.release().await {
            Some(release) => release,
            None => {
                warn!(
                    "Lock leaser {} gave up releasing after {:?}, the lease expires on its own",
                    self.id, self.ttl
                );
                return result;
            }
        };
        match (result, release) {
            (result, Ok(())) => {
                info!("Lock leaser {} released its lock", self.id);
                result
            }
            (result, Err(e)) if e.is_conflict() => {
                debug!("Lock leaser {} had no lock to release: {}", self.id, e);
                result
            }
            (Ok(()), Err(e)) => {
                warn!("Lock leaser {} failed to release lock: {}", self.id, e);
                Err(LeaserError::Lock(e))
            }
            (Err(primary), Err(e)) => {
                warn!("Lock leaser {} failed to release lock: {}", self.id, e);
                Err(primary.merge(LeaserError::Lock(e)))
            }
        }
    }

    /// Releases with a fresh token, since the caller's token may already be
    /// canceled. Gives up with `None` once a full TTL has passed.
    async fn release(&self) -> Option<LockResult<()>> {
        let token = CancellationToken::new();
        tokio::select! {
            biased;
            release = self.locker.release(&token) => Some(release),
            _ = self.time_service.sleep(self.ttl) => None,
        }
    }

    async fn run<F, Fut>(&self, cancel: &CancellationToken, protected: &F) -> LeaserResult<()>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.locker.acquire(cancel, &self.id).await {
                Err(e) if e.is_canceled() && cancel.is_cancelled() => return Ok(()),
                Err(e) => return Err(LeaserError::Lock(e)),
                Ok(None) => {
                    debug!("Lock leaser {} did not get the lock", self.id);
                    if self.conflict_policy == ConflictPolicy::Abandon {
                        return Err(LeaserError::Abandoned(LockError::Held));
                    }
                }
                Ok(Some(lock_id)) => {
                    info!("Lock leaser {} holds lock {}", self.id, lock_id);

                    match self.hold(cancel, protected).await {
                        HoldOutcome::Canceled => return Ok(()),
                        HoldOutcome::Finished => {
                            info!("Lock leaser {} protected function completed, releasing", self.id);
                            return Ok(());
                        }
                        HoldOutcome::Failed(e) => return Err(LeaserError::Protected(e)),
                        HoldOutcome::LeaseLost(e) => {
                            warn!("Lock leaser {} lost its lease: {}", self.id, e);
                            if self.conflict_policy == ConflictPolicy::Abandon {
                                return Err(LeaserError::Abandoned(e));
                            }
                        }
                    }
                }
            }

            if !self.wait(cancel, self.wait_period).await {
                return Ok(());
            }
        }
    }

    /// Runs the protected function next to the renewal loop until one of
    /// them, or the outer token, ends the cycle. Both tasks have stopped by
    /// the time this returns.
    async fn hold<F, Fut>(&self, cancel: &CancellationToken, protected: &F) -> HoldOutcome
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let lease = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<HoldOutcome>(2);

        let protected_task = {
            let token = lease.clone();
            let tx = tx.clone();
            let work = AssertUnwindSafe(protected(lease.clone())).catch_unwind();
            tokio::spawn(async move {
                let result = work.await;
                if token.is_cancelled() {
                    // Stopped because we asked it to
                    return;
                }
                let outcome = match result {
                    Ok(Ok(())) => HoldOutcome::Finished,
                    Ok(Err(e)) => HoldOutcome::Failed(e),
                    Err(_) => HoldOutcome::Failed(anyhow::anyhow!("protected function panicked")),
                };
                let _ = tx.send(outcome).await;
            })
        };

        let renewal_task = {
            let token = lease.clone();
            let locker = self.locker.clone();
            let time_service = self.time_service.clone();
            let period = self.renewal_period;
            let id = self.id.clone();
            tokio::spawn(async move {
                // Ticks are scheduled from the acquisition, not from the end of
                // the previous renewal
                let mut next_tick = time_service.now() + period;
                loop {
                    let wait = next_tick.saturating_duration_since(time_service.now());
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return,
                        _ = time_service.sleep(wait) => {}
                    }

                    match locker.renew(&token).await {
                        Ok(()) => debug!("Lock leaser {} renewed its lease", id),
                        Err(_) if token.is_cancelled() => return,
                        Err(e) => {
                            let _ = tx.send(HoldOutcome::LeaseLost(e)).await;
                            return;
                        }
                    }

                    next_tick += period;
                    let now = time_service.now();
                    if next_tick <= now {
                        // A renewal overran its slot; delay the schedule
                        next_tick = now + period;
                    }
                }
            })
        };

        let outcome = loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break HoldOutcome::Canceled,
                received = rx.recv() => received,
            };
            match received {
                Some(HoldOutcome::Finished) if !self.release_on_completion => {
                    info!(
                        "Lock leaser {} protected function completed, keeping the lease",
                        self.id
                    );
                }
                Some(outcome) => break outcome,
                None => break HoldOutcome::Canceled,
            }
        };

        // The protected function must observe cancellation and return before
        // anyone tries to take the lock again.
        lease.cancel();
        if let Err(e) = protected_task.await {
            warn!("Lock leaser {} protected task aborted: {}", self.id, e);
        }
        if let Err(e) = renewal_task.await {
            warn!("Lock leaser {} renewal task aborted: {}", self.id, e);
        }

        outcome
    }

    /// Sleeps for `duration` unless `cancel` fires first. Returns `false`
    /// when canceled.
    async fn wait(&self, cancel: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.time_service.sleep(duration) => true,
        }
    }
}

fn scale(ttl: Duration, factor: f64) -> Duration {
    let nanos = (ttl.as_nanos() as f64 * factor).round();
    Duration::from_nanos(nanos.clamp(0.0, u64::MAX as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::domain::errors::LockResult;

    struct NeverLocker;

    #[async_trait::async_trait]
    impl Locker for NeverLocker {
        async fn acquire(
            &self,
            _cancel: &CancellationToken,
            _caller_id: &str,
        ) -> LockResult<Option<String>> {
            Ok(None)
        }

        async fn release(&self, _cancel: &CancellationToken) -> LockResult<()> {
            Err(LockError::NotHeld)
        }

        async fn renew(&self, _cancel: &CancellationToken) -> LockResult<()> {
            Err(LockError::NotHeld)
        }
    }

    #[test]
    fn test_periods_derive_from_ttl() {
        let leaser = LockLeaser::new(
            "worker-1",
            Arc::new(NeverLocker),
            Duration::from_millis(10),
            LeaserOptions::default(),
        );

        assert_eq!(leaser.renewal_period(), Duration::from_millis(7));
        assert_eq!(leaser.wait_period(), Duration::from_millis(11));
        assert!(leaser.initial_delay() < DEFAULT_MAX_INITIAL_DELAY);
    }

    #[test]
    fn test_fixed_and_zero_initial_delay() {
        let fixed = LockLeaser::new(
            "worker-1",
            Arc::new(NeverLocker),
            Duration::from_secs(15),
            LeaserOptions {
                initial_delay: InitialDelay::Fixed(Duration::from_millis(40)),
                ..LeaserOptions::default()
            },
        );
        assert_eq!(fixed.initial_delay(), Duration::from_millis(40));

        let zero = LockLeaser::new(
            "worker-1",
            Arc::new(NeverLocker),
            Duration::from_secs(15),
            LeaserOptions {
                initial_delay: InitialDelay::Random { max: Duration::ZERO },
                ..LeaserOptions::default()
            },
        );
        assert_eq!(zero.initial_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_when_held_elsewhere() {
        let leaser = LockLeaser::new(
            "worker-1",
            Arc::new(NeverLocker),
            Duration::from_secs(1),
            LeaserOptions {
                initial_delay: InitialDelay::Fixed(Duration::ZERO),
                conflict_policy: ConflictPolicy::Abandon,
                ..LeaserOptions::default()
            },
        );

        let result = leaser
            .start(CancellationToken::new(), |_| async { anyhow::Ok(()) })
            .await;
        assert!(matches!(result, Err(LeaserError::Abandoned(LockError::Held))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_turn() {
        let leaser = LockLeaser::new(
            "worker-1",
            Arc::new(NeverLocker),
            Duration::from_secs(1),
            LeaserOptions {
                initial_delay: InitialDelay::Fixed(Duration::ZERO),
                ..LeaserOptions::default()
            },
        );
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        let result = leaser.start(cancel, |_| async { anyhow::Ok(()) }).await;
        assert!(result.is_ok());
    }
}
