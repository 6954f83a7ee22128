use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use varlock::domain::errors::{ClientError, LockError, LockResult};
use varlock::Locker;

struct Lease {
    id: String,
    caller: String,
    expires_at: Instant,
}

#[derive(Default)]
struct ServiceState {
    holder: Option<Lease>,
    blocked_until: Option<Instant>,
    next_id: u64,
}

impl ServiceState {
    fn expire(&mut self, now: Instant, lock_delay: Duration) {
        if let Some(lease) = &self.holder {
            if now >= lease.expires_at {
                self.blocked_until = Some(lease.expires_at + lock_delay);
                self.holder = None;
            }
        }
    }
}

/// In-process stand-in for the variable service's lock semantics: a single
/// lock with TTL expiry and a lock delay after expiry.
pub struct InMemoryLockService {
    state: Mutex<ServiceState>,
    ttl: Duration,
    lock_delay: Duration,
    fail_acquire: AtomicBool,
    fail_release: AtomicBool,
    hang_release: AtomicBool,
    renew_latency: Mutex<Duration>,
}

impl InMemoryLockService {
    pub fn new(ttl: Duration, lock_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServiceState::default()),
            ttl,
            lock_delay,
            fail_acquire: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
            hang_release: AtomicBool::new(false),
            renew_latency: Mutex::new(Duration::ZERO),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn locker(self: &Arc<Self>) -> Arc<InMemoryLocker> {
        Arc::new(InMemoryLocker {
            service: self.clone(),
            lock_id: Mutex::new(None),
            acquires: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    /// Caller id of the current holder.
    pub fn holder(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.expire(Instant::now(), self.lock_delay);
        state.holder.as_ref().map(|lease| lease.caller.clone())
    }

    /// Drops the current lease as if its TTL had elapsed.
    pub fn expire_now(&self) {
        let mut state = self.state.lock().unwrap();
        if state.holder.take().is_some() {
            state.blocked_until = Some(Instant::now() + self.lock_delay);
        }
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Makes release calls wait forever, as if the service never answered.
    pub fn hang_release(&self, hang: bool) {
        self.hang_release.store(hang, Ordering::SeqCst);
    }

    /// Time each renewal spends "on the wire" before it reaches the lock.
    pub fn set_renew_latency(&self, latency: Duration) {
        *self.renew_latency.lock().unwrap() = latency;
    }
}

pub struct InMemoryLocker {
    service: Arc<InMemoryLockService>,
    lock_id: Mutex<Option<String>>,
    acquires: AtomicUsize,
    renewals: AtomicUsize,
    releases: AtomicUsize,
}

impl InMemoryLocker {
    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn acquire(
        &self,
        _cancel: &CancellationToken,
        caller_id: &str,
    ) -> LockResult<Option<String>> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.service.fail_acquire.load(Ordering::SeqCst) {
            return Err(LockError::Client(ClientError::transport("connection refused")));
        }

        let now = Instant::now();
        let mut state = self.service.state.lock().unwrap();
        state.expire(now, self.service.lock_delay);

        if state.holder.is_some() {
            return Ok(None);
        }
        if state.blocked_until.map_or(false, |until| now < until) {
            return Ok(None);
        }

        state.next_id += 1;
        let id = format!("lock-{}", state.next_id);
        state.holder = Some(Lease {
            id: id.clone(),
            caller: caller_id.to_string(),
            expires_at: now + self.service.ttl,
        });
        *self.lock_id.lock().unwrap() = Some(id.clone());
        Ok(Some(id))
    }

    async fn release(&self, _cancel: &CancellationToken) -> LockResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.service.fail_release.load(Ordering::SeqCst) {
            return Err(LockError::Client(ClientError::transport("connection reset")));
        }
        if self.service.hang_release.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let mine = self.lock_id.lock().unwrap().take().ok_or(LockError::NotHeld)?;
        let mut state = self.service.state.lock().unwrap();
        match &state.holder {
            Some(lease) if lease.id == mine => {
                state.holder = None;
                Ok(())
            }
            _ => Err(LockError::Conflict),
        }
    }

    async fn renew(&self, _cancel: &CancellationToken) -> LockResult<()> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        let latency = *self.service.renew_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let now = Instant::now();
        let mut lock_id = self.lock_id.lock().unwrap();
        let mine = lock_id.clone().ok_or(LockError::NotHeld)?;

        let mut state = self.service.state.lock().unwrap();
        state.expire(now, self.service.lock_delay);
        match state.holder.as_mut() {
            Some(lease) if lease.id == mine => {
                lease.expires_at = now + self.service.ttl;
                Ok(())
            }
            _ => {
                *lock_id = None;
                Err(LockError::Conflict)
            }
        }
    }
}
