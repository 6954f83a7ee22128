use crate::domain::entities::{
    Variable, VariableLock, VariableMetadata, DEFAULT_LOCK_DELAY, DEFAULT_LOCK_TTL,
};
use crate::domain::errors::{ClientError, LockError, LockResult};
use crate::domain::ports::locker::Locker;
use crate::infrastructure::http::retry::RetryClient;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const OP_ACQUIRE: &str = "lock-acquire";
const OP_RENEW: &str = "lock-renew";
const OP_RELEASE: &str = "lock-release";

/// Lock over a single variable path, backed by the variable service's
/// `lock-acquire`, `lock-renew` and `lock-release` writes.
pub struct Locks {
    client: RetryClient,
    variable: Mutex<Variable>,
    ttl: Duration,
}

impl Locks {
    /// Validates the lock settings carried by `variable`, filling in the
    /// default TTL and lock delay where they are missing.
    pub fn new(client: RetryClient, mut variable: Variable) -> LockResult<Self> {
        if variable.path.trim_matches('/').is_empty() {
            return Err(LockError::InvalidConfig(
                "variable path must not be empty".to_string(),
            ));
        }

        let defaults = VariableLock::new(DEFAULT_LOCK_TTL, DEFAULT_LOCK_DELAY);
        let mut lock = variable.lock.take().unwrap_or_else(|| defaults.clone());
        if lock.ttl.is_empty() {
            lock.ttl = defaults.ttl;
        }
        if lock.lock_delay.is_empty() {
            lock.lock_delay = defaults.lock_delay;
        }

        let ttl = lock
            .ttl()
            .map_err(|e| LockError::InvalidConfig(format!("invalid TTL: {}", e)))?;
        if ttl.is_zero() {
            return Err(LockError::InvalidConfig(
                "TTL must be greater than 0".to_string(),
            ));
        }
        lock.lock_delay()
            .map_err(|e| LockError::InvalidConfig(format!("invalid lock delay: {}", e)))?;

        // Any id supplied by the caller is stale; the service assigns one.
        lock.id.clear();
        variable.lock = Some(lock);

        Ok(Self {
            client,
            variable: Mutex::new(variable),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Local copy of the variable, including the lock id once acquired.
    pub async fn variable(&self) -> Variable {
        self.variable.lock().await.clone()
    }

    fn endpoint(path: &str, op: &str) -> String {
        format!("/v1/var/{}?{}", path.trim_start_matches('/'), op)
    }
}

fn encode(variable: &Variable) -> LockResult<Value> {
    Ok(serde_json::to_value(variable).map_err(ClientError::from)?)
}

#[async_trait]
impl Locker for Locks {
    async fn acquire(
        &self,
        cancel: &CancellationToken,
        caller_id: &str,
    ) -> LockResult<Option<String>> {
        let mut variable = self.variable.lock().await;
        let endpoint = Self::endpoint(&variable.path, OP_ACQUIRE);
        let body = encode(&variable)?;

        let (_, response) = match self.client.retry_put(cancel, &endpoint, &body).await {
            Ok(result) => result,
            Err(e) if e.is_conflict() => {
                debug!("Lock {} is held by another holder ({})", variable.path, caller_id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let acquired: Variable = serde_json::from_value(response)
            .map_err(ClientError::from)?;
        let lock_id = acquired
            .lock_id()
            .map(str::to_string)
            .ok_or(LockError::MissingLockId)?;

        // Keep our requested TTL and delay if the response omits them
        let mut lock = acquired.lock.clone().unwrap_or_default();
        let requested = variable.lock.clone().unwrap_or_default();
        if lock.ttl.is_empty() {
            lock.ttl = requested.ttl;
        }
        if lock.lock_delay.is_empty() {
            lock.lock_delay = requested.lock_delay;
        }

        if !acquired.path.is_empty() {
            variable.path = acquired.path;
        }
        if !acquired.namespace.is_empty() {
            variable.namespace = acquired.namespace;
        }
        variable.modify_index = acquired.modify_index;
        variable.create_index = acquired.create_index;
        variable.lock = Some(lock);

        info!("Lock {} acquired by {}", variable.path, caller_id);
        Ok(Some(lock_id))
    }

    async fn release(&self, cancel: &CancellationToken) -> LockResult<()> {
        let mut variable = self.variable.lock().await;
        let lock_id = variable.lock_id().ok_or(LockError::NotHeld)?.to_string();

        let endpoint = Self::endpoint(&variable.path, OP_RELEASE);
        let request = Variable::new(variable.path.clone())
            .with_namespace(variable.namespace.clone())
            .with_lock(VariableLock::with_id(lock_id));
        let body = encode(&request)?;

        let result = self.client.retry_put(cancel, &endpoint, &body).await;

        match result {
            Ok(_) => {
                if let Some(lock) = variable.lock.as_mut() {
                    lock.id.clear();
                }
                info!("Lock {} released", variable.path);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                // Lease is gone either way; forget the stale id
                if let Some(lock) = variable.lock.as_mut() {
                    lock.id.clear();
                }
                Err(LockError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew(&self, cancel: &CancellationToken) -> LockResult<()> {
        let mut variable = self.variable.lock().await;
        if variable.lock_id().is_none() {
            return Err(LockError::NotHeld);
        }

        let endpoint = Self::endpoint(&variable.path, OP_RENEW);
        let body = encode(&variable)?;

        match self.client.retry_put(cancel, &endpoint, &body).await {
            Ok((_, response)) => {
                // Not every server version returns metadata on renew
                if let Ok(meta) = serde_json::from_value::<VariableMetadata>(response) {
                    if meta.modify_index > 0 {
                        variable.modify_index = meta.modify_index;
                    }
                }
                debug!("Lock {} renewed", variable.path);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                if let Some(lock) = variable.lock.as_mut() {
                    lock.id.clear();
                }
                Err(LockError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }
}
