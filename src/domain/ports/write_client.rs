use crate::domain::errors::ClientResult;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Metadata returned by a successful write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteMeta {
    pub last_index: u64,
    pub request_time: Duration,
}

/// A single JSON write against the variable service.
#[async_trait]
pub trait WriteClient: Send + Sync {
    /// PUT `body` to `endpoint` and return the decoded response body
    /// (`Value::Null` when empty).
    async fn put(&self, endpoint: &str, body: &Value) -> ClientResult<(WriteMeta, Value)>;
}
