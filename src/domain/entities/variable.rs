use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::duration::{format_duration, parse_duration};

/// Default lease duration requested on acquisition.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

/// Default time the service keeps an expired lock blocked before it can be
/// acquired again.
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);

// ============================================================================
// VariableLock Model
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VariableLock {
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "TTL", default, skip_serializing_if = "String::is_empty")]
    pub ttl: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lock_delay: String,
}

impl VariableLock {
    pub fn new(ttl: Duration, lock_delay: Duration) -> Self {
        Self {
            id: String::new(),
            ttl: format_duration(ttl),
            lock_delay: format_duration(lock_delay),
        }
    }

    /// Lock carrying only its id, as sent on release.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn ttl(&self) -> Result<Duration, String> {
        parse_duration(&self.ttl)
    }

    pub fn lock_delay(&self) -> Result<Duration, String> {
        parse_duration(&self.lock_delay)
    }
}

// ============================================================================
// Variable Model
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Variable {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub items: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<VariableLock>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub modify_time: i64,
}

impl Variable {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_lock(mut self, lock: VariableLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Current lock id, if the variable carries a held lock.
    pub fn lock_id(&self) -> Option<&str> {
        self.lock
            .as_ref()
            .map(|lock| lock.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Variable record without its items, as returned by renewals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VariableMetadata {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub lock: Option<VariableLock>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}
