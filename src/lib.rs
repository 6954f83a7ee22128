//! Lease-based mutual exclusion over a remote variable service.
//!
//! A [`LockLeaser`] lets several independent processes elect exactly one
//! runner for a protected function. The variable service arbitrates
//! ownership through TTL-bound locks; the leaser acquires, renews and
//! releases them through a [`Locker`], retrying transient server errors
//! with [`RetryClient`].

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::services::{ConflictPolicy, InitialDelay, LeaserOptions, LockLeaser};
pub use config::{Config, ConfigError};
pub use domain::entities::{Variable, VariableLock};
pub use domain::errors::{
    ClientError, LeaserError, LockError, UnexpectedResponseError,
};
pub use domain::ports::locker::Locker;
pub use infrastructure::http::{HttpClient, RetryClient, RetryOptions};
pub use infrastructure::persistence::Locks;
