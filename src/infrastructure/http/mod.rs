pub mod client;
pub mod retry;

pub use client::HttpClient;
pub use retry::{is_call_retriable, RetryClient, RetryOptions};
