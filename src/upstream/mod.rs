// Upstream access: HTTP client and the retry/failover engine.

pub mod client;
pub mod retry;

pub use client::UpstreamClient;
pub use retry::{AbortSignal, RetryEngine, RetryOutcome, RetryPolicy};
