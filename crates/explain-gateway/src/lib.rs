//! Explanation Gateway
//!
//! Forwards a trouble code and its freeze frame to the remote explanation
//! service. Every failure mode comes back as [`ExplanationResult::Error`];
//! nothing is raised to the caller.

mod client;
mod retry;

pub use client::{
    ExplanationResult, GatewayClient, GatewayConfig, GatewayError, DEFAULT_ENDPOINT,
    DEFAULT_TIMEOUT,
};
pub use retry::{ResponseStatus, RetryPolicy};
