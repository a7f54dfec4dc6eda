//! Diagnostic Client
//!
//! What a caller of the diagnostic core (dashboard, CLI) needs: the request
//! dispatcher for running calls off the caller's own context, and a typed
//! client for the HTTP API.

mod client;
mod dispatcher;

pub use client::{
    ApiClient, ClearReply, ClientError, ConnectReply, ExplainReply, Readings, StatusReply,
    DEFAULT_BASE_URL, DEFAULT_TIMEOUT, EXPLAIN_TIMEOUT,
};
pub use dispatcher::{DispatchError, DispatchEvent, DispatchHandle, Dispatcher};
