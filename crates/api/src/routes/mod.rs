//! API Routes

pub mod connection;
pub mod diagnostics;
pub mod live;
