//! HTTP API Module
//!
//! Read-only status API: node health, cluster membership and repository refs.

mod http;

pub use http::{AppState, HttpServer};
