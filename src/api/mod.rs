//! HTTP API Module
//!
//! Administrative REST API over the mastership coordinator.

mod http;

pub use http::{AppState, HttpServer};
