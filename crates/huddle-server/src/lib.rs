//! # huddle-server
//!
//! HTTP and WebSocket front of Huddle: configuration, the REST endpoints,
//! the real-time gateway, on-disk uploads, link previews and metrics.

pub mod config;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod preview;
pub mod storage;
