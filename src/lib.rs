//! h2sched - cooperative coroutine scheduler and HTTP/2 server sessions
//!
//! This crate provides a small fixed pool of processor and worker threads
//! that drive explicit state machine tasks ([`runtime`]), and an HTTP/2
//! server session engine built on it ([`http::h2`]).

pub mod config;
pub mod http;
pub mod logging;
pub mod runtime;
