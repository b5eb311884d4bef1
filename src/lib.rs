//! A lease-based job lifecycle engine.
//!
//! Jobs move through `waiting → running → completed | failed`, can be
//! requeued from `running` back to `waiting`, and may wait on other jobs as
//! prerequisites. [`service::JobService`] is the entry point for embedding;
//! [`server::Server`] exposes it over a line-based control protocol.
pub mod clock;
pub mod error;
pub mod graph;
pub mod line_reader;
pub mod parser;
pub mod server;
pub mod service;
pub mod store;
pub mod types;
pub mod util;
