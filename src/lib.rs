//! Library crate for pingport-rs: concurrent ping + TCP port probing of many targets.
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod primitives;
pub mod registry;
pub mod report;
pub mod server;
pub mod targets;
pub mod task;
pub mod types;
