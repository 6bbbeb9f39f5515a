//! Asynchronous client for the Avahi mDNS/DNS-SD daemon over D-Bus.
//!
//! The library re-exports its building blocks for the CLI, integration tests
//! and fuzz targets.

pub mod bus;
pub mod client;
pub mod config;
pub mod types;

// Re-export commonly used types for convenience
pub use client::{
    Client, EntryGroup, Error, Event, Milestone, RecordBrowser, Result, ServiceBrowser,
    ServiceResolver,
};
pub use config::Config;
