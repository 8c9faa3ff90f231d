#![deny(unsafe_code)]

//! Shared test utilities for the Nurture workspace.
//!
//! Provides a config builder, a scripted completion client, response
//! fixtures, an [`App`](nurture_core::App) harness and tracing helpers so
//! individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! nurture-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod fixtures;
pub mod harness;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use fixtures::{Gate, ScriptedClient};
pub use harness::TestApp;
