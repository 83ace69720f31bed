//! iotgate basic library
//!
//! Provides functions shared by the gateway crates and services:
//! - logging functions
//! - configuration loading
//! - graceful shutdown

pub mod config_loader;
pub mod logging;
pub mod shutdown;

pub use config_loader::load_config;
pub use shutdown::{shutdown_token, wait_for_shutdown};

// Re-export common dependencies
pub use anyhow;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tokio_util;
