//! IoT gateway daemon
//!
//! Wires the variable store, protocol adapters and alarm engine together
//! from one configuration file. The binary in `main.rs` only parses the
//! command line, initializes logging and hands control to [`Gateway`].

pub mod app;
pub mod config;

pub use app::Gateway;
pub use config::{GatewayConfig, LogSettings, DEFAULT_CONFIG_PATH};
