//! Configuration loading helper functions
//!
//! Files are layered with figment; environment variables sharing the service
//! prefix override file values, with `__` separating nested keys
//! (`GATEWAYD_STORE__NOTIFY_QUEUE_CAPACITY=4096`).

use std::path::Path;

use errors::{GatewayError, GatewayResult};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use tracing::info;

/// Select the figment provider for a config file by its extension
fn file_figment(path: &Path) -> GatewayResult<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| GatewayError::Config("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(Figment::new().merge(Toml::file(path))),
        "yaml" | "yml" => Ok(Figment::new().merge(Yaml::file(path))),
        "json" => Ok(Figment::new().merge(Json::file(path))),
        _ => Err(GatewayError::Config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

/// Load configuration from a file, then environment overrides
///
/// Missing files are an error so that a typo in `--config` is not silently
/// replaced by defaults.
pub fn load_config<T, P>(path: P, env_prefix: &str) -> GatewayResult<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Err(GatewayError::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let figment = file_figment(path)?.merge(Env::prefixed(env_prefix).split("__"));
    let config = figment
        .extract()
        .map_err(|e| GatewayError::Config(format!("Failed to load configuration: {}", e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
