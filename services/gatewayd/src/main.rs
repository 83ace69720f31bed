//! Gateway daemon entry point

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use common::logging::{self, LogConfig};
use gatewayd::{Gateway, GatewayConfig, DEFAULT_CONFIG_PATH};
use tracing::{info, Level};

const SERVICE_NAME: &str = "gatewayd";

#[derive(Parser, Debug)]
#[command(
    name = "gatewayd",
    version = env!("CARGO_PKG_VERSION"),
    about = "Industrial IoT gateway daemon",
    long_about = None
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Log directory; overrides the config file
    #[arg(long, value_name = "DIR")]
    log_dir: Option<String>,
}

fn init_logging(args: &Args, config: &GatewayConfig) -> anyhow::Result<()> {
    let level_name = args.log_level.as_deref().unwrap_or(&config.log.level);
    let level: Level = level_name
        .parse()
        .with_context(|| format!("invalid log level '{}'", level_name))?;

    logging::init_log_root(args.log_dir.as_deref().or(config.log.dir.as_deref()));
    logging::init_with_config(LogConfig {
        service_name: SERVICE_NAME.to_string(),
        log_dir: logging::get_log_root(),
        console_level: level,
        file_level: level.max(Level::DEBUG),
        enable_json: config.log.json,
        enable_file: config.log.file,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging needs the config, so load errors surface through anyhow on stderr
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(&args, &config)?;

    info!(
        "Starting {} v{} with {}",
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let gateway = Gateway::build(&config).context("building gateway")?;
    let shutdown = common::shutdown_token();
    gateway.run(shutdown).await?;

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
