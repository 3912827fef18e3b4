use std::path::PathBuf;
use std::sync::Arc;

use amll_bridge::control;
use amll_bridge::fetch::HttpDataSource;
use amll_bridge::supervisor::Supervisor;
use bridge_proto::config::Config;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "amll-bridge", version, about)]
struct Args {
    /// Config file (default: ~/.config/amll-bridge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Display WebSocket URI, overriding `bridge.endpoint`
    #[arg(long)]
    endpoint: Option<String>,

    /// Print the effective config and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config_path, mut config) = match args.config {
        Some(path) => {
            let config = Config::load_from(&path)?;
            (path, config)
        }
        None => (Config::config_path(), Config::load()?),
    };
    if let Some(endpoint) = args.endpoint {
        config.bridge.endpoint = endpoint;
    }
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    // Setup file logging + stderr
    let data_dir = bridge_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = bridge_proto::platform::log_path();

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,amll_bridge=debug,bridge_proto=info")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);
    info!("Config loaded from: {:?}", config_path);

    let fetcher = Arc::new(HttpDataSource::new(config.player.fetch_timeout())?);
    let control = control::backend_for(&config.player);
    info!(
        "Bridging {} to {} ({:?} control)",
        config.player.api_url, config.bridge.endpoint, config.player.backend
    );

    Supervisor::new(config, fetcher, control).run().await;
    Ok(())
}
