mod command;
mod config;
mod connection;
mod device;
mod repeater;
mod transport;

use anyhow::Result;
use clap::Parser;
use config::{GatewayConfig, WifiBackend};
use repeater::Repeater;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use transport::{NmcliWifi, StaticWifi, WifiAdapter};

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "drone-gateway")]
#[command(about = "WebSocket to UDP command repeater with a mesh broadcast bridge")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket listen address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Start the embedded mesh server at launch
    #[arg(long)]
    mesh: bool,

    #[arg(long)]
    mesh_port: Option<u16>,

    /// WiFi backend used to reach device access points
    #[arg(long, value_enum)]
    wifi: Option<WifiBackend>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    dump_config: bool,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(bind) = self.bind {
            config.gateway.bind = bind;
        }
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if self.mesh {
            config.mesh.auto_start = true;
        }
        if let Some(port) = self.mesh_port {
            config.mesh.port = port;
        }
        if let Some(backend) = self.wifi {
            config.wifi.backend = backend;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("drone_gateway={0},gateway_shared={0},mesh_server={0},tower_http=warn", args.log_level).into()
            }),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path).await?,
        None => GatewayConfig::default(),
    };
    args.apply(&mut config);

    if args.dump_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let wifi: Arc<dyn WifiAdapter> = match config.wifi.backend {
        WifiBackend::Static => Arc::new(StaticWifi::new()),
        WifiBackend::Nmcli => Arc::new(NmcliWifi::new(config.wifi.interface.clone())),
    };
    info!(
        "Drone gateway v{} starting ({} devices, {} WiFi)",
        env!("CARGO_PKG_VERSION"),
        config.devices.len(),
        wifi.name()
    );

    let repeater = Repeater::start(&config, wifi).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = repeater.shutdown_requested() => info!("Terminate requested, shutting down"),
    }

    repeater.close().await
}
