use clap::Parser;
use gateway_shared::defaults;
use mesh_server::MeshServer;
use std::net::{IpAddr, SocketAddr};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mesh-server", about = "Remote Sensors Protocol broadcast server")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = defaults::MESH_PORT)]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mesh_server={0},gateway_shared={0}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = MeshServer::new();
    server
        .start(SocketAddr::new(args.bind, args.port), false)
        .await?;

    info!("Mesh server running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    server.stop().await;
    Ok(())
}
