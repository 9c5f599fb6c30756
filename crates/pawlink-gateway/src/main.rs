use std::net::SocketAddr;

use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pawlink=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("PAWLINK_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PAWLINK_GATEWAY_PORT")
        .unwrap_or_else(|_| "4000".into())
        .parse()?;

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let (local_addr, _dispatcher) = pawlink_gateway::spawn(addr).await?;
    info!("Pawlink dev gateway ready on {}", local_addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
