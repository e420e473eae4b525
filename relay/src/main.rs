// Room signaling relay: tracks who is in which room and tells members when
// peers arrive or leave. File data never passes through here.
use anyhow::{Context, Result};
use clap::Parser;
use peersend::signaling::{server, RelayHub};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "peersend-relay")]
#[command(about = "Room signaling relay for PeerSend", long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "3333")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "peersend_relay={level},peersend={level}",
            level = args.log_level
        ))
    });
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Relay listening on ws://{}", listener.local_addr()?);

    tokio::select! {
        _ = server::serve(listener, RelayHub::new()) => {}
        _ = signal::ctrl_c() => info!("Shutting down..."),
    }
    Ok(())
}
