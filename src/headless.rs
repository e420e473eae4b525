// Command-line entry: headless sharing node or interactive shell
use crate::config::{default_config_path, ClientConfig};
use crate::repl::{describe_event, run_repl, ReplContext};
use crate::session::{Client, ClientEvent};
use crate::signaling::WsSignaling;
use crate::transport::TcpTransport;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "peersend")]
#[command(about = "PeerSend - room-based peer-to-peer file sharing", long_about = None)]
pub struct CliArgs {
    /// Run without the interactive shell
    #[arg(long)]
    pub headless: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Relay WebSocket URL
    #[arg(long)]
    pub relay: Option<String>,

    /// Address the peer transport listens on
    #[arg(long)]
    pub listen: Option<String>,

    /// Host other peers should dial instead of the bound IP
    #[arg(long)]
    pub advertise_host: Option<String>,

    /// Name shown to other peers
    #[arg(long)]
    pub name: Option<String>,

    /// Directory finished downloads are written to
    #[arg(long)]
    pub download_dir: Option<String>,

    /// Room to join at startup
    #[arg(long)]
    pub room: Option<String>,

    /// Files to offer at startup (can be specified multiple times)
    #[arg(long)]
    pub offer: Vec<PathBuf>,

    /// Download every file other peers offer (headless mode)
    #[arg(long)]
    pub auto_download: bool,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    pub save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl CliArgs {
    /// Load the config file and apply command-line overrides on top.
    pub fn resolve_config(&self) -> Result<ClientConfig> {
        let path = self.config.clone().or_else(default_config_path);
        let mut config = match &path {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };

        if let Some(relay) = &self.relay {
            config.relay_url = relay.clone();
        }
        if let Some(listen) = &self.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(host) = &self.advertise_host {
            config.advertise_host = Some(host.clone());
        }
        if let Some(name) = &self.name {
            config.display_name = Some(name.clone());
        }
        if let Some(dir) = &self.download_dir {
            config.download_dir = dir.clone();
        }
        let config = config.with_display_name();

        if self.save_config {
            let path = path.ok_or_else(|| anyhow!("No config directory available"))?;
            config.save(&path)?;
        }
        Ok(config)
    }
}

pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("peersend={}", level)));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}

/// Connect to the relay and start a session over the TCP transport.
pub async fn start_client(
    config: &ClientConfig,
) -> Result<(Client, mpsc::UnboundedReceiver<ClientEvent>)> {
    let listen: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_addr))?;
    let signaling = WsSignaling::connect(&config.relay_url)
        .await
        .with_context(|| format!("Failed to reach relay {}", config.relay_url))?;
    let transport = Arc::new(TcpTransport::new(listen, config.advertise_host.clone()));

    Ok(Client::spawn(config.clone(), signaling, transport))
}

pub async fn run(args: CliArgs) -> Result<()> {
    let default_level = if args.headless { "info" } else { "warn" };
    init_tracing(args.log_level.as_deref().unwrap_or(default_level));

    let config = args.resolve_config()?;
    info!("Relay: {}, listening on {}", config.relay_url, config.listen_addr);
    let (client, events) = start_client(&config).await?;

    if let Some(room) = &args.room {
        let peers = client.join_room(room).await?;
        info!("Joined {} with {} peer(s)", room, peers.len());
    }
    if !args.offer.is_empty() {
        let added = client.offer_paths(&args.offer).await?;
        info!("Offering {} file(s)", added.len());
    }

    let result = if args.headless {
        run_headless(&client, events, args.auto_download).await
    } else {
        run_interactive(&client, events).await
    };

    if let Err(e) = client.shutdown().await {
        warn!("Shutdown: {}", e);
    }
    result
}

async fn run_headless(
    client: &Client,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    auto_download: bool,
) -> Result<()> {
    info!("Running headless, press Ctrl+C to stop");
    let mut requested = HashSet::new();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(line) = describe_event(&event) {
                    info!("{}", line);
                }
                if let ClientEvent::RemoteOffersUpdated { peer_id, offers } = &event {
                    if !auto_download {
                        continue;
                    }
                    for offer in offers {
                        if !requested.insert(offer.offer_id(Some(peer_id.as_str()))) {
                            continue;
                        }
                        if let Err(e) = client.request_file(peer_id, offer).await {
                            error!("Failed to request {}: {}", offer.name(), e);
                        }
                    }
                }
            }
        }
    }

    info!("Shutting down...");
    Ok(())
}

async fn run_interactive(
    client: &Client,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) -> Result<()> {
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = describe_event(&event) {
                println!("\n{}", line);
            }
        }
    });

    let context = ReplContext {
        client: client.clone(),
    };
    let result = run_repl(context).await.map_err(|e| anyhow!(e.to_string()));
    printer.abort();
    result
}
