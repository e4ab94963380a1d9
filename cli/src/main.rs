// wavelink — signaling relay and endpoint probe
//
// `wavelink serve` runs the relay; `wavelink join` connects a headless
// endpoint to one and prints presence and negotiation activity.

mod probe;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use wavelink_core::relay::{ClientRegistry, RelayRouter, RouterConfig};
use wavelink_core::rtc::EndpointEvent;
use wavelink_core::signaling::{JoinRequest, SignalingClient};

#[derive(Parser)]
#[command(name = "wavelink")]
#[command(about = "Wavelink — signaling relay for peer negotiation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Serve {
        #[arg(short, long, default_value = "9090")]
        port: u16,
        /// Maximum concurrent clients
        #[arg(long, default_value = "256")]
        max_clients: usize,
        /// Per-connection outbound queue depth
        #[arg(long, default_value = "64")]
        queue_depth: usize,
    },
    /// Join a relay as a headless endpoint
    Join {
        /// Relay address, e.g. 127.0.0.1:9090
        relay: String,
        #[arg(short, long)]
        username: String,
        #[arg(short, long, default_value = "participant")]
        role: String,
        /// Client id; the relay assigns one if omitted
        #[arg(long)]
        id: Option<String>,
        /// Immediately call this peer id once it appears in the roster
        #[arg(long)]
        call: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            max_clients,
            queue_depth,
        } => cmd_serve(port, max_clients, queue_depth).await,
        Commands::Join {
            relay,
            username,
            role,
            id,
            call,
        } => cmd_join(relay, username, role, id, call).await,
    }
}

async fn cmd_serve(port: u16, max_clients: usize, queue_depth: usize) -> Result<()> {
    let config = RouterConfig {
        max_clients,
        send_queue_depth: queue_depth,
        ..Default::default()
    };
    info!("Relay configured: {max_clients} max clients, queue depth {queue_depth}");
    let registry = Arc::new(ClientRegistry::new(max_clients));
    let router = RelayRouter::new(config, registry);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    println!("{} relay on port {port}", "Serving".green().bold());

    router.serve(listener).await?;
    Ok(())
}

async fn cmd_join(
    relay: String,
    username: String,
    role: String,
    id: Option<String>,
    call: Option<String>,
) -> Result<()> {
    let join = JoinRequest { id, username, role };
    let factory = probe::ProbeFactory::new(join.id.clone().unwrap_or_else(|| "local".to_string()));

    info!("Connecting to relay at {relay}");

    let (client, mut events) = SignalingClient::connect(&relay, join, Box::new(factory))
        .await
        .context("Failed to join relay")?;

    let local = client.local_record();
    println!(
        "{} as {} ({})",
        "Joined".green().bold(),
        local.properties.username.bold(),
        local.id
    );

    let mut pending_call = call;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("{}", "Leaving".yellow());
                client.shutdown().await;
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    println!("{}", "Relay connection lost".red());
                    return Ok(());
                };
                match event {
                    EndpointEvent::RosterChanged(roster) => {
                        let names: Vec<String> = roster
                            .iter()
                            .map(|c| format!("{} ({})", c.properties.username, c.id))
                            .collect();
                        println!("{} [{}]", "Roster".cyan(), names.join(", "));

                        if let Some(target) = pending_call.clone() {
                            if roster.iter().any(|c| c.id == target) {
                                println!("{} {target}", "Calling".cyan().bold());
                                if let Err(err) = client.call(&target).await {
                                    warn!("Call to {target} failed: {err}");
                                    println!("{} {err}", "Call failed:".red());
                                }
                                pending_call = None;
                            }
                        }
                    }
                    EndpointEvent::ConnectionStateChanged { peer_id, state } => {
                        println!("{} {peer_id}: {state:?}", "Peer".cyan());
                    }
                    EndpointEvent::IncomingDataChannel { peer_id, label } => {
                        println!("{} '{label}' from {peer_id}", "Data channel".green());
                    }
                    EndpointEvent::PeerUnreachable { peer_id } => {
                        println!("{} {peer_id}", "Unreachable".red());
                    }
                }
            }
        }
    }
}
