//! peerbus-ping: mesh demonstration
//!
//! Joins the peer mesh, emits a `ping` carrying its name on a fixed interval,
//! and prints every ping it receives from other processes.
//!
//! ## Usage
//! ```text
//! peerbus-ping <name>
//! ```
//!
//! ## Configuration
//! - PEERBUS_CONFIG: Path to a YAML config file (optional)
//! - PEERBUS__MESH__ROOT_DIR: Shared socket directory (default: /tmp/peerbus)
//! - PEERBUS__PING__INTERVAL_MS: Ping interval (default: 2000)
//! - PEERBUS_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use peerbus::bus::HandlerError;
use peerbus::config::Config;
use peerbus::transport::PeerMeshTransport;
use peerbus::utils::bootstrap::init_tracing;
use peerbus::{Bus, Message};

const PING_EVENT: &str = "ping";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(name) = std::env::args().nth(1) else {
        eprintln!("usage: peerbus-ping <name>");
        std::process::exit(2);
    };

    init_tracing();
    let config = Config::load(None)?;

    let transport = Arc::new(PeerMeshTransport::new(config.mesh.mesh_config()).await?);
    let listener = transport.start().await?;

    let bus = Bus::builder()
        .transport(transport.clone())
        .inbound_capacity(config.mesh.inbound_capacity)
        .build();

    bus.on_fn(PING_EVENT, |msg: Arc<Message>| async move {
        match msg.data_str() {
            Some(from) => println!("received ping with: {}", from),
            None => println!("received ping with: {}", msg.data),
        }
        Ok::<(), HandlerError>(())
    })?;

    info!(
        name = %name,
        socket = %transport.socket_path().display(),
        "peerbus-ping started"
    );

    let pinger = {
        let bus = bus.clone();
        let mut ticker = tokio::time::interval(config.ping.interval());
        tokio::spawn(async move {
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                drop(bus.emit(Message::new(PING_EVENT, name.clone())));
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    pinger.abort();
    if let Err(e) = bus.close().await {
        error!(error = %e, "Failed to close bus");
    }
    if let Ok(Err(e)) = listener.await {
        error!(error = %e, "Listener stopped with error");
    }

    Ok(())
}
