//! Courier command-line client.
//!
//! # Usage
//!
//! ```bash
//! # Connect, register and listen
//! courier --relay 127.0.0.1:4433 --user alice --token "$TOKEN"
//!
//! # Send one message, then keep listening
//! courier --user alice --token "$TOKEN" --to bob --message "hi"
//! ```
//!
//! Keys live in memory only: every run is a fresh device.

use std::sync::Arc;

use clap::Parser;
use courier_client::{
    ClientConfig, InboundEvent, Messenger, QuicConnector, StaticCredentials, SystemEnv,
    TransportConfig,
};
use courier_core::{MemoryContactBook, MemoryKeyStore, RecoveryConfig};
use courier_crypto::RatchetEngine;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Courier end-to-end encrypted messaging client
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Courier end-to-end encrypted messaging client")]
#[command(version)]
struct Args {
    /// Relay address
    #[arg(short, long, default_value = "127.0.0.1:4433")]
    relay: String,

    /// TLS server name of the relay
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Account id
    #[arg(short, long)]
    user: String,

    /// Bearer token issued by the account service
    #[arg(short, long)]
    token: String,

    /// Name sent to peers in reset notices (defaults to the account id)
    #[arg(long)]
    display_name: Option<String>,

    /// Recipient of `--message`
    #[arg(long, requires = "message")]
    to: Option<String>,

    /// Message to send once connected
    #[arg(short, long, requires = "to")]
    message: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(relay = %args.relay, user = %args.user, "courier starting");

    let config = ClientConfig {
        transport: TransportConfig { relay_address: args.relay.clone(), ..Default::default() },
        recovery: RecoveryConfig {
            display_name: args.display_name.clone().unwrap_or_else(|| args.user.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    let messenger = Messenger::new(
        config,
        MemoryKeyStore::new(),
        RatchetEngine,
        SystemEnv::new(),
        QuicConnector::insecure(args.server_name.clone())?,
        Arc::new(StaticCredentials::new(args.user.clone(), args.token.clone())),
        Arc::new(MemoryContactBook::new()),
    );

    let mut inbox = messenger.start();
    messenger.connect().await?;

    let registration = messenger.register().await?;
    tracing::info!(?registration, "identity ready");

    if let (Some(peer), Some(text)) = (&args.to, &args.message) {
        let message_id = messenger.send(peer, text.as_bytes()).await?;
        tracing::info!(%peer, %message_id, "message sent");
    }

    loop {
        tokio::select! {
            event = inbox.recv() => match event {
                Some(InboundEvent::Message(message)) => tracing::info!(
                    from = %message.sender,
                    envelope = %message.envelope_id,
                    text = %String::from_utf8_lossy(&message.body),
                    "message received"
                ),
                Some(InboundEvent::IdentityChanged { peer, envelope_id }) => tracing::warn!(
                    %peer,
                    envelope = %envelope_id,
                    "identity key changed, verify it before talking to this peer again"
                ),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            },
        }
    }

    messenger.stop();
    messenger.disconnect();
    Ok(())
}
