//! Tessera relay: standalone WebSocket server for realtime channels.
//!
//! Usage: `tessera-relay [BIND_ADDR] [MAX_MEMBERS_PER_CHANNEL]`
//!
//! Logging is controlled with `RUST_LOG` (e.g. `RUST_LOG=info`).

use log::{error, info};
use tessera_collab::{ChannelRelay, RelayConfig, TransportError};

fn config_from_args(mut args: impl Iterator<Item = String>) -> RelayConfig {
    let mut config = RelayConfig::default();
    if let Some(addr) = args.next() {
        config.bind_addr = addr;
    }
    if let Some(max) = args.next() {
        match max.parse::<usize>() {
            Ok(n) if n > 0 => config.max_members_per_channel = n,
            _ => error!(
                "Ignoring invalid member limit '{max}', using {}",
                config.max_members_per_channel
            ),
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), TransportError> {
    env_logger::init();

    let config = config_from_args(std::env::args().skip(1));
    info!(
        "Starting Tessera relay on {} (max {} members per channel)...",
        config.bind_addr, config.max_members_per_channel
    );

    let relay = ChannelRelay::new(config);
    tokio::select! {
        result = relay.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = relay.stats().await;
            info!(
                "Shutting down: {} connections served, {} changes relayed",
                stats.total_connections, stats.changes_published
            );
            Ok(())
        }
    }
}
