//! duet-server — standalone relay binary.
//!
//! Binds the WebSocket relay and serves collaboration sessions until the
//! process is stopped. The bind address comes from the first CLI
//! argument or `DUET_BIND`, defaulting to the loopback address.

use duet_collab::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DUET_BIND").ok())
        .unwrap_or_else(|| ServerConfig::default().bind_addr);

    let config = ServerConfig {
        bind_addr,
        ..ServerConfig::default()
    };
    log::info!("Starting duet relay on {}", config.bind_addr);

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Server error: {e}");
        std::process::exit(1);
    }
}
