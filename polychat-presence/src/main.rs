//! Polychat presence server.
//!
//! Configuration comes from `PRESENCE_*` environment variables, log levels
//! from `RUST_LOG`.

use log::{error, info};

use polychat_presence::{HubConfig, PresenceServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match HubConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!("Starting presence server on {}{}", config.bind_addr, config.ws_path);
    let server = PresenceServer::new(config);
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
