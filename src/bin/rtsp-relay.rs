use std::sync::Arc;

use rtsp_relay::{Config, Server};

#[tokio::main]
async fn main() -> rtsp_relay::Result<()> {
    env_logger::init();

    let config_path =
        std::env::var("RTSP_RELAY_CONFIG").unwrap_or_else(|_| "rtsp-relay.json".to_owned());
    let config = if std::path::Path::new(&config_path).exists() {
        // A present but broken configuration file is fatal.
        let config = Config::load(&config_path)?;
        log::info!("loaded configuration from {config_path}");
        config
    } else {
        log::warn!("{config_path} not found, using defaults");
        Config::default()
    };

    let server = Server::new(Arc::new(config)).await?;
    server.run().await
}
