//! HTTP server command: `edocebiv serve`.

use anyhow::Result;
use edocebiv::config::Config;
use edocebiv::server::{ServerConfig, start_server};

pub async fn cmd_serve(mut config: Config, port: Option<u16>, dev: bool) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    start_server(ServerConfig {
        config,
        dev_mode: dev,
    })
    .await
}
