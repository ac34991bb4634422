mod http;
mod server;
mod ws;

use anyhow::Result;
use tracing::info;

use cinesync_core::{logging, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("configuration error: {error}");
        }
        anyhow::bail!("configuration validation failed with {} error(s)", errors.len());
    }

    logging::init(&config.logging)?;
    info!(
        port = config.server.port,
        video_root = %config.video.root,
        "starting sync server"
    );

    server::run(config).await
}
