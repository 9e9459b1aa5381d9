//! Standalone collaboration server.
//!
//! Configured through `QUILL_*` environment variables; logging follows
//! `RUST_LOG` and defaults to `info`. Until a real session verifier is
//! wired in, the server only starts with `QUILL_DEV_AUTH=1`.

use log::info;
use quill_sync::{Collaborators, ServerConfig, SyncContext, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!("Starting quill server on {}", config.bind_addr);

    let directory = config.directory()?;
    let store = config.open_store()?;
    let collaborators = Collaborators::from_directory(directory);
    let ctx = SyncContext::new(config.sync.clone(), store, collaborators);

    SyncServer::new(config, ctx).run().await?;
    Ok(())
}
