use anyhow::Context;
use dotenvy::dotenv;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use ticketserver::config::AppConfig;
use ticketserver::shared::state::AppState;
use ticketserver::storage::FileStore;
use ticketserver::tickets::archive::Archiver;
use ticketserver::tickets::cooldown::CooldownGuard;
use ticketserver::tickets::store::{ArchiveStore, ConfigStore, TicketStore};
use ticketserver::tickets::TicketEngine;
use ticketserver::transport::attachments::AttachmentFetcher;
use ticketserver::transport::discord::DiscordTransport;
use ticketserver::web_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env();
    let token = config
        .discord_token
        .clone()
        .context("DISCORD_TOKEN is not set")?;

    let data_dir = PathBuf::from(&config.data_dir);
    let kv = Arc::new(FileStore::new(&data_dir));
    let configs = Arc::new(ConfigStore::new(kv.clone()));
    let tickets = Arc::new(TicketStore::new(kv.clone()));
    let archives = Arc::new(ArchiveStore::new(kv));

    let transport = Arc::new(DiscordTransport::new(token));
    let fetcher = Arc::new(AttachmentFetcher::new());
    let archiver = Arc::new(Archiver::new(
        transport.clone(),
        configs.clone(),
        tickets.clone(),
        archives.clone(),
        fetcher,
        data_dir.join("attachments"),
    ));
    let engine = Arc::new(TicketEngine::new(
        transport,
        configs.clone(),
        tickets,
        archives,
        Arc::new(CooldownGuard::new()),
        archiver,
    ));

    let state = AppState {
        config: config.clone(),
        engine,
        configs,
    };

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("ticketserver listening on {addr}");
    axum::serve(listener, web_server::router(state))
        .await
        .context("server error")?;
    Ok(())
}
