use std::sync::Arc;

use anyhow::Result;
use serenity::http::Http;
use serenity::model::gateway::GatewayIntents;
use serenity::Client;
use songbird::{SerenityInit, Songbird};
use tracing::{error, info};

mod api;
mod audio;
mod automation;
mod bot;
mod config;
mod game;
mod sources;
mod storage;

use crate::audio::registry::{HttpNotifier, SessionRegistry};
use crate::automation::prank::PrankControl;
use crate::bot::GhostBot;
use crate::config::Config;
use crate::storage::ScheduleStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ghost_dj=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("👻 Starting Ghost DJ v{}", env!("CARGO_PKG_VERSION"));

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    let config = Arc::new(Config::load()?);
    info!("{}", config.summary());

    let schedule_store = Arc::new(tokio::sync::Mutex::new(ScheduleStore::load(
        config.scheduled_messages_file(),
    )));
    let prank = PrankControl::new(storage::load_last_prank_date(&config.prank_state_file()));

    // A dedicated REST client for the queue notifier; the gateway client
    // below keeps its own.
    let notifier_http = Arc::new(Http::new(&config.discord_token));
    let registry = SessionRegistry::new(
        config.max_queue_size,
        Arc::new(HttpNotifier::new(notifier_http)),
    );

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let songbird = Songbird::serenity();
    let handler = GhostBot::new(
        config.clone(),
        songbird.clone(),
        registry,
        prank,
        schedule_store,
        http_client,
    );

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            return;
        }
        info!("⚠️ Shutdown signal received, closing...");
        std::process::exit(0);
    });

    info!("🚀 Bot started");
    if let Err(why) = client.start().await {
        error!("Client error: {why:?}");
    }

    Ok(())
}

/// Verifies the external tools the audio path shells out to.
async fn health_check() -> Result<()> {
    let yt_dlp = tokio::process::Command::new("yt-dlp").arg("--version").output().await?;
    let ffmpeg = tokio::process::Command::new("ffmpeg").arg("-version").output().await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Missing external dependencies");
    }
}
