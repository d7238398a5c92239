//! The once-a-day surprise playback.
//!
//! The loop sleeps a random 30min-2h stretch, then drops a random sound
//! effect into a populated voice channel, at most once per calendar day.
//! The day marker is persisted so a restart cannot re-arm it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use rand::seq::SliceRandom;
use rand::Rng;
use serenity::all::{ChannelId, GuildId};
use tracing::{info, warn};

use crate::bot::{populated_voice_channels, BotEnv};
use crate::sources::ffmpeg::FfmpegPcmSource;
use crate::sources::local::{select_prank_file, PrankMode};
use crate::storage;

/// Runtime switches shared between the loop and the admin commands.
pub struct PrankControl {
    enabled: AtomicBool,
    mode: parking_lot::Mutex<PrankMode>,
    last_prank_date: parking_lot::Mutex<Option<NaiveDate>>,
}

impl PrankControl {
    pub fn new(last_prank_date: Option<NaiveDate>) -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(true),
            mode: parking_lot::Mutex::new(PrankMode::default()),
            last_prank_date: parking_lot::Mutex::new(last_prank_date),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn mode(&self) -> PrankMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: PrankMode) {
        *self.mode.lock() = mode;
    }

    pub fn played_today(&self) -> bool {
        *self.last_prank_date.lock() == Some(Local::now().date_naive())
    }

    fn mark_played_today(&self) -> NaiveDate {
        let today = Local::now().date_naive();
        *self.last_prank_date.lock() = Some(today);
        today
    }
}

pub async fn prank_loop(env: BotEnv) {
    loop {
        if env.prank.played_today() {
            // Nothing more to do until midnight.
            let now = Local::now();
            let midnight = (now.date_naive() + chrono::Duration::days(1))
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default();
            let wait = (midnight - now.naive_local())
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(60));
            info!("👻 Daily prank limit reached, sleeping {}s", wait.as_secs());
            tokio::time::sleep(wait.max(std::time::Duration::from_secs(1))).await;
            continue;
        }

        let wait_secs = rand::thread_rng()
            .gen_range(env.config.prank_min_wait_secs..=env.config.prank_max_wait_secs);
        info!("👻 Next prank attempt in {wait_secs}s");
        tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;

        if !env.prank.is_enabled() || env.prank.played_today() {
            continue;
        }
        let Some(file) = select_prank_file(
            env.prank.mode(),
            &env.config.sounds_dir,
            &env.config.jimmy_dir,
            &mut rand::thread_rng(),
        ) else {
            continue;
        };
        let Some((guild_id, channel_id)) = pick_target(&env) else {
            continue;
        };

        info!("👻 Prank target: guild {guild_id}, channel {channel_id} ({})", file.display());
        match play_prank(&env, guild_id, channel_id, &file).await {
            Ok(()) => {
                let today = env.prank.mark_played_today();
                if let Err(e) = storage::save_last_prank_date(&env.config.prank_state_file(), today)
                {
                    warn!("Failed to persist prank state: {e:#}");
                }
            }
            Err(e) => warn!("Prank failed: {e:#}"),
        }
    }
}

/// A random populated voice channel in a guild whose mixer is idle.
fn pick_target(env: &BotEnv) -> Option<(GuildId, ChannelId)> {
    let mut rng = rand::thread_rng();
    for guild_id in env.cache.guilds() {
        if env
            .registry
            .mixer(guild_id)
            .is_some_and(|mixer| mixer.has_main())
        {
            continue;
        }
        let candidates = populated_voice_channels(env, guild_id);
        if let Some((channel_id, _)) = candidates.choose(&mut rng) {
            return Some((guild_id, *channel_id));
        }
    }
    None
}

/// Joins (or moves to) the channel, layers the effect over whatever plays,
/// waits for it to finish and leaves again if the visit was only for this.
async fn play_prank(
    env: &BotEnv,
    guild_id: GuildId,
    channel_id: ChannelId,
    file: &std::path::Path,
) -> anyhow::Result<()> {
    let already_connected = env.songbird.get(guild_id).is_some();
    let call = env.songbird.join(guild_id, channel_id).await?;

    let mixer = env.registry.get_or_create_mixer(guild_id, &call).await;
    mixer.add_effect(Box::new(FfmpegPcmSource::file(file)?));

    let poll = std::time::Duration::from_millis(env.config.effect_poll_ms);
    while mixer.has_effects() {
        tokio::time::sleep(poll).await;
    }

    if !already_connected && !mixer.has_main() {
        env.songbird.remove(guild_id).await?;
    }
    Ok(())
}
