//! Serenity event handler plus the shared environment handed to every
//! subsystem (commands, game sessions, automation loops, the HTTP API).

pub mod commands;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serenity::all::{ChannelId, Context, EventHandler, GuildId, Message, Permissions, Ready, UserId, VoiceState};
use serenity::async_trait;
use serenity::cache::Cache;
use serenity::http::Http;
use songbird::Songbird;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audio::registry::SessionRegistry;
use crate::automation::prank::PrankControl;
use crate::automation::{prank, quotes, scheduler};
use crate::config::Config;
use crate::storage::ScheduleStore;

/// Everything a subsystem needs to act on Discord. Cheap to clone; all
/// fields are shared handles.
#[derive(Clone)]
pub struct BotEnv {
    pub http: Arc<Http>,
    pub cache: Arc<Cache>,
    pub songbird: Arc<Songbird>,
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub prank: Arc<PrankControl>,
    pub schedule_store: Arc<Mutex<ScheduleStore>>,
    pub http_client: reqwest::Client,
}

pub struct GhostBot {
    pub config: Arc<Config>,
    pub songbird: Arc<Songbird>,
    pub registry: Arc<SessionRegistry>,
    pub prank: Arc<PrankControl>,
    pub schedule_store: Arc<Mutex<ScheduleStore>>,
    pub http_client: reqwest::Client,
    started: AtomicBool,
}

impl GhostBot {
    pub fn new(
        config: Arc<Config>,
        songbird: Arc<Songbird>,
        registry: Arc<SessionRegistry>,
        prank: Arc<PrankControl>,
        schedule_store: Arc<Mutex<ScheduleStore>>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            config,
            songbird,
            registry,
            prank,
            schedule_store,
            http_client,
            started: AtomicBool::new(false),
        }
    }

    fn env(&self, ctx: &Context) -> BotEnv {
        BotEnv {
            http: ctx.http.clone(),
            cache: ctx.cache.clone(),
            songbird: self.songbird.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            prank: self.prank.clone(),
            schedule_store: self.schedule_store.clone(),
            http_client: self.http_client.clone(),
        }
    }
}

#[async_trait]
impl EventHandler for GhostBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("✅ Logged in as {}", ready.user.name);

        // Gateway reconnects re-fire ready; the background tasks are
        // spawned exactly once.
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let env = self.env(&ctx);
        tokio::spawn(prank::prank_loop(env.clone()));
        tokio::spawn(quotes::daily_quote_loop(env.clone()));
        tokio::spawn(scheduler::dispatch_loop(env.clone()));
        tokio::spawn(async move {
            if let Err(e) = crate::api::serve(env).await {
                warn!("Internal API stopped: {e:#}");
            }
        });
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        if !msg.content.starts_with(&self.config.command_prefix) {
            return;
        }
        commands::dispatch(&self.env(&ctx), &msg).await;
    }

    /// Starts or cancels the AFK-disconnect timer as people move around the
    /// bot's voice channel.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else { return };
        let env = self.env(&ctx);
        let Some(bot_channel) = bot_voice_channel(&env, guild_id) else {
            return;
        };

        let joined_bot_channel = new.channel_id == Some(bot_channel);
        let left_bot_channel =
            old.as_ref().and_then(|state| state.channel_id) == Some(bot_channel)
                && !joined_bot_channel;

        if joined_bot_channel {
            self.registry.cancel_afk_timer(guild_id);
            return;
        }
        if !left_bot_channel {
            return;
        }
        if count_humans(&env, guild_id, bot_channel) > 0 {
            return;
        }

        info!("🕳️ Voice channel empty in guild {guild_id}, arming AFK timer");
        let token = self.registry.arm_afk_timer(guild_id);
        let timeout = std::time::Duration::from_secs(self.config.afk_timeout_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    // Re-check: still in that channel, still alone.
                    if bot_voice_channel(&env, guild_id) != Some(bot_channel) {
                        return;
                    }
                    if count_humans(&env, guild_id, bot_channel) > 0 {
                        return;
                    }
                    info!("👋 Leaving empty voice channel in guild {guild_id}");
                    env.registry.clear_guild(guild_id).await;
                    if let Err(e) = env.songbird.remove(guild_id).await {
                        warn!("AFK disconnect failed for guild {guild_id}: {e:?}");
                    }
                }
            }
        });
    }
}

// ─── Cache lookups ───────────────────────────────────────────────────────
// All synchronous: serenity cache guards must not be held across awaits.

/// The voice channel the bot currently occupies in `guild_id`, if any.
pub fn bot_voice_channel(env: &BotEnv, guild_id: GuildId) -> Option<ChannelId> {
    let call = env.songbird.get(guild_id)?;
    let channel = call.try_lock().ok()?.current_channel()?;
    Some(ChannelId::new(channel.0.get()))
}

/// The voice channel `user_id` sits in, from the gateway cache.
pub fn voice_channel_of(env: &BotEnv, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = env.cache.guild(guild_id)?;
    guild.voice_states.get(&user_id).and_then(|state| state.channel_id)
}

/// Non-bot members currently in `channel_id`.
pub fn count_humans(env: &BotEnv, guild_id: GuildId, channel_id: ChannelId) -> usize {
    let Some(guild) = env.cache.guild(guild_id) else {
        return 0;
    };
    guild
        .voice_states
        .iter()
        .filter(|(user_id, state)| {
            state.channel_id == Some(channel_id)
                && !guild.members.get(user_id).map(|m| m.user.bot).unwrap_or(false)
        })
        .count()
}

/// Voice channels with at least one non-bot member, with their headcount.
pub fn populated_voice_channels(env: &BotEnv, guild_id: GuildId) -> Vec<(ChannelId, usize)> {
    let Some(guild) = env.cache.guild(guild_id) else {
        return Vec::new();
    };
    let mut counts: std::collections::HashMap<ChannelId, usize> = std::collections::HashMap::new();
    for (user_id, state) in &guild.voice_states {
        let Some(channel_id) = state.channel_id else { continue };
        if guild.members.get(user_id).map(|m| m.user.bot).unwrap_or(false) {
            continue;
        }
        *counts.entry(channel_id).or_insert(0) += 1;
    }
    counts.into_iter().collect()
}

/// Every non-bot member in `channel_id` with their display name, sorted by
/// name for a stable turn order.
pub fn channel_roster(env: &BotEnv, guild_id: GuildId, channel_id: ChannelId) -> Vec<crate::game::state::Player> {
    let Some(guild) = env.cache.guild(guild_id) else {
        return Vec::new();
    };
    let mut players: Vec<crate::game::state::Player> = guild
        .voice_states
        .iter()
        .filter(|(_, state)| state.channel_id == Some(channel_id))
        .filter_map(|(user_id, _)| guild.members.get(user_id))
        .filter(|member| !member.user.bot)
        .map(|member| crate::game::state::Player {
            user_id: member.user.id,
            display_name: member.display_name().to_string(),
        })
        .collect();
    players.sort_by(|a, b| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()));
    players
}

pub fn display_name_of(env: &BotEnv, guild_id: GuildId, user_id: UserId) -> String {
    env.cache
        .guild(guild_id)
        .and_then(|guild| guild.members.get(&user_id).map(|m| m.display_name().to_string()))
        .unwrap_or_else(|| user_id.to_string())
}

pub fn is_guild_owner(env: &BotEnv, guild_id: GuildId, user_id: UserId) -> bool {
    env.cache
        .guild(guild_id)
        .map(|guild| guild.owner_id == user_id)
        .unwrap_or(false)
}

/// The bot's own guild-wide permissions, from the cache.
pub fn bot_permissions(env: &BotEnv, guild_id: GuildId) -> Permissions {
    let bot_id = env.cache.current_user().id;
    let Some(guild) = env.cache.guild(guild_id) else {
        return Permissions::empty();
    };
    guild
        .members
        .get(&bot_id)
        .map(|member| guild.member_permissions(member))
        .unwrap_or_else(Permissions::empty)
}

/// Whether `user_id` has administrator rights in the guild.
pub fn is_admin(env: &BotEnv, guild_id: GuildId, user_id: UserId) -> bool {
    if is_guild_owner(env, guild_id, user_id) {
        return true;
    }
    let Some(guild) = env.cache.guild(guild_id) else {
        return false;
    };
    guild
        .members
        .get(&user_id)
        .map(|member| guild.member_permissions(member).administrator())
        .unwrap_or(false)
}
