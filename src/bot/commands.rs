//! Prefix command dispatch and handlers.

use std::sync::Arc;
use std::time::Duration;

use serenity::all::{ChannelId, GetMessages, GuildId, Message};
use songbird::Call;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{bot_voice_channel, channel_roster, is_admin, voice_channel_of, BotEnv};
use crate::audio::queue::QueueError;
use crate::game::roulette::RouletteSession;
use crate::game::state::{SpinMode, Stake};
use crate::sources::ffmpeg::FfmpegPcmSource;
use crate::sources::local::{self, PrankMode};
use crate::sources::{tts, ytdlp};

pub async fn dispatch(env: &BotEnv, msg: &Message) {
    let Some(guild_id) = msg.guild_id else { return };

    let body = msg.content[env.config.command_prefix.len()..].trim_start();
    let mut parts = body.split_whitespace();
    let Some(command) = parts.next() else { return };
    let rest = body[command.len()..].trim();

    match command.to_lowercase().as_str() {
        "help" => help(env, msg).await,
        "join" => join(env, msg, guild_id).await,
        "leave" => leave(env, msg, guild_id).await,
        "play" => play(env, msg, guild_id, rest).await,
        "skip" => skip(env, msg, guild_id).await,
        "pause" => pause(env, msg, guild_id).await,
        "resume" => resume(env, msg, guild_id).await,
        "queue" => queue(env, msg, guild_id).await,
        "say" => say(env, msg, guild_id, rest).await,
        "tracks" => tracks(env, msg).await,
        "roulette" => roulette_classic(env, msg, guild_id).await,
        "roulette2" => roulette_start(env, msg, guild_id, rest).await,
        "shoot" => shoot(env, msg, guild_id).await,
        "heel" => heel(env, msg, guild_id).await,
        "cleanup" => cleanup(env, msg).await,
        "sfxtest" => effect_test(env, msg, guild_id, env.config.sounds_dir.clone()).await,
        "jimmytest" => effect_test(env, msg, guild_id, env.config.jimmy_dir.clone()).await,
        "prank" => prank_toggle(env, msg, guild_id, rest).await,
        "prankmode" => prank_mode(env, msg, guild_id, rest).await,
        "quotetest" => quote_test(env, msg, guild_id).await,
        _ => {}
    }
}

async fn reply(env: &BotEnv, channel_id: ChannelId, content: impl Into<String>) {
    if let Err(e) = channel_id.say(&env.http, content.into()).await {
        warn!("Failed to send reply: {e:?}");
    }
}

/// Admin gate; reports and returns false when the author lacks the right.
async fn require_admin(env: &BotEnv, msg: &Message, guild_id: GuildId) -> bool {
    if is_admin(env, guild_id, msg.author.id) {
        return true;
    }
    reply(env, msg.channel_id, "This command needs administrator rights!").await;
    false
}

/// Joins (or moves to) the author's voice channel. Reports and returns
/// `None` when the author is not in voice or the join fails.
async fn join_author_channel(
    env: &BotEnv,
    msg: &Message,
    guild_id: GuildId,
) -> Option<Arc<Mutex<Call>>> {
    let Some(channel) = voice_channel_of(env, guild_id, msg.author.id) else {
        reply(env, msg.channel_id, "You are not in a voice channel!").await;
        return None;
    };
    match env.songbird.join(guild_id, channel).await {
        Ok(call) => Some(call),
        Err(e) => {
            warn!("Voice join failed in guild {guild_id}: {e:?}");
            reply(env, msg.channel_id, "I could not join that voice channel.").await;
            None
        }
    }
}

async fn help(env: &BotEnv, msg: &Message) {
    let p = &env.config.command_prefix;
    let text = format!(
        "**Commands**\n\
        `{p}join` / `{p}leave` — voice channel in/out\n\
        `{p}play <url or search>` — play or queue a track\n\
        `{p}skip` `{p}pause` `{p}resume` `{p}queue` — playback control\n\
        `{p}say <text>` — speak a message in voice\n\
        `{p}tracks` — list the local music library\n\
        `{p}roulette` — instant round for everyone in the channel (admin)\n\
        `{p}roulette2 <everyturn|once> <kick|disconnect>` — start a turn-based game\n\
        `{p}shoot` — pull the trigger on your turn\n\
        `{p}heel` — stop everything\n\
        `{p}cleanup` — delete my recent messages"
    );
    reply(env, msg.channel_id, text).await;
}

async fn join(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    join_author_channel(env, msg, guild_id).await;
}

async fn leave(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    if env.songbird.get(guild_id).is_none() {
        return;
    }
    env.registry.clear_guild(guild_id).await;
    if let Err(e) = env.songbird.remove(guild_id).await {
        warn!("Voice leave failed in guild {guild_id}: {e:?}");
        return;
    }
    reply(env, msg.channel_id, "👋 So this is me now, a sinking ship.").await;
}

async fn play(env: &BotEnv, msg: &Message, guild_id: GuildId, query: &str) {
    if query.is_empty() {
        reply(
            env,
            msg.channel_id,
            format!("Usage: {}play <url or search terms>", env.config.command_prefix),
        )
        .await;
        return;
    }
    let Some(call) = join_author_channel(env, msg, guild_id).await else {
        return;
    };

    let play_lock = env.registry.play_lock(guild_id);
    if play_lock.try_lock().is_err() {
        reply(env, msg.channel_id, "A track is already loading, hold on.").await;
    }
    let _guard = play_lock.lock().await;

    // Non-URLs check the local library first.
    let local_hit = if !query.starts_with("http") {
        local::find_track(&env.config.music_dir, query)
    } else {
        None
    };

    let (source, title): (Box<dyn crate::audio::PcmSource>, String) = if let Some(path) = local_hit
    {
        let title = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| query.to_string());
        match FfmpegPcmSource::file(&path) {
            Ok(source) => {
                reply(env, msg.channel_id, format!("Local track found: **{title}**")).await;
                (Box::new(source), title)
            }
            Err(e) => {
                warn!("Failed to open local track {}: {e:#}", path.display());
                reply(env, msg.channel_id, "That local track could not be opened.").await;
                return;
            }
        }
    } else {
        let timeout = Duration::from_secs(env.config.ytdlp_timeout_secs);
        let resolved = match ytdlp::resolve(query, timeout).await {
            Ok(resolved) => resolved,
            Err(e) => {
                reply(env, msg.channel_id, format!("Playback error: {}", short_error(&e))).await;
                return;
            }
        };
        match FfmpegPcmSource::url(&resolved.stream_url, &resolved.title, &resolved.http_headers) {
            Ok(source) => (Box::new(source), resolved.title),
            Err(e) => {
                reply(env, msg.channel_id, format!("Playback error: {}", short_error(&e))).await;
                return;
            }
        }
    };

    let mixer = env.registry.get_or_create_mixer(guild_id, &call).await;
    match env
        .registry
        .start_or_enqueue(guild_id, msg.channel_id, &mixer, source, title.clone())
        .await
    {
        Ok(true) => reply(env, msg.channel_id, format!("▶️ Now playing: **{title}**")).await,
        Ok(false) => reply(env, msg.channel_id, format!("➕ Queued: **{title}**")).await,
        Err(QueueError::Full(max)) => {
            reply(env, msg.channel_id, format!("The queue is full ({max} tracks).")).await
        }
    }
}

fn short_error(e: &anyhow::Error) -> String {
    let mut text = e.to_string().replace('\n', " ").trim().to_string();
    if text.len() > 220 {
        text.truncate(220);
        text.push_str("...");
    }
    text
}

async fn skip(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    let Some(mixer) = env.registry.mixer(guild_id) else {
        return;
    };
    if !mixer.has_main() {
        return;
    }
    // Drop the current source without firing its on_end, then advance by
    // exactly one.
    mixer.set_main(None, None);
    env.registry
        .clone()
        .play_next_in_queue(guild_id, msg.channel_id)
        .await;
    reply(env, msg.channel_id, "⏭️ Track skipped!").await;
}

async fn pause(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    if let Some(track) = env.registry.track(guild_id) {
        if track.pause().is_ok() {
            reply(env, msg.channel_id, "⏸️ Playback paused.").await;
        }
    }
}

async fn resume(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    if let Some(track) = env.registry.track(guild_id) {
        if track.play().is_ok() {
            reply(env, msg.channel_id, "▶️ Playback resumed.").await;
        }
    }
}

async fn queue(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    let titles = env.registry.queue(guild_id).lock().await.titles();
    if titles.is_empty() {
        reply(env, msg.channel_id, "The queue is currently empty.").await;
        return;
    }
    let list = titles
        .iter()
        .enumerate()
        .map(|(i, title)| format!("{}. {title}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    reply(env, msg.channel_id, format!("**Up next:**\n{list}")).await;
}

async fn say(env: &BotEnv, msg: &Message, guild_id: GuildId, text: &str) {
    if text.is_empty() {
        reply(env, msg.channel_id, format!("Usage: {}say <text>", env.config.command_prefix))
            .await;
        return;
    }
    if env
        .registry
        .mixer(guild_id)
        .is_some_and(|mixer| mixer.has_main())
    {
        reply(env, msg.channel_id, "Wait until the current playback ends!").await;
        return;
    }
    let Some(call) = join_author_channel(env, msg, guild_id).await else {
        return;
    };

    let speech = match tts::synthesize(&env.http_client, text, "en").await {
        Ok(file) => file,
        Err(e) => {
            reply(env, msg.channel_id, format!("Speech failed: {}", short_error(&e))).await;
            return;
        }
    };
    let source = match FfmpegPcmSource::file(speech.path()) {
        Ok(source) => source,
        Err(e) => {
            reply(env, msg.channel_id, format!("Speech failed: {}", short_error(&e))).await;
            return;
        }
    };

    let mixer = env.registry.get_or_create_mixer(guild_id, &call).await;
    mixer.set_main(Some(Box::new(source)), None);

    // The temp file must outlive playback; poll until the clip ends.
    let poll = Duration::from_millis(env.config.effect_poll_ms);
    while mixer.has_main() {
        tokio::time::sleep(poll).await;
    }
    drop(speech);
}

async fn tracks(env: &BotEnv, msg: &Message) {
    let names = local::list_tracks(&env.config.music_dir);
    if names.is_empty() {
        reply(env, msg.channel_id, "📂 The music folder is empty.").await;
        return;
    }
    let list = names.iter().map(|name| format!("- {name}")).collect::<Vec<_>>().join("\n");
    reply(
        env,
        msg.channel_id,
        format!(
            "**📂 Local music library:**\n{list}\n\n*Play one with: {}play <part of the name>*",
            env.config.command_prefix
        ),
    )
    .await;
}

/// The instant variant: everyone in the bot's channel pulls the trigger at
/// once, each with an independent 1-in-6 draw; losers get disconnected.
async fn roulette_classic(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    if !require_admin(env, msg, guild_id).await {
        return;
    }
    let Some(author_channel) = voice_channel_of(env, guild_id, msg.author.id) else {
        reply(env, msg.channel_id, "You are not in a voice channel!").await;
        return;
    };
    let Some(bot_channel) = bot_voice_channel(env, guild_id) else {
        reply(env, msg.channel_id, "I am not in a voice channel.").await;
        return;
    };
    if author_channel != bot_channel {
        reply(env, msg.channel_id, "You can only use this in my voice channel!").await;
        return;
    }

    reply(env, msg.channel_id, "Bang! 🔫").await;

    let roster = channel_roster(env, guild_id, bot_channel);
    for player in roster {
        if rand::Rng::gen_range(&mut rand::thread_rng(), 1..=6) == 1 {
            if let Err(e) = guild_id.disconnect_member(&env.http, player.user_id).await {
                warn!("Roulette disconnect failed for {}: {e:?}", player.display_name);
                reply(env, msg.channel_id, format!("I cannot remove: {}", player.display_name))
                    .await;
            }
        }
    }
}

async fn roulette_start(env: &BotEnv, msg: &Message, guild_id: GuildId, args: &str) {
    if !require_admin(env, msg, guild_id).await {
        return;
    }

    let mut parts = args.split_whitespace();
    let mode = match parts.next().map(str::to_lowercase).as_deref() {
        Some("everyturn") | Some("every") | Some("respin") => SpinMode::EveryTurn,
        Some("once") | Some("single") => SpinMode::Once,
        _ => {
            reply(
                env,
                msg.channel_id,
                format!(
                    "Usage: {}roulette2 <everyturn|once> <kick|disconnect>",
                    env.config.command_prefix
                ),
            )
            .await;
            return;
        }
    };
    let stake = match parts.next().map(str::to_lowercase).as_deref() {
        Some("kick") => Stake::Kick,
        Some("disconnect") | Some("dc") => Stake::Disconnect,
        _ => {
            reply(
                env,
                msg.channel_id,
                format!(
                    "Usage: {}roulette2 <everyturn|once> <kick|disconnect>",
                    env.config.command_prefix
                ),
            )
            .await;
            return;
        }
    };

    if let Some(existing) = env.registry.game(guild_id) {
        if existing.is_active().await {
            reply(env, msg.channel_id, "A game is already running in this server!").await;
            return;
        }
        env.registry.remove_game(guild_id);
    }

    let Some(voice_channel) = voice_channel_of(env, guild_id, msg.author.id) else {
        reply(env, msg.channel_id, "You are not in a voice channel!").await;
        return;
    };
    let players = channel_roster(env, guild_id, voice_channel);
    if players.len() < 2 {
        reply(env, msg.channel_id, "At least 2 players are needed in the voice channel!").await;
        return;
    }

    let Some(call) = join_author_channel(env, msg, guild_id).await else {
        return;
    };
    let mixer = env.registry.get_or_create_mixer(guild_id, &call).await;

    let session = match RouletteSession::create(
        guild_id,
        msg.channel_id,
        voice_channel,
        mode,
        stake,
        mixer,
        players,
    ) {
        Ok(session) => session,
        Err(e) => {
            reply(env, msg.channel_id, e.to_string()).await;
            return;
        }
    };
    session.track_message(msg.id).await;
    env.registry.insert_game(guild_id, session.clone());
    info!("🎲 Roulette session created in guild {guild_id}");
    session.begin(env).await;
}

async fn shoot(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    let Some(session) = env.registry.game(guild_id) else {
        reply(env, msg.channel_id, "There is no active roulette game.").await;
        return;
    };
    session.track_message(msg.id).await;
    let actor_channel = voice_channel_of(env, guild_id, msg.author.id);
    session.take_turn(env, msg.author.id, actor_channel).await;
}

/// The global stop: running alert, game, queue, mixer, AFK timer and the
/// voice connection all go away.
async fn heel(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    let alert_stopped = env.registry.stop_alert();

    if let Some(session) = env.registry.game(guild_id) {
        session.halt().await;
    }
    env.registry.clear_guild(guild_id).await;
    if env.songbird.get(guild_id).is_some() {
        if let Err(e) = env.songbird.remove(guild_id).await {
            warn!("Voice teardown failed in guild {guild_id}: {e:?}");
        }
    }

    let mut message = "🐕 Yes, master! (All processes stopped, memory wiped.)".to_string();
    if alert_stopped {
        message.push_str(" The alert was stopped too.");
    }
    reply(env, msg.channel_id, message).await;
}

/// Deletes the bot's own messages from the last 5 minutes in this channel.
async fn cleanup(env: &BotEnv, msg: &Message) {
    let bot_id = env.cache.current_user().id;
    let cutoff = chrono::Utc::now() - chrono::Duration::minutes(5);

    let recent = match msg
        .channel_id
        .messages(&env.http, GetMessages::new().limit(100))
        .await
    {
        Ok(messages) => messages,
        Err(e) => {
            warn!("Cleanup fetch failed: {e:?}");
            reply(env, msg.channel_id, "❌ I could not read the channel history.").await;
            return;
        }
    };

    let own: Vec<_> = recent
        .iter()
        .filter(|m| m.author.id == bot_id && *m.timestamp >= cutoff)
        .map(|m| m.id)
        .collect();
    let mut deleted = 0usize;
    for message_id in &own {
        match env.http.delete_message(msg.channel_id, *message_id, None).await {
            Ok(()) => deleted += 1,
            Err(e) => {
                warn!("Cleanup delete failed: {e:?}");
                reply(env, msg.channel_id, "❌ I am not allowed to delete messages here.").await;
                return;
            }
        }
    }
    reply(env, msg.channel_id, format!("🧹 Deleted {deleted} of my messages from the last 5 minutes."))
        .await;
}

/// Joins the author and plays one random effect from `dir`, leaving again if
/// the visit was only for the test.
async fn effect_test(env: &BotEnv, msg: &Message, guild_id: GuildId, dir: std::path::PathBuf) {
    if !require_admin(env, msg, guild_id).await {
        return;
    }
    if voice_channel_of(env, guild_id, msg.author.id).is_none() {
        reply(env, msg.channel_id, "❌ Join a voice channel first, old friend.").await;
        return;
    }
    let Some(file) = local::random_track(&dir, &mut rand::thread_rng()) else {
        reply(env, msg.channel_id, "❌ That effect folder is missing or empty!").await;
        return;
    };
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    reply(env, msg.channel_id, format!("😈 Test incoming! Playing: `{name}`")).await;

    let already_connected = env.songbird.get(guild_id).is_some();
    let Some(call) = join_author_channel(env, msg, guild_id).await else {
        return;
    };
    let mixer = env.registry.get_or_create_mixer(guild_id, &call).await;
    match FfmpegPcmSource::file(&file) {
        Ok(source) => mixer.add_effect(Box::new(source)),
        Err(e) => {
            reply(env, msg.channel_id, format!("❌ Effect failed: {}", short_error(&e))).await;
            return;
        }
    }

    let poll = Duration::from_millis(env.config.effect_poll_ms);
    while mixer.has_effects() {
        tokio::time::sleep(poll).await;
    }
    if !already_connected && !mixer.has_main() {
        if let Err(e) = env.songbird.remove(guild_id).await {
            warn!("Voice leave failed after effect test: {e:?}");
        }
    }
    reply(env, msg.channel_id, "👻 Sleepless nights, a hundred unspoken words.").await;
}

async fn prank_toggle(env: &BotEnv, msg: &Message, guild_id: GuildId, arg: &str) {
    if !require_admin(env, msg, guild_id).await {
        return;
    }
    match arg.to_lowercase().as_str() {
        "on" => {
            env.prank.set_enabled(true);
            reply(env, msg.channel_id, "✅ Random playback enabled.").await;
        }
        "off" => {
            env.prank.set_enabled(false);
            reply(env, msg.channel_id, "✅ Random playback disabled.").await;
        }
        _ => {
            reply(env, msg.channel_id, format!("Usage: {}prank <on|off>", env.config.command_prefix))
                .await
        }
    }
}

async fn prank_mode(env: &BotEnv, msg: &Message, guild_id: GuildId, arg: &str) {
    if !require_admin(env, msg, guild_id).await {
        return;
    }
    match arg.parse::<PrankMode>() {
        Ok(mode) => {
            env.prank.set_mode(mode);
            reply(env, msg.channel_id, format!("✅ Prank mode set to {arg}.")).await;
        }
        Err(()) => {
            reply(
                env,
                msg.channel_id,
                format!("Usage: {}prankmode <normal|jimmy|mixed>", env.config.command_prefix),
            )
            .await
        }
    }
}

async fn quote_test(env: &BotEnv, msg: &Message, guild_id: GuildId) {
    if !require_admin(env, msg, guild_id).await {
        return;
    }
    crate::automation::quotes::send_daily_quote(env, msg.channel_id).await;
}

