//! Discord-bound roulette session: one per guild, at most one active.
//!
//! All turn mutation - the accepted-action path and the timeout path - goes
//! through the session's single `tokio::sync::Mutex`, so at most one advance
//! can happen per deadline. Sound cues run through the guild mixer as
//! transient effects; the looping intro is the mixer's main source for the
//! duration of the game.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serenity::all::{
    ChannelId, Colour, CreateEmbed, CreateEmbedFooter, CreateMessage, EditMessage, GuildId,
    MessageId, UserId,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::state::{GameError, GameState, Player, SpinMode, Stake, TurnOutcome};
use crate::audio::mixer::Mixer;
use crate::bot::{bot_permissions, is_guild_owner, BotEnv};
use crate::sources::ffmpeg::FfmpegPcmSource;

pub struct RouletteSession {
    guild_id: GuildId,
    /// Text channel all status messages go to.
    channel_id: ChannelId,
    /// Voice channel the game is bound to; actors must be in it.
    voice_channel_id: ChannelId,
    stake: Stake,
    inner: tokio::sync::Mutex<SessionInner>,
}

struct SessionInner {
    game: Option<GameState>,
    mixer: Mixer,
    turn_timer: Option<CancellationToken>,
    turn_message: Option<MessageId>,
    tracked: Vec<MessageId>,
}

impl RouletteSession {
    /// Builds an inactive-until-begun session. Fails without touching any
    /// shared state when fewer than 2 eligible players are given.
    pub fn create(
        guild_id: GuildId,
        channel_id: ChannelId,
        voice_channel_id: ChannelId,
        mode: SpinMode,
        stake: Stake,
        mixer: Mixer,
        players: Vec<Player>,
    ) -> Result<Arc<Self>, GameError> {
        let game = GameState::start(players, mode, &mut rand::thread_rng())?;
        Ok(Arc::new(Self {
            guild_id,
            channel_id,
            voice_channel_id,
            stake,
            inner: tokio::sync::Mutex::new(SessionInner {
                game: Some(game),
                mixer,
                turn_timer: None,
                turn_message: None,
                tracked: Vec::new(),
            }),
        }))
    }

    /// Posts the opening embed, starts the looping intro and announces the
    /// first turn.
    pub async fn begin(self: &Arc<Self>, env: &BotEnv) {
        let mut inner = self.inner.lock().await;

        match FfmpegPcmSource::file_looped(&env.config.roulette_sound("intro.mp3")) {
            Ok(intro) => inner.mixer.set_main(Some(Box::new(intro)), None),
            Err(e) => warn!("Intro sound unavailable: {e:#}"),
        }

        let starter = inner
            .game
            .as_ref()
            .and_then(|g| g.current_player())
            .map(|p| p.display_name.clone())
            .unwrap_or_default();
        let embed = CreateEmbed::new()
            .title("🎲 Russian Roulette")
            .description(format!("The game is on! First up: **{starter}**"))
            .colour(Colour::RED);
        self.send_embed_tracked(env, &mut inner, embed).await;

        let player_count = inner.game.as_ref().map(|g| g.player_count()).unwrap_or(0);
        info!("🎲 Roulette started in guild {} ({player_count} players)", self.guild_id);
        self.announce_turn(env, &mut inner).await;
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.game.is_some()
    }

    pub async fn track_message(&self, message_id: MessageId) {
        self.inner.lock().await.tracked.push(message_id);
    }

    /// Deactivates the session in place: no message cleanup, no voice
    /// teardown (the caller owns those). Used by the global stop command.
    pub async fn halt(&self) {
        let mut inner = self.inner.lock().await;
        inner.game = None;
        if let Some(token) = inner.turn_timer.take() {
            token.cancel();
        }
        inner.mixer.set_main(None, None);
        inner.turn_message = None;
        inner.tracked.clear();
    }

    /// The accepted-action path. Validation and resolution all happen under
    /// the session lock so a concurrently firing turn timer can never double
    /// up on the same deadline.
    pub async fn take_turn(
        self: &Arc<Self>,
        env: &BotEnv,
        actor: UserId,
        actor_voice_channel: Option<ChannelId>,
    ) {
        let mut inner = self.inner.lock().await;

        let Some(game) = inner.game.as_ref() else {
            self.plain(env, "There is no active roulette game.").await;
            return;
        };
        if actor_voice_channel != Some(self.voice_channel_id) {
            self.plain(env, "You can only play from the game's voice channel!").await;
            return;
        }
        if !game.contains(actor) {
            self.plain(env, "You are not on the player list.").await;
            return;
        }
        if !game.is_current(actor) {
            self.plain(env, "It is not your turn!").await;
            return;
        }
        let player = match game.current_player() {
            Some(player) => player.clone(),
            None => return,
        };

        if let Some(token) = inner.turn_timer.take() {
            token.cancel();
        }

        self.play_effect(env, &mut inner, "cock.mp3");
        tokio::time::sleep(Duration::from_secs(2)).await;

        let hit = match inner.game.as_mut() {
            Some(game) => game.roll_hit(&mut rand::thread_rng()),
            None => return,
        };

        if hit {
            self.play_effect(env, &mut inner, "bang.mp3");
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.punish(env, &mut inner, &player).await;
            self.update_turn_message(
                env,
                &mut inner,
                &player.display_name,
                format!("💥 **{}** took the shot!", player.display_name),
                false,
            )
            .await;
            self.advance(env, &mut inner, true).await;
        } else {
            self.play_effect(env, &mut inner, "click.mp3");
            self.update_turn_message(
                env,
                &mut inner,
                &player.display_name,
                format!("✅ **{}** survived this round!", player.display_name),
                false,
            )
            .await;
            self.advance(env, &mut inner, false).await;
        }
    }

    /// The timeout path. Re-validates under the lock that the session is
    /// still active and the turn still belongs to the timed-out player; an
    /// accepted action that slipped in first wins, and this becomes a no-op.
    async fn handle_timeout(self: Arc<Self>, env: BotEnv, expected: UserId) {
        let mut inner = self.inner.lock().await;

        let player = {
            let Some(game) = inner.game.as_ref() else { return };
            if !game.is_current(expected) {
                return;
            }
            match game.current_player() {
                Some(player) => player.clone(),
                None => return,
            }
        };

        info!("⌛ Turn timeout for {} in guild {}", player.display_name, self.guild_id);
        self.update_turn_message(
            &env,
            &mut inner,
            &player.display_name,
            format!("⌛ **{}** ran out of time!", player.display_name),
            false,
        )
        .await;
        self.punish(&env, &mut inner, &player).await;
        self.update_turn_message(
            &env,
            &mut inner,
            &player.display_name,
            format!("💀 **{}** is out!", player.display_name),
            false,
        )
        .await;
        self.advance(&env, &mut inner, true).await;
    }

    // ─── Internals (session lock held) ───────────────────────────────────

    // Boxed because the future is recursive: the spawned timeout handler
    // eventually awaits `announce_turn` again via `advance`.
    fn announce_turn<'a>(
        self: &'a Arc<Self>,
        env: &'a BotEnv,
        inner: &'a mut SessionInner,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let Some(player) = inner.game.as_ref().and_then(|g| g.current_player()).cloned() else {
            return;
        };

        let deadline = Utc::now().timestamp() + env.config.turn_timeout_secs as i64;
        let description = format!(
            "**{}** is up.\n⏰ Time runs out: <t:{deadline}:R>\nType **{}shoot** to pull the trigger.",
            player.display_name, env.config.command_prefix,
        );
        self.update_turn_message(env, inner, &player.display_name, description, true)
            .await;

        if let Some(previous) = inner.turn_timer.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        inner.turn_timer = Some(token.clone());

        let session = self.clone();
        let env = env.clone();
        let timeout = Duration::from_secs(env.config.turn_timeout_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    session.handle_timeout(env, player.user_id).await;
                }
            }
        });
        })
    }

    async fn advance(self: &Arc<Self>, env: &BotEnv, inner: &mut SessionInner, eliminated: bool) {
        let outcome = match inner.game.as_mut() {
            Some(game) => game.advance(eliminated),
            None => return,
        };

        match outcome {
            TurnOutcome::Continue => self.announce_turn(env, inner).await,
            TurnOutcome::Winner(winner) => {
                let embed = CreateEmbed::new()
                    .title("🏆 Russian Roulette")
                    .description(format!("**{}** won the game!", winner.display_name))
                    .colour(Colour::DARK_GREEN);
                let result = self
                    .channel_id
                    .send_message(&env.http, CreateMessage::new().embed(embed))
                    .await;
                let keep = result.ok().map(|m| m.id);
                info!("🏆 Roulette winner in guild {}: {}", self.guild_id, winner.display_name);
                self.end_game(env, inner, keep).await;
            }
            TurnOutcome::NoPlayers => {
                // Should be unreachable: turn serialization admits one
                // elimination per deadline. Report and shut down.
                warn!("Roulette in guild {} ended with no players left", self.guild_id);
                let result = self
                    .channel_id
                    .say(&env.http, "The game is over, no players left.")
                    .await;
                self.end_game(env, inner, result.ok().map(|m| m.id)).await;
            }
        }
    }

    /// Terminal cleanup: release sounds, delete tracked messages except the
    /// result (best effort), drop the registry entries and leave voice.
    async fn end_game(&self, env: &BotEnv, inner: &mut SessionInner, keep: Option<MessageId>) {
        inner.game = None;
        if let Some(token) = inner.turn_timer.take() {
            token.cancel();
        }
        inner.mixer.set_main(None, None);

        let mut seen = std::collections::HashSet::new();
        for message_id in inner.tracked.drain(..) {
            if Some(message_id) == keep || !seen.insert(message_id) {
                continue;
            }
            // Missing or forbidden deletions are ignored.
            let _ = env
                .http
                .delete_message(self.channel_id, message_id, Some("roulette cleanup"))
                .await;
        }
        inner.turn_message = None;

        env.registry.clear_guild(self.guild_id).await;
        if let Err(e) = env.songbird.remove(self.guild_id).await {
            warn!("Voice teardown failed for guild {}: {e:?}", self.guild_id);
        }
    }

    fn play_effect(&self, env: &BotEnv, inner: &mut SessionInner, name: &str) {
        match FfmpegPcmSource::file(&env.config.roulette_sound(name)) {
            Ok(source) => inner.mixer.add_effect(Box::new(source)),
            Err(e) => warn!("Sound effect '{name}' unavailable: {e:#}"),
        }
    }

    async fn update_turn_message(
        &self,
        env: &BotEnv,
        inner: &mut SessionInner,
        next_player: &str,
        description: String,
        force_new: bool,
    ) {
        let embed = CreateEmbed::new()
            .title("🎯 Russian Roulette")
            .description(description)
            .colour(Colour::DARK_RED)
            .footer(CreateEmbedFooter::new(format!("Next player: {next_player}")));

        if let Some(message_id) = inner.turn_message {
            if !force_new {
                let edit = EditMessage::new().embed(embed.clone());
                if self
                    .channel_id
                    .edit_message(&env.http, message_id, edit)
                    .await
                    .is_ok()
                {
                    return;
                }
                inner.turn_message = None;
            }
        }

        match self
            .channel_id
            .send_message(&env.http, CreateMessage::new().embed(embed))
            .await
        {
            Ok(message) => {
                inner.turn_message = Some(message.id);
                inner.tracked.push(message.id);
            }
            Err(e) => warn!("Failed to post turn status: {e:?}"),
        }
    }

    /// Applies the session stake to an eliminated player. Permission
    /// failures are reported, never retried.
    async fn punish(&self, env: &BotEnv, inner: &mut SessionInner, player: &Player) {
        match self.stake {
            Stake::Kick => {
                if is_guild_owner(env, self.guild_id, player.user_id) {
                    self.notice(env, inner, "👑 The server owner is immune to kicks!").await;
                    return;
                }
                if !bot_permissions(env, self.guild_id).kick_members() {
                    self.notice(env, inner, "❌ I have no permission to kick players.").await;
                    return;
                }
                if let Err(e) = self
                    .guild_id
                    .kick_with_reason(&env.http, player.user_id, "Russian Roulette")
                    .await
                {
                    warn!("Kick failed for {}: {e:?}", player.display_name);
                    self.notice(env, inner, "❌ Could not kick the player (permission error).")
                        .await;
                }
            }
            Stake::Disconnect => {
                if !bot_permissions(env, self.guild_id).move_members() {
                    self.notice(env, inner, "❌ I have no permission to disconnect players.")
                        .await;
                    return;
                }
                if let Err(e) = self.guild_id.disconnect_member(&env.http, player.user_id).await {
                    warn!("Disconnect failed for {}: {e:?}", player.display_name);
                    self.notice(
                        env,
                        inner,
                        "❌ Could not disconnect the player (permission error).",
                    )
                    .await;
                }
            }
        }
    }

    async fn notice(&self, env: &BotEnv, inner: &mut SessionInner, content: &str) {
        match self.channel_id.say(&env.http, content).await {
            Ok(message) => inner.tracked.push(message.id),
            Err(e) => warn!("Failed to send game notice: {e:?}"),
        }
    }

    async fn send_embed_tracked(&self, env: &BotEnv, inner: &mut SessionInner, embed: CreateEmbed) {
        match self
            .channel_id
            .send_message(&env.http, CreateMessage::new().embed(embed))
            .await
        {
            Ok(message) => inner.tracked.push(message.id),
            Err(e) => warn!("Failed to send game embed: {e:?}"),
        }
    }

    async fn plain(&self, env: &BotEnv, content: &str) {
        if let Err(e) = self.channel_id.say(&env.http, content).await {
            warn!("Failed to send game reply: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mixer::Mixer;
    use crate::game::state::{Player, SpinMode, Stake};

    fn players(n: u64) -> Vec<Player> {
        (1..=n)
            .map(|i| Player {
                user_id: UserId::new(i),
                display_name: format!("p{i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn create_fails_with_one_player_and_leaves_nothing_behind() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mixer = Mixer::new(tx);
        let result = RouletteSession::create(
            GuildId::new(1),
            ChannelId::new(2),
            ChannelId::new(3),
            SpinMode::EveryTurn,
            Stake::Disconnect,
            mixer.clone(),
            players(1),
        );
        assert!(result.is_err());
        assert!(!mixer.has_main(), "a failed start must not touch the mixer");
    }

    #[tokio::test]
    async fn created_session_is_active_until_halted() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mixer = Mixer::new(tx);
        let session = RouletteSession::create(
            GuildId::new(1),
            ChannelId::new(2),
            ChannelId::new(3),
            SpinMode::Once,
            Stake::Kick,
            mixer.clone(),
            players(3),
        )
        .expect("3 players is enough");

        assert!(session.is_active().await);
        session.halt().await;
        assert!(!session.is_active().await);
        assert!(!mixer.has_main());
    }
}
