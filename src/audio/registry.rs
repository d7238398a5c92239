//! Guild-keyed session state.
//!
//! One long-lived [`SessionRegistry`] owns every per-guild map (queues,
//! mixers, play locks, AFK timers, roulette sessions) so tests can inject a
//! fresh registry instead of touching process-wide globals. All maps are
//! mutated from the cooperative (tokio) domain only; the mixers themselves
//! are the sole cross-thread objects.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serenity::all::{ChannelId, GuildId};
use serenity::http::Http;
use songbird::tracks::TrackHandle;
use songbird::Call;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::mixer::{EndCallback, Mixer};
use super::queue::{GuildQueue, QueueError};
use crate::game::roulette::RouletteSession;

/// Minimal send capability the registry needs from the chat platform.
/// Narrow on purpose: queue progression only ever posts one-line updates.
pub trait ChatNotifier: Send + Sync + 'static {
    fn send(&self, channel_id: ChannelId, content: String) -> BoxFuture<'static, ()>;
}

pub struct HttpNotifier {
    http: Arc<Http>,
}

impl HttpNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

impl ChatNotifier for HttpNotifier {
    fn send(&self, channel_id: ChannelId, content: String) -> BoxFuture<'static, ()> {
        let http = self.http.clone();
        Box::pin(async move {
            if let Err(e) = channel_id.say(&http, content).await {
                error!("Failed to send queue update: {e:?}");
            }
        })
    }
}

pub struct SessionRegistry {
    queues: DashMap<GuildId, Arc<Mutex<GuildQueue>>>,
    mixers: DashMap<GuildId, Mixer>,
    tracks: DashMap<GuildId, TrackHandle>,
    play_locks: DashMap<GuildId, Arc<Mutex<()>>>,
    afk_timers: DashMap<GuildId, CancellationToken>,
    games: DashMap<GuildId, Arc<RouletteSession>>,
    alert_token: parking_lot::Mutex<Option<CancellationToken>>,
    end_tx: mpsc::UnboundedSender<EndCallback>,
    notifier: Arc<dyn ChatNotifier>,
    max_queue_size: usize,
}

impl SessionRegistry {
    /// Creates the registry and spawns the end-callback dispatcher: the
    /// thread-safe hand-off point between the voice driver thread and the
    /// cooperative scheduler. Must be called inside a tokio runtime.
    pub fn new(max_queue_size: usize, notifier: Arc<dyn ChatNotifier>) -> Arc<Self> {
        let (end_tx, mut end_rx) = mpsc::unbounded_channel::<EndCallback>();

        tokio::spawn(async move {
            while let Some(callback) = end_rx.recv().await {
                callback().await;
            }
            debug!("End-callback dispatcher finished");
        });

        Arc::new(Self {
            queues: DashMap::new(),
            mixers: DashMap::new(),
            tracks: DashMap::new(),
            play_locks: DashMap::new(),
            afk_timers: DashMap::new(),
            games: DashMap::new(),
            alert_token: parking_lot::Mutex::new(None),
            end_tx,
            notifier,
            max_queue_size,
        })
    }

    // ─── Queues ──────────────────────────────────────────────────────────

    pub fn queue(&self, guild_id: GuildId) -> Arc<Mutex<GuildQueue>> {
        self.queues
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(GuildQueue::new(self.max_queue_size))))
            .clone()
    }

    /// Serialization lock for "resolve a track and start/enqueue it". Two
    /// racing play requests must not both decide the mixer is idle.
    pub fn play_lock(&self, guild_id: GuildId) -> Arc<Mutex<()>> {
        self.play_locks
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ─── Mixers ──────────────────────────────────────────────────────────

    pub fn mixer(&self, guild_id: GuildId) -> Option<Mixer> {
        self.mixers.get(&guild_id).map(|m| m.clone())
    }

    /// The songbird track carrying the guild's mixer output, for
    /// pause/resume control.
    pub fn track(&self, guild_id: GuildId) -> Option<TrackHandle> {
        self.tracks.get(&guild_id).map(|t| t.clone())
    }

    /// Idempotent: reuses the guild's mixer while its track is still alive on
    /// the call; otherwise stops whatever the call is playing and attaches a
    /// fresh mixer as the sole output.
    pub async fn get_or_create_mixer(&self, guild_id: GuildId, call: &Arc<Mutex<Call>>) -> Mixer {
        let existing = self
            .mixers
            .get(&guild_id)
            .map(|m| m.clone())
            .zip(self.tracks.get(&guild_id).map(|t| t.clone()));
        if let Some((mixer, track)) = existing {
            if track.get_info().await.is_ok() {
                return mixer;
            }
        }

        let mixer = Mixer::new(self.end_tx.clone());
        let track = {
            let mut call = call.lock().await;
            call.stop();
            call.play_input(mixer.clone().into_input())
        };
        info!("🎛️ Mixer attached for guild {guild_id}");
        self.mixers.insert(guild_id, mixer.clone());
        self.tracks.insert(guild_id, track);
        mixer
    }

    /// Starts `source` immediately when the mixer is idle, otherwise appends
    /// it to the guild queue. Callers must hold the guild's play lock across
    /// resolve-and-start so the idle check cannot race. Returns `true` when
    /// the track went live.
    pub async fn start_or_enqueue(
        self: &Arc<Self>,
        guild_id: GuildId,
        channel_id: ChannelId,
        mixer: &Mixer,
        source: Box<dyn crate::audio::PcmSource>,
        title: String,
    ) -> Result<bool, QueueError> {
        if mixer.has_main() {
            self.queue(guild_id).lock().await.push(source, title)?;
            Ok(false)
        } else {
            mixer.set_main(Some(source), Some(self.end_callback(guild_id, channel_id)));
            Ok(true)
        }
    }

    /// Pops the queue head and installs it as the main source with an
    /// `on_end` that re-invokes this function - the callback chain is the
    /// sole driver of queue progression. Empty queue: the mixer idles.
    pub fn play_next_in_queue(
        self: Arc<Self>,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let queue = self.queue(guild_id);
            let next = queue.lock().await.pop();
            let Some(track) = next else {
                return;
            };
            let Some(mixer) = self.mixer(guild_id) else {
                debug!("No mixer for guild {guild_id}, dropping '{}'", track.title);
                return;
            };

            info!("▶️ Next up in guild {guild_id}: {}", track.title);
            mixer.set_main(Some(track.source), Some(self.end_callback(guild_id, channel_id)));
            self.notifier
                .send(channel_id, format!("▶️ Now playing: **{}**", track.title))
                .await;
        })
    }

    fn end_callback(self: &Arc<Self>, guild_id: GuildId, channel_id: ChannelId) -> EndCallback {
        let registry = self.clone();
        Box::new(move || registry.play_next_in_queue(guild_id, channel_id))
    }

    // ─── AFK timers ──────────────────────────────────────────────────────

    /// Replaces the guild's AFK-disconnect timer token, cancelling any
    /// previous one so two timers can never fire for the same guild.
    pub fn arm_afk_timer(&self, guild_id: GuildId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.afk_timers.insert(guild_id, token.clone()) {
            previous.cancel();
        }
        token
    }

    pub fn cancel_afk_timer(&self, guild_id: GuildId) {
        if let Some((_, token)) = self.afk_timers.remove(&guild_id) {
            token.cancel();
        }
    }

    // ─── Roulette sessions ───────────────────────────────────────────────

    pub fn game(&self, guild_id: GuildId) -> Option<Arc<RouletteSession>> {
        self.games.get(&guild_id).map(|g| g.clone())
    }

    pub fn insert_game(&self, guild_id: GuildId, session: Arc<RouletteSession>) {
        self.games.insert(guild_id, session);
    }

    pub fn remove_game(&self, guild_id: GuildId) {
        self.games.remove(&guild_id);
    }

    // ─── Alert token ─────────────────────────────────────────────────────

    /// Claims the single alert slot; `None` when an alert is already running.
    pub fn begin_alert(&self) -> Option<CancellationToken> {
        let mut slot = self.alert_token.lock();
        if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return None;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Some(token)
    }

    pub fn end_alert(&self) {
        *self.alert_token.lock() = None;
    }

    /// Cancels a running alert. Returns whether one was running.
    pub fn stop_alert(&self) -> bool {
        let slot = self.alert_token.lock();
        match slot.as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Full per-guild teardown: AFK timer, queued sources (released exactly
    /// once), mixer output and game entry. A fresh game or music session
    /// starts clean afterwards.
    pub async fn clear_guild(&self, guild_id: GuildId) {
        self.cancel_afk_timer(guild_id);
        if let Some((_, queue)) = self.queues.remove(&guild_id) {
            queue.lock().await.clear();
        }
        if let Some((_, mixer)) = self.mixers.remove(&guild_id) {
            mixer.set_main(None, None);
        }
        if let Some((_, track)) = self.tracks.remove(&guild_id) {
            let _ = track.stop();
        }
        self.games.remove(&guild_id);
    }

    /// Test seam: attach a mixer without a live voice connection.
    #[cfg(test)]
    pub fn insert_detached_mixer(&self, guild_id: GuildId) -> Mixer {
        let mixer = Mixer::new(self.end_tx.clone());
        self.mixers.insert(guild_id, mixer.clone());
        mixer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PcmSource;
    use pretty_assertions::assert_eq;

    struct NullNotifier;

    impl ChatNotifier for NullNotifier {
        fn send(&self, _channel_id: ChannelId, _content: String) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    struct Endless;

    impl PcmSource for Endless {
        fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<i16>>> {
            Ok(Some(vec![1; 16]))
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(100, Arc::new(NullNotifier))
    }

    const GUILD: GuildId = GuildId::new(1);
    const CHANNEL: ChannelId = ChannelId::new(2);

    #[tokio::test]
    async fn racing_play_requests_serialize_to_one_live_one_queued() {
        let registry = registry();
        let mixer = registry.insert_detached_mixer(GUILD);

        let mut live = 0;
        let mut queued = 0;
        for title in ["first", "second"] {
            // Both callers follow the command path: take the play lock, then
            // decide. The second must observe the first's main source.
            let lock = registry.play_lock(GUILD);
            let _guard = lock.lock().await;
            let went_live = registry
                .start_or_enqueue(GUILD, CHANNEL, &mixer, Box::new(Endless), title.into())
                .await
                .expect("queue has room");
            if went_live {
                live += 1;
            } else {
                queued += 1;
            }
        }

        assert_eq!((live, queued), (1, 1));
        assert_eq!(registry.queue(GUILD).lock().await.titles(), vec!["second"]);
    }

    #[tokio::test]
    async fn skip_advances_queue_by_exactly_one() {
        let registry = registry();
        let mixer = registry.insert_detached_mixer(GUILD);

        {
            let queue = registry.queue(GUILD);
            let mut queue = queue.lock().await;
            for title in ["a", "b", "c"] {
                queue.push(Box::new(Endless), title.into()).expect("queue has room");
            }
        }

        registry.clone().play_next_in_queue(GUILD, CHANNEL).await;
        assert!(mixer.has_main());
        assert_eq!(registry.queue(GUILD).lock().await.titles(), vec!["b", "c"]);

        // Skip: drop the main source explicitly, then advance.
        mixer.set_main(None, None);
        registry.clone().play_next_in_queue(GUILD, CHANNEL).await;
        assert!(mixer.has_main());
        assert_eq!(registry.queue(GUILD).lock().await.titles(), vec!["c"]);
    }

    #[tokio::test]
    async fn play_next_on_empty_queue_leaves_mixer_idle() {
        let registry = registry();
        let mixer = registry.insert_detached_mixer(GUILD);
        registry.clone().play_next_in_queue(GUILD, CHANNEL).await;
        assert!(!mixer.has_main());
    }

    #[tokio::test]
    async fn clear_guild_drops_all_state() {
        let registry = registry();
        let mixer = registry.insert_detached_mixer(GUILD);
        mixer.set_main(Some(Box::new(Endless)), None);
        registry
            .queue(GUILD)
            .lock()
            .await
            .push(Box::new(Endless), "pending".into())
            .expect("queue has room");

        registry.clear_guild(GUILD).await;

        assert!(registry.mixer(GUILD).is_none());
        assert!(registry.queue(GUILD).lock().await.is_empty());
        // The old mixer handle was detached with its main source dropped.
        assert!(!mixer.has_main());
    }

    #[tokio::test]
    async fn arming_afk_timer_cancels_previous() {
        let registry = registry();
        let first = registry.arm_afk_timer(GUILD);
        let second = registry.arm_afk_timer(GUILD);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        registry.cancel_afk_timer(GUILD);
        assert!(second.is_cancelled());
    }

    #[test]
    fn alert_slot_is_exclusive() {
        // No dispatcher needed here.
        let (end_tx, _end_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry {
            queues: DashMap::new(),
            mixers: DashMap::new(),
            tracks: DashMap::new(),
            play_locks: DashMap::new(),
            afk_timers: DashMap::new(),
            games: DashMap::new(),
            alert_token: parking_lot::Mutex::new(None),
            end_tx,
            notifier: Arc::new(NullNotifier),
            max_queue_size: 100,
        };

        let token = registry.begin_alert().expect("slot free");
        assert!(registry.begin_alert().is_none());
        assert!(registry.stop_alert());
        assert!(token.is_cancelled());
        registry.end_alert();
        assert!(registry.begin_alert().is_some());
    }
}
