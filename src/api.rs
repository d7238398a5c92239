//! Internal HTTP API on the loopback interface.
//!
//! External watchers (the site monitor, the video feed) poke the bot through
//! these endpoints; they are not exposed to Discord users. The alert endpoint
//! is globally serialized through the registry's alert token, which is also
//! how the `heel` command cuts a running alert short.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Value};
use serenity::all::{ChannelId, CreateAllowedMentions, CreateMessage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bot::{bot_voice_channel, populated_voice_channels, BotEnv};
use crate::sources::ffmpeg::FfmpegPcmSource;
use crate::storage::{
    format_schedule_datetime, normalize_recurrence, parse_schedule_datetime,
    resolve_effective_schedule, DeliveryStatus, ScheduledMessage,
};

const CHANGE_ALERT_MESSAGE: &str =
    "🚨 Watchdog alert!! The monitored site just changed!!! (HTML length change) 🚨";
const OUTAGE_ALERT_MESSAGE: &str =
    "⚠️ **Heads up!** The monitored site is unreachable or was briefly down";

pub async fn serve(env: BotEnv) -> anyhow::Result<()> {
    let addr = format!("127.0.0.1:{}", env.config.internal_api_port);
    let app = Router::new()
        .route("/share-video", post(share_video))
        .route("/alert", post(alert))
        .route("/scheduled-messages", get(list_scheduled).post(create_scheduled))
        .route("/scheduled-messages/{id}", delete(delete_scheduled))
        .with_state(env);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🌐 Internal API listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn send_plain(env: &BotEnv, channel: ChannelId, content: &str) -> serenity::Result<()> {
    channel
        .send_message(
            &env.http,
            CreateMessage::new()
                .content(content)
                .allowed_mentions(CreateAllowedMentions::new().everyone(false)),
        )
        .await?;
    Ok(())
}

// ─── POST /share-video ───────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ShareVideoRequest {
    url: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
}

async fn share_video(State(env): State<BotEnv>, body: String) -> (StatusCode, String) {
    let Ok(req) = serde_json::from_str::<ShareVideoRequest>(&body) else {
        return (StatusCode::BAD_REQUEST, "Invalid JSON payload".into());
    };

    let fields = [&req.url, &req.title, &req.uploader];
    if fields.iter().any(|f| f.as_deref().map(str::trim).unwrap_or("").is_empty()) {
        return (StatusCode::BAD_REQUEST, "Missing url/title/uploader fields".into());
    }
    let (url, title, uploader) = (
        req.url.unwrap_or_default(),
        req.title.unwrap_or_default(),
        req.uploader.unwrap_or_default(),
    );

    let Some(channel_id) = env.config.share_channel_id else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Share channel is not configured".into());
    };

    info!("📺 New video relayed: {title} ({url}) by {uploader}");
    match send_plain(&env, ChannelId::new(channel_id), &format!("{url}\n**{title}**")).await {
        Ok(()) => (StatusCode::OK, "Video shared successfully".into()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to send message: {e}")),
    }
}

// ─── POST /alert ─────────────────────────────────────────────────────────

async fn alert(State(env): State<BotEnv>, body: String) -> (StatusCode, String) {
    // Invalid or empty bodies default to a change alert.
    let data = serde_json::from_str::<Value>(&body).unwrap_or_else(|_| json!({}));
    let data = if data.is_null() { json!({}) } else { data };
    let Some(data) = data.as_object() else {
        return (StatusCode::BAD_REQUEST, "Invalid JSON payload".into());
    };

    let mut warnings: Vec<String> = Vec::new();
    let raw_type = data
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("change")
        .trim()
        .to_lowercase();
    let alert_type = match raw_type.as_str() {
        "change" | "outage" => raw_type,
        other => {
            warnings.push(format!("Unknown alert type '{other}', defaulted to change"));
            "change".to_string()
        }
    };
    let alert_error = data
        .get("error")
        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let Some(token) = env.registry.begin_alert() else {
        return (StatusCode::CONFLICT, "Alert already running".into());
    };

    let alert_channel = env.config.alert_channel_id.map(ChannelId::new);
    if alert_channel.is_none() {
        warnings.push("Alert channel is not configured".to_string());
    }

    let result = if alert_type == "outage" {
        let mut sent = 0u32;
        if let Some(channel) = alert_channel {
            let mut message = OUTAGE_ALERT_MESSAGE.to_string();
            if let Some(err) = &alert_error {
                message.push_str(&format!("\nError: {err}"));
            }
            match send_plain(&env, channel, &message).await {
                Ok(()) => sent = 1,
                Err(e) => warnings.push(format!("Failed to send outage alert: {e}")),
            }
        }
        if sent == 0 {
            let details = join_or(&warnings, "No alert target available");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Outage alert failed: {details}"))
        } else {
            let mut details = format!("chat_messages={sent}");
            if !warnings.is_empty() {
                details = format!("{details}, warnings={}", warnings.join("; "));
            }
            (StatusCode::OK, format!("Outage alert sent ({details})"))
        }
    } else {
        let (chat, voice) = tokio::join!(
            repeat_chat_alert(&env, &token, alert_channel),
            sweep_voice_alert(&env, &token),
        );
        let (chat_messages, chat_warnings) = chat;
        let (voice_alerts, voice_warnings) = voice;
        warnings.extend(chat_warnings);
        warnings.extend(voice_warnings);
        let stopped = token.is_cancelled();

        if stopped && chat_messages == 0 && voice_alerts == 0 {
            let details = join_or(&warnings, "Stopped by heel");
            (StatusCode::OK, format!("Alert stopped ({details})"))
        } else if chat_messages == 0 && voice_alerts == 0 {
            let details = join_or(&warnings, "No alert targets available");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Alert failed: {details}"))
        } else {
            let mut details = format!(
                "chat_sent={}, chat_messages={chat_messages}, voice_alerts={voice_alerts}",
                chat_messages > 0
            );
            if stopped {
                details = format!("{details}, stopped=true");
            }
            if !warnings.is_empty() {
                details = format!("{details}, warnings={}", warnings.join("; "));
            }
            (StatusCode::OK, format!("Alert triggered ({details})"))
        }
    };

    env.registry.end_alert();
    result
}

fn join_or(warnings: &[String], fallback: &str) -> String {
    if warnings.is_empty() {
        fallback.to_string()
    } else {
        warnings.join("; ")
    }
}

/// Hammers the alert channel with the change message, one second apart,
/// until the count is reached or the alert is cancelled.
async fn repeat_chat_alert(
    env: &BotEnv,
    token: &CancellationToken,
    channel: Option<ChannelId>,
) -> (u32, Vec<String>) {
    let mut sent = 0u32;
    let mut warnings = Vec::new();
    let Some(channel) = channel else {
        return (sent, warnings);
    };

    for _ in 0..env.config.alert_repeat_count {
        if token.is_cancelled() {
            break;
        }
        if let Err(e) = send_plain(env, channel, CHANGE_ALERT_MESSAGE).await {
            warnings.push(format!("Failed to send chat alert: {e}"));
            break;
        }
        sent += 1;
        if sent < env.config.alert_repeat_count {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
    (sent, warnings)
}

/// Plays the alert sound in every guild that has listeners, one guild at a
/// time, preferring the channel the bot already sits in.
async fn sweep_voice_alert(env: &BotEnv, token: &CancellationToken) -> (u32, Vec<String>) {
    let mut played = 0u32;
    let mut warnings = Vec::new();

    let sound = &env.config.alert_sound_file;
    if !sound.exists() {
        warnings.push(format!("Alert sound file not found: {}", sound.display()));
        return (played, warnings);
    }

    for guild_id in env.cache.guilds() {
        if token.is_cancelled() {
            break;
        }

        let candidates = populated_voice_channels(env, guild_id);
        let Some(&(first, _)) = candidates.first() else {
            continue;
        };
        let current = bot_voice_channel(env, guild_id);
        let target = current
            .filter(|c| candidates.iter().any(|(id, _)| id == c))
            .unwrap_or(first);
        let already_connected = env.songbird.get(guild_id).is_some();

        // join() also moves the bot when it is parked in another channel.
        let call = match env.songbird.join(guild_id, target).await {
            Ok(call) => call,
            Err(e) => {
                warnings.push(format!("guild {guild_id}: join failed: {e:?}"));
                continue;
            }
        };
        let mixer = env.registry.get_or_create_mixer(guild_id, &call).await;
        match FfmpegPcmSource::file(sound) {
            Ok(source) => mixer.add_effect(Box::new(source)),
            Err(e) => {
                warnings.push(format!("guild {guild_id}: {e:#}"));
                continue;
            }
        }

        let poll = std::time::Duration::from_millis(env.config.effect_poll_ms);
        while mixer.has_effects() {
            if token.is_cancelled() {
                mixer.clear_effects();
                break;
            }
            tokio::time::sleep(poll).await;
        }

        if !already_connected && !mixer.has_main() {
            if let Err(e) = env.songbird.remove(guild_id).await {
                warnings.push(format!("guild {guild_id}: leave failed: {e:?}"));
            }
        }
        played += 1;
    }
    (played, warnings)
}

// ─── /scheduled-messages ─────────────────────────────────────────────────

async fn list_scheduled(State(env): State<BotEnv>) -> Json<Value> {
    let store = env.schedule_store.lock().await;
    Json(json!({ "items": store.items() }))
}

fn normalize_channel_id(raw: Option<&Value>) -> Option<u64> {
    let id = match raw? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}

async fn create_scheduled(
    State(env): State<BotEnv>,
    body: String,
) -> Result<(StatusCode, Json<ScheduledMessage>), (StatusCode, String)> {
    let data = serde_json::from_str::<Value>(&body)
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid JSON payload".to_string()))?;
    let data = data
        .as_object()
        .ok_or((StatusCode::BAD_REQUEST, "Invalid request format".to_string()))?;

    let message = data
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if message.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "A message is required".into()));
    }
    if message.chars().count() > 2000 {
        return Err((StatusCode::BAD_REQUEST, "The message must be at most 2000 characters".into()));
    }

    let raw_scheduled_at = data.get("scheduled_at").and_then(Value::as_str).unwrap_or("");
    let base_scheduled_at = parse_schedule_datetime(raw_scheduled_at).ok_or((
        StatusCode::BAD_REQUEST,
        "scheduled_at must be a valid datetime (e.g. 2026-03-02T19:30)".to_string(),
    ))?;

    let channel_id = match normalize_channel_id(data.get("channel_id")) {
        Some(id) => id,
        None => env.config.share_channel_id.ok_or((
            StatusCode::BAD_REQUEST,
            "channel_id is required because no default share channel is configured".to_string(),
        ))?,
    };

    let recurrence =
        normalize_recurrence(data.get("recurrence").and_then(Value::as_str).unwrap_or("yearly"));
    let now = Local::now();
    let scheduled_at = resolve_effective_schedule(&base_scheduled_at, recurrence, &now)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let item = ScheduledMessage {
        id: Uuid::new_v4().to_string(),
        channel_id,
        message,
        scheduled_at: format_schedule_datetime(&scheduled_at),
        base_scheduled_at: format_schedule_datetime(&base_scheduled_at),
        status: DeliveryStatus::Pending,
        recurrence,
        created_at: format_schedule_datetime(&now),
        processed_at: None,
        last_sent_at: None,
        last_error: None,
    };

    let mut store = env.schedule_store.lock().await;
    store.insert(item.clone());
    if let Err(e) = store.save() {
        warn!("Failed to save scheduled messages: {e:#}");
    }
    Ok((StatusCode::CREATED, Json(item)))
}

async fn delete_scheduled(
    State(env): State<BotEnv>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let mut store = env.schedule_store.lock().await;
    let removed = store
        .remove(id.trim())
        .ok_or((StatusCode::NOT_FOUND, "Scheduled message not found".to_string()))?;
    if let Err(e) = store.save() {
        warn!("Failed to save scheduled messages: {e:#}");
    }
    Ok(Json(json!({ "deleted": removed.id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn channel_id_accepts_numbers_and_strings() {
        assert_eq!(normalize_channel_id(Some(&json!(42))), Some(42));
        assert_eq!(normalize_channel_id(Some(&json!("42"))), Some(42));
        assert_eq!(normalize_channel_id(Some(&json!(" 42 "))), Some(42));
        assert_eq!(normalize_channel_id(Some(&json!(0))), None);
        assert_eq!(normalize_channel_id(Some(&json!(""))), None);
        assert_eq!(normalize_channel_id(Some(&json!(null))), None);
        assert_eq!(normalize_channel_id(None), None);
    }

    #[test]
    fn warnings_join_with_fallback() {
        assert_eq!(join_or(&[], "nothing"), "nothing");
        assert_eq!(join_or(&["a".into(), "b".into()], "nothing"), "a; b");
    }

    #[test]
    fn share_request_tolerates_missing_fields() {
        let req: ShareVideoRequest = serde_json::from_str("{}").expect("empty object");
        assert!(req.url.is_none());
        let req: ShareVideoRequest =
            serde_json::from_str(r#"{"url": "u", "title": "t", "uploader": ""}"#).expect("partial");
        assert_eq!(req.uploader.as_deref(), Some(""));
    }
}
