//! Scheduled-message dispatch.
//!
//! Every poll interval the loop claims due `Pending` items by flipping them
//! to `Processing` under the store lock, sends them outside it, then records
//! the outcome. Yearly items re-arm to the next anniversary instead of going
//! to `Sent`, so they survive indefinitely.

use chrono::Local;
use serenity::all::{ChannelId, CreateAllowedMentions, CreateMessage};
use tracing::{error, info};

use crate::bot::BotEnv;
use crate::storage::{
    format_schedule_datetime, next_yearly_occurrence, render_schedule_template,
    DeliveryStatus, Recurrence, ScheduledMessage,
};

pub async fn dispatch_loop(env: BotEnv) {
    let poll = std::time::Duration::from_secs(env.config.scheduler_poll_secs);
    loop {
        run_once(&env).await;
        tokio::time::sleep(poll).await;
    }
}

/// One poll pass. Split out so tests and the loop share the exact same
/// claiming logic.
pub async fn run_once(env: &BotEnv) {
    let due_ids = claim_due(env).await;

    for id in due_ids {
        let snapshot = {
            let store = env.schedule_store.lock().await;
            store.get(&id).cloned()
        };
        let Some(item) = snapshot else { continue };

        let outcome = dispatch_one(env, &item).await;
        record_outcome(env, &id, outcome).await;
    }
}

/// Marks due pending items `Processing` and returns their ids. Items whose
/// stored datetime no longer parses go straight to `Failed`.
async fn claim_due(env: &BotEnv) -> Vec<String> {
    let now = Local::now();
    let mut due_ids = Vec::new();
    let mut store = env.schedule_store.lock().await;
    let mut dirty = false;

    for item in store.items().to_vec() {
        if item.status != DeliveryStatus::Pending {
            continue;
        }
        let Some(scheduled_at) = item.scheduled_at() else {
            if let Some(entry) = store.get_mut(&item.id) {
                entry.status = DeliveryStatus::Failed;
                entry.processed_at = Some(format_schedule_datetime(&now));
                entry.last_error = Some("stored datetime is unreadable".to_string());
                dirty = true;
            }
            continue;
        };
        if scheduled_at <= now {
            if let Some(entry) = store.get_mut(&item.id) {
                entry.status = DeliveryStatus::Processing;
                due_ids.push(item.id.clone());
                dirty = true;
            }
        }
    }

    if dirty {
        if let Err(e) = store.save() {
            error!("Failed to persist scheduled messages: {e:#}");
        }
    }
    due_ids
}

async fn dispatch_one(env: &BotEnv, item: &ScheduledMessage) -> Result<(), String> {
    let rendered = render_schedule_template(
        &item.message,
        item.base_scheduled_at().as_ref(),
        &Local::now(),
    );
    let message = CreateMessage::new()
        .content(rendered)
        .allowed_mentions(CreateAllowedMentions::new().everyone(false));
    ChannelId::new(item.channel_id)
        .send_message(&env.http, message)
        .await
        .map(|_| ())
        .map_err(|e| format!("failed to send to channel {}: {e}", item.channel_id))
}

async fn record_outcome(env: &BotEnv, id: &str, outcome: Result<(), String>) {
    let now = Local::now();
    let mut store = env.schedule_store.lock().await;
    let Some(entry) = store.get_mut(id) else { return };

    entry.processed_at = Some(format_schedule_datetime(&now));
    match outcome {
        Ok(()) => {
            entry.last_sent_at = Some(format_schedule_datetime(&now));
            entry.last_error = None;
            if entry.recurrence == Recurrence::Yearly {
                let mut next = entry
                    .scheduled_at()
                    .map(|at| next_yearly_occurrence(&at))
                    .unwrap_or_else(|| next_yearly_occurrence(&now));
                while next <= now {
                    next = next_yearly_occurrence(&next);
                }
                entry.scheduled_at = format_schedule_datetime(&next);
                entry.status = DeliveryStatus::Pending;
                info!("📅 Yearly message {id} re-armed for {}", entry.scheduled_at);
            } else {
                entry.status = DeliveryStatus::Sent;
                info!("📨 Scheduled message {id} delivered");
            }
        }
        Err(reason) => {
            entry.status = DeliveryStatus::Failed;
            entry.last_error = Some(reason.clone());
            error!("Scheduled message {id} failed: {reason}");
        }
    }

    store.resort();
    if let Err(e) = store.save() {
        error!("Failed to persist scheduled messages: {e:#}");
    }
}
