//! JSON persistence for scheduled messages and the prank day-marker.
//!
//! The scheduled-message file is a plain JSON array edited by the HTTP API
//! and the dispatch loop. Loading is deliberately tolerant: entries that are
//! malformed or incomplete are skipped instead of failing the whole file, and
//! stuck `processing` markers from a crash roll back to `pending`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("a one-shot message must be scheduled in the future")]
    OneShotInPast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Processing,
    Sent,
    Failed,
}

impl DeliveryStatus {
    fn sort_rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Failed => 2,
            Self::Sent => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    #[default]
    None,
    Yearly,
}

/// Accepts the spellings older files and external callers use.
pub fn normalize_recurrence(raw: &str) -> Recurrence {
    match raw.trim().to_lowercase().as_str() {
        "yearly" | "annual" | "year" | "yearly_repeat" => Recurrence::Yearly,
        _ => Recurrence::None,
    }
}

/// One scheduled delivery. Datetimes are stored as ISO strings with offset,
/// exactly as they serialize, so the file stays hand-editable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: String,
    pub channel_id: u64,
    pub message: String,
    /// Next delivery time; rolled forward after each yearly send.
    pub scheduled_at: String,
    /// The original event time; drives the `{datum}` elapsed-years token.
    pub base_scheduled_at: String,
    pub status: DeliveryStatus,
    pub recurrence: Recurrence,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub last_sent_at: Option<String>,
    pub last_error: Option<String>,
}

impl ScheduledMessage {
    pub fn scheduled_at(&self) -> Option<DateTime<Local>> {
        parse_schedule_datetime(&self.scheduled_at)
    }

    pub fn base_scheduled_at(&self) -> Option<DateTime<Local>> {
        parse_schedule_datetime(&self.base_scheduled_at)
    }

    /// Tolerant single-entry loader; `None` drops the entry.
    fn from_value(raw: &Value) -> Option<Self> {
        let raw = raw.as_object()?;

        let message = raw.get("message").and_then(Value::as_str)?.trim().to_string();
        if message.is_empty() {
            return None;
        }
        let channel_id = parse_channel_id(raw.get("channel_id"))?;
        let scheduled_at =
            parse_schedule_datetime(raw.get("scheduled_at").and_then(Value::as_str)?)?;
        let base_scheduled_at = raw
            .get("base_scheduled_at")
            .or_else(|| raw.get("origin_scheduled_at"))
            .and_then(Value::as_str)
            .and_then(parse_schedule_datetime)
            .unwrap_or(scheduled_at);

        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut status = match raw.get("status").and_then(Value::as_str) {
            Some(status) => match status.to_lowercase().as_str() {
                "pending" => DeliveryStatus::Pending,
                // A crash mid-dispatch leaves `processing` behind; retry it.
                "processing" => DeliveryStatus::Pending,
                "sent" => DeliveryStatus::Sent,
                "failed" => DeliveryStatus::Failed,
                _ => legacy_status(raw),
            },
            None => legacy_status(raw),
        };
        let recurrence = raw
            .get("recurrence")
            .and_then(Value::as_str)
            .map(normalize_recurrence)
            .unwrap_or_default();
        if recurrence == Recurrence::Yearly && status == DeliveryStatus::Sent {
            status = DeliveryStatus::Pending;
        }

        let created_at = raw
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format_schedule_datetime(&Local::now()));

        Some(Self {
            id,
            channel_id,
            message,
            scheduled_at: format_schedule_datetime(&scheduled_at),
            base_scheduled_at: format_schedule_datetime(&base_scheduled_at),
            status,
            recurrence,
            created_at,
            processed_at: string_field(raw.get("processed_at")),
            last_sent_at: string_field(raw.get("last_sent_at")),
            last_error: string_field(raw.get("last_error")),
        })
    }
}

fn legacy_status(raw: &serde_json::Map<String, Value>) -> DeliveryStatus {
    // Pre-status files carried a boolean `sent` flag.
    if raw.get("sent").and_then(Value::as_bool).unwrap_or(false) {
        DeliveryStatus::Sent
    } else {
        DeliveryStatus::Pending
    }
}

fn parse_channel_id(raw: Option<&Value>) -> Option<u64> {
    let id = match raw? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}

fn string_field(raw: Option<&Value>) -> Option<String> {
    raw.and_then(Value::as_str).map(str::to_string)
}

/// Parses an ISO datetime. A trailing `Z` and naive (offset-less) values are
/// accepted; naive values are taken as local time.
pub fn parse_schedule_datetime(raw: &str) -> Option<DateTime<Local>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    let normalized = match value.strip_suffix('Z') {
        Some(stripped) => format!("{stripped}+00:00"),
        None => value.to_string(),
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(parsed.with_timezone(&Local));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            if let Some(local) = Local.from_local_datetime(&naive).earliest() {
                return Some(local);
            }
        }
    }
    None
}

pub fn format_schedule_datetime(dt: &DateTime<Local>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next
        .and_then(|date| date.pred_opt())
        .map(|date| date.day())
        .unwrap_or(28)
}

/// Same calendar date next year, clamped to the month's length (Feb 29th
/// anniversaries land on Feb 28th).
pub fn next_yearly_occurrence(dt: &DateTime<Local>) -> DateTime<Local> {
    let target_year = dt.year() + 1;
    let target_day = dt.day().min(days_in_month(target_year, dt.month()));
    dt.with_day(1)
        .and_then(|d| d.with_year(target_year))
        .and_then(|d| d.with_day(target_day))
        .unwrap_or_else(|| *dt)
}

/// Whole years between the base event and `reference`, never negative.
pub fn elapsed_years(base: &DateTime<Local>, reference: &DateTime<Local>) -> i32 {
    let mut years = reference.year() - base.year();
    if (reference.month(), reference.day()) < (base.month(), base.day()) {
        years -= 1;
    }
    years.max(0)
}

/// Substitutes the elapsed-years token (both spellings) into the message.
pub fn render_schedule_template(
    template: &str,
    base: Option<&DateTime<Local>>,
    reference: &DateTime<Local>,
) -> String {
    match base {
        Some(base) => {
            let years = elapsed_years(base, reference).to_string();
            template.replace("{dátum}", &years).replace("{datum}", &years)
        }
        None => template.to_string(),
    }
}

/// First actual delivery time for a base event. Yearly events roll forward to
/// the next anniversary; one-shots must already be in the future.
pub fn resolve_effective_schedule(
    base: &DateTime<Local>,
    recurrence: Recurrence,
    now: &DateTime<Local>,
) -> Result<DateTime<Local>, ScheduleError> {
    match recurrence {
        Recurrence::Yearly => {
            let mut scheduled = *base;
            while scheduled <= *now {
                scheduled = next_yearly_occurrence(&scheduled);
            }
            Ok(scheduled)
        }
        Recurrence::None => {
            if *base <= *now {
                return Err(ScheduleError::OneShotInPast);
            }
            Ok(*base)
        }
    }
}

/// The scheduled-message file. Not internally synchronized; the owner wraps
/// it in a lock shared by the API handlers and the dispatch loop.
pub struct ScheduleStore {
    path: PathBuf,
    items: Vec<ScheduledMessage>,
}

impl ScheduleStore {
    pub fn load(path: PathBuf) -> Self {
        let items = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Array(raw_items)) => {
                    let items: Vec<ScheduledMessage> =
                        raw_items.iter().filter_map(ScheduledMessage::from_value).collect();
                    info!("📋 Loaded {} scheduled messages from {}", items.len(), path.display());
                    items
                }
                Ok(_) => {
                    warn!("Scheduled message file {} is not a list; starting empty", path.display());
                    Vec::new()
                }
                Err(e) => {
                    warn!("Scheduled message file {} is corrupt ({e}); starting empty", path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        let mut store = Self { path, items };
        store.sort();
        store
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.items)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    fn sort(&mut self) {
        self.items.sort_by(|a, b| {
            (a.status.sort_rank(), &a.scheduled_at).cmp(&(b.status.sort_rank(), &b.scheduled_at))
        });
    }

    pub fn items(&self) -> &[ScheduledMessage] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&ScheduledMessage> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ScheduledMessage> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    pub fn insert(&mut self, item: ScheduledMessage) {
        self.items.push(item);
        self.sort();
    }

    pub fn resort(&mut self) {
        self.sort();
    }

    pub fn remove(&mut self, id: &str) -> Option<ScheduledMessage> {
        let index = self.items.iter().position(|item| item.id == id)?;
        Some(self.items.remove(index))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PrankStateFile {
    last_prank_date: Option<NaiveDate>,
}

pub fn load_last_prank_date(path: &Path) -> Option<NaiveDate> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice::<PrankStateFile>(&bytes).ok()?.last_prank_date
}

pub fn save_last_prank_date(path: &Path, date: NaiveDate) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let state = PrankStateFile { last_prank_date: Some(date) };
    std::fs::write(path, serde_json::to_string(&state)?)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn parse_accepts_naive_offset_and_zulu() {
        assert!(parse_schedule_datetime("2026-03-02T19:30").is_some());
        assert!(parse_schedule_datetime("2026-03-02T19:30:00").is_some());
        assert!(parse_schedule_datetime("2026-03-02T19:30:00+01:00").is_some());
        assert!(parse_schedule_datetime("2026-03-02T18:30:00Z").is_some());
        assert!(parse_schedule_datetime("").is_none());
        assert!(parse_schedule_datetime("not a date").is_none());
    }

    #[test]
    fn yearly_occurrence_clamps_leap_day() {
        let leap = local(2024, 2, 29, 12, 0);
        let next = next_yearly_occurrence(&leap);
        assert_eq!((next.year(), next.month(), next.day()), (2025, 2, 28));
        assert_eq!(next.hour(), 12);

        let plain = local(2025, 6, 15, 9, 30);
        let next = next_yearly_occurrence(&plain);
        assert_eq!((next.year(), next.month(), next.day()), (2026, 6, 15));
    }

    #[test]
    fn elapsed_years_counts_whole_anniversaries() {
        let base = local(2017, 9, 10, 18, 0);
        assert_eq!(elapsed_years(&base, &local(2026, 9, 10, 0, 0)), 9);
        assert_eq!(elapsed_years(&base, &local(2026, 9, 9, 23, 59)), 8);
        assert_eq!(elapsed_years(&base, &local(2016, 1, 1, 0, 0)), 0);
    }

    #[test]
    fn template_substitutes_both_token_spellings() {
        let base = local(2017, 9, 10, 18, 0);
        let now = local(2026, 9, 10, 12, 0);
        assert_eq!(
            render_schedule_template("{datum} years! ({dátum})", Some(&base), &now),
            "9 years! (9)"
        );
        assert_eq!(render_schedule_template("{datum} years", None, &now), "{datum} years");
    }

    #[test]
    fn effective_schedule_rolls_yearly_forward_and_rejects_past_one_shots() {
        let now = local(2026, 8, 27, 12, 0);
        let past = local(2017, 9, 10, 18, 0);

        let next = resolve_effective_schedule(&past, Recurrence::Yearly, &now).expect("yearly");
        assert_eq!((next.year(), next.month(), next.day()), (2026, 9, 10));

        assert!(matches!(
            resolve_effective_schedule(&past, Recurrence::None, &now),
            Err(ScheduleError::OneShotInPast)
        ));
        let future = local(2026, 8, 28, 12, 0);
        assert!(resolve_effective_schedule(&future, Recurrence::None, &now).is_ok());
    }

    #[test]
    fn loader_skips_junk_and_rolls_back_processing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("scheduled.json");
        let raw = json!([
            {"id": "a", "channel_id": 1, "message": "ok", "scheduled_at": "2026-03-02T19:30", "status": "processing"},
            {"id": "b", "channel_id": "2", "message": "yearly done", "scheduled_at": "2026-03-02T19:30", "status": "sent", "recurrence": "yearly"},
            {"id": "c", "channel_id": 3, "message": "legacy", "scheduled_at": "2026-03-02T19:30", "sent": true},
            {"id": "d", "channel_id": 4, "message": "", "scheduled_at": "2026-03-02T19:30"},
            {"id": "e", "channel_id": 0, "message": "bad channel", "scheduled_at": "2026-03-02T19:30"},
            {"id": "f", "channel_id": 5, "message": "bad date", "scheduled_at": "soon"},
            "not an object"
        ]);
        std::fs::write(&path, raw.to_string()).expect("write fixture");

        let store = ScheduleStore::load(path);
        let by_id: Vec<(&str, DeliveryStatus, Recurrence)> = store
            .items()
            .iter()
            .map(|i| (i.id.as_str(), i.status, i.recurrence))
            .collect();

        assert_eq!(
            by_id,
            vec![
                ("a", DeliveryStatus::Pending, Recurrence::None),
                ("b", DeliveryStatus::Pending, Recurrence::Yearly),
                ("c", DeliveryStatus::Sent, Recurrence::None),
            ]
        );
        assert_eq!(store.items()[1].channel_id, 2, "string channel ids parse");
    }

    #[test]
    fn corrupt_or_missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("temp dir");

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{not json").expect("write fixture");
        assert!(ScheduleStore::load(corrupt).items().is_empty());

        let not_a_list = dir.path().join("object.json");
        std::fs::write(&not_a_list, "{}").expect("write fixture");
        assert!(ScheduleStore::load(not_a_list).items().is_empty());

        assert!(ScheduleStore::load(dir.path().join("missing.json")).items().is_empty());
    }

    #[test]
    fn store_round_trips_and_sorts_pending_first() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("scheduled.json");
        let mut store = ScheduleStore::load(path.clone());

        let template = ScheduledMessage {
            id: "sent".into(),
            channel_id: 1,
            message: "hello".into(),
            scheduled_at: format_schedule_datetime(&local(2026, 1, 1, 10, 0)),
            base_scheduled_at: format_schedule_datetime(&local(2026, 1, 1, 10, 0)),
            status: DeliveryStatus::Sent,
            recurrence: Recurrence::None,
            created_at: format_schedule_datetime(&local(2025, 12, 1, 10, 0)),
            processed_at: None,
            last_sent_at: None,
            last_error: None,
        };
        store.insert(template.clone());
        store.insert(ScheduledMessage {
            id: "pending".into(),
            status: DeliveryStatus::Pending,
            ..template.clone()
        });
        store.save().expect("save");

        let reloaded = ScheduleStore::load(path);
        let ids: Vec<&str> = reloaded.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["pending", "sent"]);
    }

    #[test]
    fn prank_state_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("prank_state.json");

        assert!(load_last_prank_date(&path).is_none());
        let date = NaiveDate::from_ymd_opt(2026, 8, 27).expect("valid date");
        save_last_prank_date(&path, date).expect("save");
        assert_eq!(load_last_prank_date(&path), Some(date));

        std::fs::write(&path, "garbage").expect("write fixture");
        assert!(load_last_prank_date(&path).is_none());
    }
}
