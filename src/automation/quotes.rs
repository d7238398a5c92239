//! Daily quote from a chat-export file.
//!
//! The file is a plain text chat export: a `[dd.MM.yyyy HH:mm]` timestamp
//! line, then the message lines. Only the first line after each timestamp
//! counts as a quote; attachment/reaction markers and bare links are skipped.

use std::path::Path;
use std::sync::LazyLock;

use chrono::{Duration as ChronoDuration, Local, NaiveTime, Timelike};
use rand::seq::SliceRandom;
use regex::Regex;
use serenity::all::ChannelId;
use tracing::{info, warn};

use crate::bot::BotEnv;

static TIMESTAMP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\d{2}\.\d{2}\.\d{4} \d{2}:\d{2}\]").expect("literal pattern")
});

pub fn parse_quotes(text: &str) -> Vec<String> {
    let mut quotes = Vec::new();
    let mut expecting_quote = false;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if TIMESTAMP_LINE.is_match(line) {
            expecting_quote = true;
            continue;
        }
        if !expecting_quote {
            continue;
        }
        if line.is_empty() || line == "{Attachments}" || line == "{Reactions}" {
            continue;
        }
        if line.to_lowercase().starts_with("http") {
            continue;
        }
        quotes.push(line.to_string());
        expecting_quote = false;
    }
    quotes
}

pub fn load_quotes(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_quotes(&text),
        Err(_) => {
            warn!("Quote file not found: {}", path.display());
            Vec::new()
        }
    }
}

pub fn pick_random_quote(path: &Path, rng: &mut impl rand::Rng) -> Option<String> {
    load_quotes(path).choose(rng).cloned()
}

/// Posts one quote to `channel_id`, or an apology when the file is empty.
pub async fn send_daily_quote(env: &BotEnv, channel_id: ChannelId) {
    let message = match pick_random_quote(&env.config.quotes_file, &mut rand::thread_rng()) {
        Some(quote) => format!("Quote of the day: \"{quote}\""),
        None => "No quote available for today.".to_string(),
    };
    if let Err(e) = channel_id.say(&env.http, message).await {
        warn!("Failed to post the daily quote: {e:?}");
    }
}

/// Fires at 12:00 local time, every day.
pub async fn daily_quote_loop(env: BotEnv) {
    let Some(channel_id) = env.config.quotes_channel_id.map(ChannelId::new) else {
        info!("No quote channel configured, daily quote disabled");
        return;
    };

    loop {
        let now = Local::now();
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap_or_default();
        let mut target = now.date_naive().and_time(noon);
        if now.time().hour() >= 12 {
            target += ChronoDuration::days(1);
        }
        let wait = (target - now.naive_local())
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(60));
        info!("🕛 Next daily quote in {}s", wait.as_secs());
        tokio::time::sleep(wait).await;

        send_daily_quote(&env, channel_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const EXPORT: &str = "\
[01.02.2024 18:45]
this line is a quote
this trailing line is ignored
[02.02.2024 09:12]
{Attachments}

https://example.com/link
another quote
[03.02.2024 10:00]
[04.02.2024 11:00]
late quote
";

    #[test]
    fn takes_one_line_per_timestamp() {
        assert_eq!(
            parse_quotes(EXPORT),
            vec!["this line is a quote", "another quote", "late quote"]
        );
    }

    #[test]
    fn skips_markers_blanks_and_links() {
        let text = "[01.01.2020 00:00]\n{Reactions}\nhttp://x\nHTTPS://y\nreal one\n";
        assert_eq!(parse_quotes(text), vec!["real one"]);
    }

    #[test]
    fn lines_before_any_timestamp_are_ignored() {
        assert!(parse_quotes("hello\nworld\n").is_empty());
        assert!(parse_quotes("").is_empty());
    }

    #[test]
    fn missing_file_is_an_empty_quote_list() {
        assert!(load_quotes(Path::new("/nonexistent/quotes.txt")).is_empty());
    }
}
