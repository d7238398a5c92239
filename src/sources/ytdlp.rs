//! Track resolution through the `yt-dlp` binary.
//!
//! `yt-dlp -J` prints one JSON document with the selected format's direct
//! media URL plus the HTTP headers the CDN expects; playback then streams
//! that URL through ffmpeg. Searches ride on yt-dlp's `default_search`, so a
//! bare query resolves the same way a pasted URL does.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTrack {
    pub title: String,
    pub stream_url: String,
    pub webpage_url: Option<String>,
    pub http_headers: Vec<(String, String)>,
    pub duration_secs: Option<f64>,
}

/// Resolves a URL or free-text query to a streamable track. Kills the
/// resolver and fails when it exceeds `timeout`.
pub async fn resolve(query: &str, timeout: Duration) -> Result<ResolvedTrack> {
    info!("🔍 Resolving: {query}");

    // Free-text queries fan out to the top 5 search results; the first one
    // with a playable format wins.
    let query = if query.starts_with("http") {
        query.to_string()
    } else {
        format!("ytsearch5:{query}")
    };

    let mut command = Command::new("yt-dlp");
    command
        .arg("-J")
        .arg("--no-playlist")
        .arg("--no-warnings")
        .arg("--quiet")
        .arg("-f")
        .arg("bestaudio/best")
        .arg("--default-search")
        .arg("ytsearch")
        .arg("--socket-timeout")
        .arg("15")
        .arg("--retries")
        .arg("4")
        .arg("--")
        .arg(&query)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| anyhow!("resolving '{query}' took too long"))?
        .context("failed to run yt-dlp")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("yt-dlp failed for '{query}': {}", first_line(&stderr));
    }

    let value: Value =
        serde_json::from_slice(&output.stdout).context("yt-dlp produced invalid JSON")?;
    parse_metadata(value)
}

/// Extracts the playable track from a yt-dlp JSON dump. Search results come
/// wrapped in an `entries` array; the first entry with a resolved media URL
/// wins.
fn parse_metadata(mut value: Value) -> Result<ResolvedTrack> {
    if let Some(entries) = value.get_mut("entries").and_then(Value::as_array_mut) {
        let first = entries
            .iter_mut()
            .find(|entry| entry.get("url").and_then(Value::as_str).is_some())
            .map(Value::take);
        value = first.ok_or_else(|| anyhow!("no playable result found"))?;
    }

    let stream_url = value
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("no playable result found"))?
        .to_string();
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Unknown title")
        .to_string();
    let webpage_url = value
        .get("webpage_url")
        .and_then(Value::as_str)
        .map(str::to_string);
    let duration_secs = value.get("duration").and_then(Value::as_f64);
    let http_headers = value
        .get("http_headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(key, val)| val.as_str().map(|v| (key.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(ResolvedTrack {
        title,
        stream_url,
        webpage_url,
        http_headers,
        duration_secs,
    })
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("unknown error").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_a_direct_dump() {
        let track = parse_metadata(json!({
            "title": "Test Song",
            "url": "https://cdn.example/audio.webm",
            "webpage_url": "https://example.com/watch?v=1",
            "duration": 213.4,
            "http_headers": {"User-Agent": "Mozilla/5.0", "Accept": "*/*"},
        }))
        .expect("valid dump");

        assert_eq!(track.title, "Test Song");
        assert_eq!(track.stream_url, "https://cdn.example/audio.webm");
        assert_eq!(track.webpage_url.as_deref(), Some("https://example.com/watch?v=1"));
        assert_eq!(track.duration_secs, Some(213.4));
        assert!(track
            .http_headers
            .iter()
            .any(|(k, v)| k == "User-Agent" && v == "Mozilla/5.0"));
    }

    #[test]
    fn unwraps_the_first_playable_search_entry() {
        let track = parse_metadata(json!({
            "entries": [
                null,
                {"title": "No format resolved"},
                {"title": "Hit", "url": "https://cdn.example/hit"},
                {"title": "Ignored", "url": "https://cdn.example/ignored"},
            ],
        }))
        .expect("valid search dump");

        assert_eq!(track.title, "Hit");
        assert_eq!(track.stream_url, "https://cdn.example/hit");
    }

    #[test]
    fn missing_fields_fall_back_or_fail() {
        let track = parse_metadata(json!({"url": "https://cdn.example/x"})).expect("url is enough");
        assert_eq!(track.title, "Unknown title");
        assert!(track.http_headers.is_empty());

        assert!(parse_metadata(json!({"title": "no url"})).is_err());
        assert!(parse_metadata(json!({"entries": [null, null]})).is_err());
    }
}
