//! Speech synthesis via the Google Translate TTS endpoint.
//!
//! The endpoint caps one request at roughly 200 characters, so longer texts
//! are split on word boundaries and the MP3 payloads concatenated; MP3 frames
//! are self-contained, so ffmpeg plays the joined file straight through.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tempfile::NamedTempFile;
use tracing::info;

const MAX_CHUNK_CHARS: usize = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Synthesizes `text` and writes the MP3 to a temp file. The file is deleted
/// when the returned handle drops, so keep it alive for the whole playback.
pub async fn synthesize(client: &reqwest::Client, text: &str, lang: &str) -> Result<NamedTempFile> {
    let chunks = chunk_text(text, MAX_CHUNK_CHARS);
    if chunks.is_empty() {
        bail!("nothing to say");
    }

    info!("🗣️ Synthesizing {} chars of speech ({lang})", text.len());
    let mut file = NamedTempFile::with_suffix(".mp3").context("failed to create temp file")?;
    for chunk in &chunks {
        let url = format!(
            "https://translate.google.com/translate_tts?ie=UTF-8&client=tw-ob&tl={lang}&q={}",
            urlencoding::encode(chunk),
        );
        let bytes = client
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("speech request failed")?
            .error_for_status()
            .context("speech service rejected the request")?
            .bytes()
            .await
            .context("failed to download speech audio")?;
        file.write_all(&bytes).context("failed to write speech audio")?;
    }
    file.flush().context("failed to flush speech audio")?;

    Ok(file)
}

/// Splits on whitespace into chunks of at most `limit` characters. A single
/// overlong word becomes its own chunk rather than being dropped.
fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
        } else if current.chars().count() + 1 + word.chars().count() <= limit {
            current.push(' ');
            current.push_str(word);
        } else {
            chunks.push(std::mem::take(&mut current));
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello there", 200), vec!["hello there"]);
    }

    #[test]
    fn splits_on_word_boundaries() {
        let chunks = chunk_text("aaa bbb ccc ddd", 7);
        assert_eq!(chunks, vec!["aaa bbb", "ccc ddd"]);
    }

    #[test]
    fn overlong_word_stands_alone() {
        let long = "x".repeat(30);
        let chunks = chunk_text(&format!("short {long} tail"), 10);
        assert_eq!(chunks, vec!["short".to_string(), long, "tail".to_string()]);
    }

    #[test]
    fn blank_text_yields_no_chunks() {
        assert!(chunk_text("   \n\t ", 200).is_empty());
    }
}
