//! PCM decoding through an ffmpeg child process.
//!
//! ffmpeg writes interleaved s16le 48kHz stereo to its stdout and this side
//! reads it frame by frame. Reads happen on the voice driver's audio thread,
//! so they are plain blocking reads against the pipe.

use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use tracing::warn;

use crate::audio::{PcmSource, CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};

const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

pub struct FfmpegPcmSource {
    child: Child,
    stdout: ChildStdout,
    label: String,
    finished: bool,
}

impl FfmpegPcmSource {
    /// Decodes a local file once, start to finish.
    pub fn file(path: &Path) -> Result<Self> {
        Self::spawn(path.to_string_lossy().as_ref(), &[], display_name(path))
    }

    /// Decodes a local file in an endless loop. The source never reports
    /// end-of-stream on its own; the owner stops it by dropping it.
    pub fn file_looped(path: &Path) -> Result<Self> {
        Self::spawn(
            path.to_string_lossy().as_ref(),
            &["-stream_loop".into(), "-1".into()],
            display_name(path),
        )
    }

    /// Streams a remote URL with reconnect handling, forwarding any HTTP
    /// headers the resolver extracted.
    pub fn url(url: &str, title: &str, headers: &[(String, String)]) -> Result<Self> {
        let mut before = vec![
            "-reconnect".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            "5".into(),
        ];
        if !headers.is_empty() {
            let blob: String = headers
                .iter()
                .map(|(key, value)| format!("{key}: {value}\r\n"))
                .collect();
            before.push("-headers".into());
            before.push(blob);
        }
        Self::spawn(url, &before, title.to_string())
    }

    fn spawn(input: &str, before_input: &[String], label: String) -> Result<Self> {
        let mut command = Command::new("ffmpeg");
        command
            .arg("-loglevel")
            .arg("error")
            .args(before_input)
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg(CHANNELS.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn ffmpeg for '{label}'"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout was not captured"))?;

        Ok(Self {
            child,
            stdout,
            label,
            finished: false,
        })
    }
}

impl PcmSource for FfmpegPcmSource {
    fn next_chunk(&mut self) -> Result<Option<Vec<i16>>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; FRAME_BYTES];
        let mut filled = 0;
        while filled < FRAME_BYTES {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Err(e).with_context(|| format!("read from ffmpeg ('{}')", self.label));
                }
            }
        }

        if filled == 0 {
            self.finished = true;
            return Ok(None);
        }

        // A trailing partial frame plays out zero-padded.
        let samples = buf[..filled - filled % 2]
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Some(samples))
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for FfmpegPcmSource {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!("Failed to kill ffmpeg for '{}': {e}", self.label);
            }
        }
        let _ = self.child.wait();
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_name_strips_directories() {
        assert_eq!(display_name(Path::new("/data/music/song.mp3")), "song.mp3");
        assert_eq!(display_name(Path::new("song.mp3")), "song.mp3");
    }
}
