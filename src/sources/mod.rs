//! Audio source backends. Everything funnels into [`crate::audio::PcmSource`]:
//! an ffmpeg child process decodes files and remote streams to raw 48kHz
//! stereo PCM, [`ytdlp`] resolves queries and URLs to streamable media,
//! [`tts`] synthesizes speech clips, and [`local`] serves the on-disk library.

pub mod ffmpeg;
pub mod local;
pub mod tts;
pub mod ytdlp;
