use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub command_prefix: String,

    // Channels for automation (optional - the loops that need them idle when unset)
    pub share_channel_id: Option<u64>,
    pub quotes_channel_id: Option<u64>,
    pub alert_channel_id: Option<u64>,

    // Internal HTTP API
    pub internal_api_port: u16,
    pub alert_repeat_count: u32,

    // Paths
    pub data_dir: PathBuf,
    pub music_dir: PathBuf,
    pub sounds_dir: PathBuf,
    pub jimmy_dir: PathBuf,
    pub roulette_sounds_dir: PathBuf,
    pub quotes_file: PathBuf,
    pub alert_sound_file: PathBuf,

    // Game
    pub turn_timeout_secs: u64,

    // Voice housekeeping
    pub afk_timeout_secs: u64,
    pub effect_poll_ms: u64,

    // Automation
    pub prank_min_wait_secs: u64,
    pub prank_max_wait_secs: u64,
    pub scheduler_poll_secs: u64,

    // Limits
    pub max_queue_size: usize,
    pub ytdlp_timeout_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN")?,
            command_prefix: std::env::var("COMMAND_PREFIX").unwrap_or_else(|_| "!".to_string()),

            share_channel_id: env_opt_u64("SHARE_CHANNEL_ID"),
            quotes_channel_id: env_opt_u64("QUOTES_CHANNEL_ID"),
            alert_channel_id: env_opt_u64("ALERT_CHANNEL_ID"),

            internal_api_port: std::env::var("INTERNAL_API_PORT")
                .unwrap_or_else(|_| "5050".to_string())
                .parse()?,
            alert_repeat_count: std::env::var("ALERT_REPEAT_COUNT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,

            data_dir: env_path("DATA_DIR", "/app/data"),
            music_dir: env_path("MUSIC_DIR", "music"),
            sounds_dir: env_path("SOUNDS_DIR", "sounds"),
            jimmy_dir: env_path("JIMMY_DIR", "jimmy"),
            roulette_sounds_dir: env_path("ROULETTE_SOUNDS_DIR", "roulette_sounds"),
            quotes_file: env_path("QUOTES_FILE", "quotes/quotes.txt"),
            alert_sound_file: env_path("ALERT_SOUND_FILE", "alert/alert.mp3"),

            turn_timeout_secs: std::env::var("TURN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,

            afk_timeout_secs: std::env::var("AFK_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            effect_poll_ms: std::env::var("EFFECT_POLL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()?,

            prank_min_wait_secs: std::env::var("PRANK_MIN_WAIT_SECS")
                .unwrap_or_else(|_| "1800".to_string()) // 30 minutes
                .parse()?,
            prank_max_wait_secs: std::env::var("PRANK_MAX_WAIT_SECS")
                .unwrap_or_else(|_| "7200".to_string()) // 2 hours
                .parse()?,
            scheduler_poll_secs: std::env::var("SCHEDULER_POLL_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,

            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            ytdlp_timeout_secs: std::env::var("YTDLP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "70".to_string())
                .parse()?,
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_prefix.is_empty() {
            anyhow::bail!("Command prefix must not be empty");
        }

        if self.turn_timeout_secs == 0 {
            anyhow::bail!("Turn timeout must be greater than 0");
        }

        if self.effect_poll_ms == 0 {
            anyhow::bail!("Effect poll interval must be greater than 0");
        }

        if self.prank_min_wait_secs > self.prank_max_wait_secs {
            anyhow::bail!(
                "Prank wait range is inverted: {} > {}",
                self.prank_min_wait_secs,
                self.prank_max_wait_secs
            );
        }

        if self.scheduler_poll_secs == 0 {
            anyhow::bail!("Scheduler poll interval must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        Ok(())
    }

    /// Safe summary for the startup log (no token).
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Prefix: {}\n  \
            API: 127.0.0.1:{} (alerts x{})\n  \
            Data: {}\n  \
            Game: {}s turns\n  \
            Voice: {}s AFK, {}ms effect poll\n  \
            Automation: prank {}-{}s, scheduler every {}s\n  \
            Limits: {} queue, {}s yt-dlp timeout",
            self.command_prefix,
            self.internal_api_port,
            self.alert_repeat_count,
            self.data_dir.display(),
            self.turn_timeout_secs,
            self.afk_timeout_secs,
            self.effect_poll_ms,
            self.prank_min_wait_secs,
            self.prank_max_wait_secs,
            self.scheduler_poll_secs,
            self.max_queue_size,
            self.ytdlp_timeout_secs,
        )
    }

    pub fn scheduled_messages_file(&self) -> PathBuf {
        self.data_dir.join("scheduled_messages.json")
    }

    pub fn prank_state_file(&self) -> PathBuf {
        self.data_dir.join("prank_state.json")
    }

    pub fn roulette_sound(&self, name: &str) -> PathBuf {
        self.roulette_sounds_dir.join(name)
    }
}

fn env_opt_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).unwrap_or_else(|_| default.to_string()).into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            command_prefix: "!".to_string(),

            share_channel_id: None,
            quotes_channel_id: None,
            alert_channel_id: None,

            internal_api_port: 5050,
            alert_repeat_count: 5,

            data_dir: "/app/data".into(),
            music_dir: "music".into(),
            sounds_dir: "sounds".into(),
            jimmy_dir: "jimmy".into(),
            roulette_sounds_dir: "roulette_sounds".into(),
            quotes_file: "quotes/quotes.txt".into(),
            alert_sound_file: "alert/alert.mp3".into(),

            turn_timeout_secs: 60,

            afk_timeout_secs: 60,
            effect_poll_ms: 1000,

            prank_min_wait_secs: 1800,
            prank_max_wait_secs: 7200,
            scheduler_poll_secs: 5,

            max_queue_size: 100,
            ytdlp_timeout_secs: 70,
        }
    }
}
