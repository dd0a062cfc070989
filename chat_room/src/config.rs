use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the chat room server.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory holding the database and uploaded images.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory for the database and image cache.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    pub room: RoomSettings,
}

/// Knobs consumed by the room core.
#[derive(Clone, Debug)]
pub struct RoomSettings {
    pub enabled: bool,
    /// Messages kept per room; older ones are trimmed.
    pub message_limit: i64,
    /// Maximum message length in characters.
    pub max_message_length: usize,
    /// Messages sent to a client when it connects.
    pub history_limit: i64,
    /// Outbound queue size per connection.
    pub client_buffer: usize,
    pub image_enabled: bool,
    pub image_dir: PathBuf,
    /// Largest single upload accepted.
    pub image_max_bytes: i64,
    /// Global byte budget for all message images.
    pub image_cache_max_bytes: i64,
    pub anti_hotlink_enabled: bool,
    pub allowed_referers: Vec<String>,
    pub housekeeping_interval_secs: u64,
}

impl RoomSettings {
    /// Defaults with the image cache placed under `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            enabled: true,
            message_limit: 1000,
            max_message_length: 8000,
            history_limit: 100,
            client_buffer: 64,
            image_enabled: true,
            image_dir: data_dir.join("chat_room_images"),
            image_max_bytes: 10 * 1024 * 1024,
            image_cache_max_bytes: 1024 * 1024 * 1024,
            anti_hotlink_enabled: true,
            allowed_referers: Vec::new(),
            housekeeping_interval_secs: 300,
        }
    }

    fn apply(&mut self, file: FileChatRoom) {
        if let Some(v) = file.enabled {
            self.enabled = v;
        }
        if let Some(v) = file.message_limit {
            self.message_limit = v;
        }
        if let Some(v) = file.max_message_length {
            self.max_message_length = v;
        }
        if let Some(v) = file.history_limit {
            self.history_limit = v;
        }
        if let Some(v) = file.client_buffer {
            self.client_buffer = v;
        }
        if let Some(v) = file.image_enabled {
            self.image_enabled = v;
        }
        if let Some(v) = file.image_dir {
            self.image_dir = v;
        }
        if let Some(v) = file.image_max_bytes {
            self.image_max_bytes = v;
        }
        if let Some(v) = file.image_cache_max_bytes {
            self.image_cache_max_bytes = v;
        }
        if let Some(v) = file.anti_hotlink_enabled {
            self.anti_hotlink_enabled = v;
        }
        if let Some(v) = file.allowed_referers {
            self.allowed_referers = v;
        }
        if let Some(v) = file.housekeeping_interval_secs {
            self.housekeeping_interval_secs = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.message_limit <= 0 {
            anyhow::bail!("invalid_message_limit");
        }
        if self.max_message_length == 0 {
            anyhow::bail!("invalid_max_message_length");
        }
        if self.image_max_bytes <= 0 {
            anyhow::bail!("invalid_image_max_bytes");
        }
        if self.image_cache_max_bytes <= 0 {
            anyhow::bail!("invalid_image_cache_max_bytes");
        }
        if self.housekeeping_interval_secs == 0 {
            anyhow::bail!("invalid_housekeeping_interval");
        }
        Ok(())
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    chat_room: FileChatRoom,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileChatRoom {
    enabled: Option<bool>,
    message_limit: Option<i64>,
    max_message_length: Option<usize>,
    history_limit: Option<i64>,
    client_buffer: Option<usize>,
    image_enabled: Option<bool>,
    image_dir: Option<PathBuf>,
    image_max_bytes: Option<i64>,
    image_cache_max_bytes: Option<i64>,
    anti_hotlink_enabled: Option<bool>,
    allowed_referers: Option<Vec<String>>,
    housekeeping_interval_secs: Option<u64>,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // built-in defaults
        let mut port = default_port();
        let mut logging = default_logging();
        let mut file_room = FileChatRoom::default();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_ROOM_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat_room.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents)
                .with_context(|| format!("invalid config file {}", config_path.display()))?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            file_room = file_cfg.chat_room;
        }

        // environment overrides
        if let Some(p) = env_parse("CHAT_ROOM_PORT") {
            port = p;
        }
        if let Some(l) = env_parse("CHAT_ROOM_LOGGING") {
            logging = l;
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("CHAT_ROOM_BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("CHAT_ROOM_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let mut room = RoomSettings::with_data_dir(&data_dir);
        room.apply(file_room);
        if let Some(v) = env_parse("CHAT_ROOM_ENABLED") {
            room.enabled = v;
        }
        if let Some(v) = env_parse("CHAT_ROOM_MESSAGE_LIMIT") {
            room.message_limit = v;
        }
        if let Some(v) = env_parse("CHAT_ROOM_IMAGE_ENABLED") {
            room.image_enabled = v;
        }
        if let Ok(v) = std::env::var("CHAT_ROOM_IMAGE_DIR") {
            room.image_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("CHAT_ROOM_IMAGE_CACHE_MAX_BYTES") {
            room.image_cache_max_bytes = v;
        }
        room.validate()?;

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            room,
        })
    }

    /// Location of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chat_room.db")
    }
}

/// Determine the default data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/chat_room");
        p
    } else {
        PathBuf::from("./chat_room_data")
    }
}
