use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::timeline::DEFAULT_PART_SECS;

const DEFAULT_ENV_PREFIX: &str = "VODCHAT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Channel whose archive this client browses.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Twitch numeric id used by the emote provider fallbacks.
    #[serde(default = "default_twitch_id")]
    pub twitch_id: String,
    /// Web frontend of the archive, used for shareable timestamp links.
    #[serde(default = "default_share_base_url")]
    pub share_base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            channel: default_channel(),
            twitch_id: default_twitch_id(),
            share_base_url: default_share_base_url(),
        }
    }
}

fn default_base_url() -> String {
    crate::api::DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("vodchat/{} (+https://github.com/pokelawls-archive/vodchat)", crate::VERSION)
}

fn default_channel() -> String {
    "pokelawls".into()
}

fn default_twitch_id() -> String {
    "12943173".into()
}

fn default_share_base_url() -> String {
    "https://vods.pokelawls.com".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineConfig {
    /// Substituted when a part's duration is unknown.
    #[serde(default = "default_part_secs")]
    pub default_part_secs: f64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            default_part_secs: default_part_secs(),
        }
    }
}

fn default_part_secs() -> f64 {
    DEFAULT_PART_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default = "default_mpv_path")]
    pub mpv_path: String,
    /// Extra arguments appended to every mpv launch.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            mpv_path: default_mpv_path(),
            extra_args: Vec::new(),
        }
    }
}

fn default_mpv_path() -> String {
    "mpv".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: i64,
    #[serde(default = "default_media_ttl_duration", with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_size_bytes: default_max_size_bytes(),
            default_ttl: default_media_ttl_duration(),
            workers: default_workers(),
        }
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("vodchat").join("emotes"))
}

fn default_max_size_bytes() -> i64 {
    200 * 1024 * 1024
}

fn default_media_ttl_duration() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = merge_config(cfg, load_env(prefix)?);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.api.base_url.is_empty() && other.api.base_url != default_base_url() {
        base.api.base_url = other.api.base_url;
    }
    if !other.api.user_agent.is_empty() && other.api.user_agent != default_user_agent() {
        base.api.user_agent = other.api.user_agent;
    }
    if !other.api.channel.is_empty() && other.api.channel != default_channel() {
        base.api.channel = other.api.channel;
    }
    if !other.api.twitch_id.is_empty() && other.api.twitch_id != default_twitch_id() {
        base.api.twitch_id = other.api.twitch_id;
    }
    if !other.api.share_base_url.is_empty() && other.api.share_base_url != default_share_base_url()
    {
        base.api.share_base_url = other.api.share_base_url;
    }

    if other.timeline.default_part_secs > 0.0
        && other.timeline.default_part_secs != default_part_secs()
    {
        base.timeline.default_part_secs = other.timeline.default_part_secs;
    }

    if !other.player.mpv_path.is_empty() {
        base.player.mpv_path = other.player.mpv_path;
    }
    if !other.player.extra_args.is_empty() {
        base.player.extra_args = other.player.extra_args;
    }

    if other.media.cache_dir.is_some() && other.media.cache_dir != default_cache_dir() {
        base.media.cache_dir = other.media.cache_dir;
    }
    if other.media.max_size_bytes != 0 && other.media.max_size_bytes != default_max_size_bytes() {
        base.media.max_size_bytes = other.media.max_size_bytes;
    }
    if other.media.default_ttl != default_media_ttl_duration() {
        base.media.default_ttl = other.media.default_ttl;
    }
    if other.media.workers != 0 && other.media.workers != default_workers() {
        base.media.workers = other.media.workers;
    }

    base
}

fn load_env(prefix: &str) -> Result<Config> {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    if map.is_empty() {
        return Ok(Config::default());
    }

    let mut cfg = Config::default();

    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.channel" => cfg.api.channel = value,
        "api.twitch_id" => cfg.api.twitch_id = value,
        "api.share_base_url" => cfg.api.share_base_url = value,
        "timeline.default_part_secs" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.timeline.default_part_secs = parsed;
            }
        }
        "player.mpv_path" => cfg.player.mpv_path = value,
        "player.extra_args" => {
            cfg.player.extra_args = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "media.cache_dir" => cfg.media.cache_dir = Some(PathBuf::from(value)),
        "media.max_size_bytes" => {
            if let Ok(parsed) = value.parse::<i64>() {
                cfg.media.max_size_bytes = parsed;
            }
        }
        "media.default_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.media.default_ttl = duration;
            }
        }
        "media.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.workers = parsed;
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vodchat").join("config.yaml"))
}
