use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Remote,
    Pipeline,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" | "api" => Ok(Self::Remote),
            "pipeline" | "local" => Ok(Self::Pipeline),
            other => bail!("Unsupported YTAUDIO_BACKEND `{other}`. Supported: remote, pipeline."),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Pipeline => "pipeline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite(PathBuf),
}

impl StoreKind {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "" => bail!("YTAUDIO_STORE must be `memory` or a SQLite file path."),
            _ => Ok(Self::Sqlite(PathBuf::from(trimmed))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub backend: BackendKind,
    pub store: StoreKind,
    pub provider_base_url: String,
    pub provider_host: String,
    pub provider_api_key: Option<String>,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub task_ttl_seconds: u64,
    pub cache_ttl_seconds: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub convert_timeout_seconds: u64,
    pub provider_request_timeout_seconds: u64,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub sweep_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw = env::var("YTAUDIO_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let backend = BackendKind::parse(
            &env::var("YTAUDIO_BACKEND").unwrap_or_else(|_| "pipeline".to_string()),
        )?;

        let store =
            StoreKind::parse(&env::var("YTAUDIO_STORE").unwrap_or_else(|_| "memory".to_string()))?;

        let provider_base_url = env::var("YTAUDIO_PROVIDER_BASE_URL")
            .unwrap_or_else(|_| "https://youtube-mp36.p.rapidapi.com".to_string());
        let provider_host = env::var("YTAUDIO_PROVIDER_HOST")
            .unwrap_or_else(|_| "youtube-mp36.p.rapidapi.com".to_string());
        let provider_api_key = env::var("YTAUDIO_PROVIDER_API_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let ytdlp_bin =
            PathBuf::from(env::var("YTAUDIO_YTDLP_BIN").unwrap_or_else(|_| "yt-dlp".to_string()));
        let ffmpeg_bin =
            PathBuf::from(env::var("YTAUDIO_FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()));

        let task_ttl_seconds = parse_env("YTAUDIO_TASK_TTL_SECONDS", 24 * 60 * 60);
        let cache_ttl_seconds = parse_env("YTAUDIO_CACHE_TTL_SECONDS", 24 * 60 * 60);
        let max_retries = parse_env("YTAUDIO_MAX_RETRIES", 3);
        let retry_backoff_ms = parse_env("YTAUDIO_RETRY_BACKOFF_MS", 2_000);
        let convert_timeout_seconds = parse_env("YTAUDIO_CONVERT_TIMEOUT_SECONDS", 600);
        let provider_request_timeout_seconds =
            parse_env("YTAUDIO_PROVIDER_REQUEST_TIMEOUT_SECONDS", 120);
        let max_concurrent = parse_env("YTAUDIO_MAX_CONCURRENT", 3);
        let queue_capacity = parse_env("YTAUDIO_QUEUE_CAPACITY", 128);
        let sweep_interval_seconds = parse_env("YTAUDIO_SWEEP_INTERVAL_SECONDS", 60);

        Ok(Self {
            bind_addr,
            backend,
            store,
            provider_base_url,
            provider_host,
            provider_api_key,
            ytdlp_bin,
            ffmpeg_bin,
            task_ttl_seconds,
            cache_ttl_seconds,
            max_retries,
            retry_backoff_ms,
            convert_timeout_seconds,
            provider_request_timeout_seconds,
            max_concurrent,
            queue_capacity,
            sweep_interval_seconds,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}
