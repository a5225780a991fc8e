//! Daemon configuration from the process environment.
//!
//! Unparseable values silently fall back to their defaults; out-of-range
//! values are clamped after parse. Only the ERP credentials are fatal when
//! missing.

use crate::error::{Error, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub erp_url: String,
    pub erp_api_key: String,
    pub erp_api_secret: String,

    pub ipc_enabled: bool,
    /// Control socket path; empty when IPC is disabled.
    pub ipc_socket: String,

    pub request_timeout: Duration,
    pub refresh_interval: Duration,
    pub submit_retry: u32,
    pub submit_retry_delay: Duration,
    pub worker_count: usize,
    pub queue_size: usize,
    pub recent_seen_ttl: Duration,

    pub scan_default_active: bool,
    pub auto_scan: bool,
    pub reader_connect_timeout: Duration,
    pub reader_retry_delay: Duration,
    pub reader_host: String,
    pub reader_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            erp_url: String::new(),
            erp_api_key: String::new(),
            erp_api_secret: String::new(),
            ipc_enabled: true,
            ipc_socket: "/tmp/rfid-go-bot.sock".to_string(),
            request_timeout: Duration::from_millis(12_000),
            refresh_interval: Duration::from_secs(5),
            submit_retry: 2,
            submit_retry_delay: Duration::from_millis(300),
            worker_count: 4,
            queue_size: 2048,
            recent_seen_ttl: Duration::from_secs(600),
            scan_default_active: true,
            auto_scan: false,
            reader_connect_timeout: Duration::from_secs(25),
            reader_retry_delay: Duration::from_secs(2),
            reader_host: String::new(),
            reader_port: 0,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let defaults = Config::default();
        let mut cfg = Config {
            erp_url: env_trimmed("ERP_URL"),
            erp_api_key: env_trimmed("ERP_API_KEY"),
            erp_api_secret: env_trimmed("ERP_API_SECRET"),
            ipc_enabled: env_bool("BOT_IPC_ENABLED", defaults.ipc_enabled),
            ipc_socket: env_or("BOT_IPC_SOCKET", &defaults.ipc_socket),
            request_timeout: env_duration_ms("BOT_HTTP_TIMEOUT_MS", 12_000),
            refresh_interval: env_duration_sec("BOT_CACHE_REFRESH_SEC", 5),
            submit_retry: env_u32("BOT_SUBMIT_RETRY", 2),
            submit_retry_delay: env_duration_ms("BOT_SUBMIT_RETRY_MS", 300),
            worker_count: env_usize("BOT_WORKER_COUNT", 4),
            queue_size: env_usize("BOT_QUEUE_SIZE", 2048),
            recent_seen_ttl: env_duration_sec("BOT_RECENT_SEEN_TTL_SEC", 600),
            scan_default_active: env_bool("BOT_SCAN_DEFAULT_ACTIVE", true),
            auto_scan: env_bool("BOT_AUTO_SCAN", false),
            reader_connect_timeout: env_duration_sec("BOT_READER_CONNECT_TIMEOUT_SEC", 25),
            reader_retry_delay: env_duration_sec("BOT_READER_RETRY_SEC", 2),
            reader_host: env_trimmed("BOT_READER_HOST"),
            reader_port: env_u32("BOT_READER_PORT", 0) as u16,
        };

        cfg.erp_url = cfg.erp_url.trim_end_matches('/').to_string();
        if !cfg.ipc_enabled {
            cfg.ipc_socket.clear();
        }

        if cfg.erp_url.is_empty() || cfg.erp_api_key.is_empty() || cfg.erp_api_secret.is_empty() {
            return Err(Error::Config(
                "ERP_URL, ERP_API_KEY, ERP_API_SECRET are required".to_string(),
            ));
        }

        cfg.clamp();
        Ok(cfg)
    }

    /// Applies the documented lower bounds.
    pub fn clamp(&mut self) {
        if self.worker_count < 1 {
            self.worker_count = 1;
        }
        if self.queue_size < 64 {
            self.queue_size = 64;
        }
        if self.request_timeout < Duration::from_secs(1) {
            self.request_timeout = Duration::from_secs(1);
        }
        if self.refresh_interval < Duration::from_secs(5) {
            self.refresh_interval = Duration::from_secs(5);
        }
        if self.recent_seen_ttl < Duration::from_secs(30) {
            self.recent_seen_ttl = Duration::from_secs(30);
        }
        if self.reader_connect_timeout < Duration::from_secs(5) {
            self.reader_connect_timeout = Duration::from_secs(5);
        }
        if self.reader_retry_delay < Duration::from_millis(500) {
            self.reader_retry_delay = Duration::from_secs(2);
        }
    }
}

fn env_trimmed(key: &str) -> String {
    env::var(key).unwrap_or_default().trim().to_string()
}

fn env_or(key: &str, fallback: &str) -> String {
    let value = env_trimmed(key);
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn env_u32(key: &str, fallback: u32) -> u32 {
    env_trimmed(key).parse().unwrap_or(fallback)
}

fn env_usize(key: &str, fallback: usize) -> usize {
    env_trimmed(key).parse().unwrap_or(fallback)
}

fn env_bool(key: &str, fallback: bool) -> bool {
    match env_trimmed(key).to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => fallback,
    }
}

fn env_duration_sec(key: &str, fallback_sec: u32) -> Duration {
    Duration::from_secs(u64::from(env_u32(key, fallback_sec)))
}

fn env_duration_ms(key: &str, fallback_ms: u32) -> Duration {
    Duration::from_millis(u64::from(env_u32(key, fallback_ms)))
}
