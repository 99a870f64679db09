use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration, loaded from the environment (with `.env` support).
#[derive(Clone, Debug)]
pub struct Config {
    // Remote service
    pub service_url: String,
    pub identifier: String,
    pub password: String,
    pub feed_uri: String,

    // Storage
    pub db_file: PathBuf,

    // Content posting
    pub quotes_path: PathBuf,
    pub images_dir: PathBuf,

    // Job schedules (5-field cron)
    pub like_cron: String,
    pub follow_cron: String,
    pub post_cron: String,

    // Outbound write limits
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,

    // Remote-call retry
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,

    // Feed / notifications
    pub feed_fetch_limit: u32,
    pub notification_poll_interval: Duration,

    // Health surface
    pub health_port: u16,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let identifier = env_str("BSKY_IDENTIFIER").and_then(non_empty).ok_or_else(|| {
            Error::Config("BSKY_IDENTIFIER environment variable is required".to_string())
        })?;
        let password = env_str("BSKY_PASSWORD").and_then(non_empty).ok_or_else(|| {
            Error::Config("BSKY_PASSWORD environment variable is required".to_string())
        })?;
        let feed_uri = env_str("FEED_URI").and_then(non_empty).ok_or_else(|| {
            Error::Config("FEED_URI environment variable is required".to_string())
        })?;

        let service_url = env_str("BSKY_SERVICE_URL")
            .and_then(non_empty)
            .unwrap_or_else(|| "https://bsky.social".to_string());

        let db_file = env_path("DATABASE_FILE").unwrap_or_else(|| PathBuf::from("wren.db"));

        let quotes_path =
            env_path("QUOTES_FILE").unwrap_or_else(|| PathBuf::from("resources/quotes.txt"));
        let images_dir =
            env_path("IMAGES_DIR").unwrap_or_else(|| PathBuf::from("resources/images"));

        let like_cron = env_str("LIKE_CRON").unwrap_or_else(|| "*/10 * * * *".to_string());
        let follow_cron = env_str("FOLLOW_CRON").unwrap_or_else(|| "*/15 * * * *".to_string());
        let post_cron = env_str("POST_CRON").unwrap_or_else(|| "0 9 * * *".to_string());

        let rate_limit_requests = env_usize("RATE_LIMIT_REQUESTS").unwrap_or(30);
        let rate_limit_window =
            Duration::from_secs(env_u64("RATE_LIMIT_WINDOW_SECS").unwrap_or(60));

        let retry_max_attempts = env_u32("RETRY_MAX_ATTEMPTS").unwrap_or(3).max(1);
        let retry_base_delay =
            Duration::from_millis(env_u64("RETRY_BASE_DELAY_MS").unwrap_or(1_000));

        let feed_fetch_limit = env_u32("FEED_FETCH_LIMIT").unwrap_or(50).clamp(1, 100);
        let notification_poll_interval =
            Duration::from_millis(env_u64("NOTIFICATION_POLL_MS").unwrap_or(5_000));

        let health_port = env_u16("HEALTH_PORT").unwrap_or(3001);

        Ok(Self {
            service_url,
            identifier,
            password,
            feed_uri,
            db_file,
            quotes_path,
            images_dir,
            like_cron,
            follow_cron,
            post_cron,
            rate_limit_requests,
            rate_limit_window,
            retry_max_attempts,
            retry_base_delay,
            feed_fetch_limit,
            notification_poll_interval,
            health_port,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_u16(key: &str) -> Option<u16> {
    env_str(key).and_then(|s| s.trim().parse::<u16>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
