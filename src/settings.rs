use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::{
    consts::{
        DEFAULT_CACHE_LIMIT, DEFAULT_FRESHNESS_SECS, DEFAULT_PAGE_SIZE, DEFAULT_STREAM_PATH,
        MAX_CACHE_LIMIT, MAX_PAGE_SIZE, REQUEST_TIMEOUT_SECS, STREAM_CONNECT_TIMEOUT_SECS,
        STREAM_INACTIVITY_SECS, STREAM_MAX_RECONNECT_ATTEMPTS, STREAM_RECONNECT_BASE_SECS,
        STREAM_RECONNECT_JITTER_MS, STREAM_RECONNECT_MAX_SECS, TRACKED_IDS_PER_CACHED,
    },
    model::Category,
    store::StoreConfig,
    stream::StreamConfig,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Sse,
    Websocket,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub token: Option<String>,
    pub stream_path: String,
    pub transport: TransportKind,
    pub page_size: u32,
    pub cache_limit: usize,
    pub freshness_secs: u64,
    pub inactivity_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    pub reconnect_jitter_ms: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub badge_categories: Vec<Category>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            transport: TransportKind::Sse,
            page_size: DEFAULT_PAGE_SIZE,
            cache_limit: DEFAULT_CACHE_LIMIT,
            freshness_secs: DEFAULT_FRESHNESS_SECS,
            inactivity_secs: STREAM_INACTIVITY_SECS,
            max_reconnect_attempts: STREAM_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_secs: STREAM_RECONNECT_BASE_SECS,
            reconnect_max_secs: STREAM_RECONNECT_MAX_SECS,
            reconnect_jitter_ms: STREAM_RECONNECT_JITTER_MS,
            connect_timeout_secs: STREAM_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            badge_categories: Category::KNOWN.to_vec(),
        }
    }
}

impl Settings {
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn store_config(&self) -> StoreConfig {
        let cache_limit = normalize_cache_limit(self.cache_limit);
        StoreConfig {
            page_size: normalize_page_size(self.page_size),
            cache_limit,
            freshness: Duration::from_secs(self.freshness_secs),
            tracked_limit: cache_limit.saturating_mul(TRACKED_IDS_PER_CACHED),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        let base_delay = Duration::from_secs(self.reconnect_base_secs.max(1));
        StreamConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            inactivity_window: Duration::from_secs(self.inactivity_secs.max(1)),
            max_reconnect_attempts: self.max_reconnect_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(self.reconnect_max_secs).max(base_delay),
            jitter: Duration::from_millis(self.reconnect_jitter_ms),
        }
    }
}

pub fn read_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path)?;
    serde_json::from_str::<Settings>(&content).map_err(|source| Error::Decode {
        context: "settings file",
        source,
    })
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings).map_err(|source| Error::Decode {
        context: "settings",
        source,
    })?;
    fs::write(path, content)?;
    restrict_file_permissions(path);
    Ok(())
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt as _;

    if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        log::warn!("restrict_file_permissions: failed for {path:?}: {error}");
    }
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

pub(crate) fn normalize_page_size(page_size: u32) -> u32 {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

pub(crate) fn normalize_cache_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_CACHE_LIMIT)
}

pub fn normalize_base_url(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Config("Server URL is required".to_string()));
    }

    let url = reqwest::Url::parse(trimmed)
        .map_err(|error| Error::Config(format!("Invalid server URL: {error}")))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::Config(
            "Server URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

pub fn build_stream_url(base_url: &str, stream_path: &str, kind: TransportKind) -> Result<String> {
    let mut stream_url = reqwest::Url::parse(base_url)
        .map_err(|error| Error::Config(format!("Invalid server URL: {error}")))?;

    if kind == TransportKind::Websocket {
        let scheme = match stream_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            _ => {
                return Err(Error::Config(
                    "Server URL must start with http:// or https://".to_string(),
                ))
            }
        };
        stream_url
            .set_scheme(scheme)
            .map_err(|_| Error::Config(format!("Unable to convert URL scheme to {scheme}")))?;
    }

    let mut path = stream_url.path().trim_end_matches('/').to_string();
    let suffix = stream_path.trim();
    if !suffix.starts_with('/') {
        path.push('/');
    }
    path.push_str(suffix);
    stream_url.set_path(&path);
    Ok(stream_url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_rejects_other_schemes() {
        assert_eq!(
            normalize_base_url(" https://ops.example.com/api/ ").unwrap(),
            "https://ops.example.com/api"
        );
        assert!(matches!(
            normalize_base_url("ftp://ops.example.com"),
            Err(Error::Config(_))
        ));
        assert!(matches!(normalize_base_url("   "), Err(Error::Config(_))));
    }

    #[test]
    fn stream_url_keeps_http_for_sse() {
        let url = build_stream_url(
            "https://ops.example.com/api",
            "/notifications/stream",
            TransportKind::Sse,
        )
        .unwrap();
        assert_eq!(url, "https://ops.example.com/api/notifications/stream");
    }

    #[test]
    fn stream_url_converts_scheme_for_websocket() {
        let url = build_stream_url("http://localhost:8000", "ws/notifications", TransportKind::Websocket)
            .unwrap();
        assert_eq!(url, "ws://localhost:8000/ws/notifications");
    }

    #[test]
    fn stream_config_is_bounded() {
        let settings = Settings {
            reconnect_base_secs: 10,
            reconnect_max_secs: 2,
            max_reconnect_attempts: 0,
            ..Settings::default()
        };
        let config = settings.stream_config();
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.max_reconnect_attempts, 1);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"base_url": "https://ops.example.com", "page_size": 500}"#)
                .unwrap();
        assert_eq!(settings.stream_path, DEFAULT_STREAM_PATH);
        assert_eq!(settings.store_config().page_size, MAX_PAGE_SIZE);
        assert_eq!(
            settings.store_config().tracked_limit,
            DEFAULT_CACHE_LIMIT * TRACKED_IDS_PER_CACHED
        );
        assert_eq!(settings.badge_categories.len(), 4);
    }
}
