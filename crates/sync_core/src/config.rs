use std::{collections::HashMap, fs, time::Duration};

use media_transport::IceServer;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_url: String,
    pub page_size: u32,
    pub fallback_timeout_ms: u64,
    pub typing_clear_ms: u64,
    pub read_debounce_ms: u64,
    pub stun_urls: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            page_size: 50,
            fallback_timeout_ms: 3_000,
            typing_clear_ms: 2_000,
            read_debounce_ms: 500,
            stun_urls: media_transport::DEFAULT_STUN_URLS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl Settings {
    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn typing_clear(&self) -> Duration {
        Duration::from_millis(self.typing_clear_ms)
    }

    pub fn read_debounce(&self) -> Duration {
        Duration::from_millis(self.read_debounce_ms)
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        if self.stun_urls.is_empty() {
            IceServer::default_servers()
        } else {
            vec![IceServer {
                urls: self.stun_urls.clone(),
            }]
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("sync.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            if let Some(v) = file_cfg.get("server_url").and_then(|v| v.as_str()) {
                settings.server_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("page_size").and_then(|v| v.as_integer()) {
                settings.page_size = v.clamp(1, 200) as u32;
            }
            if let Some(v) = file_cfg
                .get("fallback_timeout_ms")
                .and_then(|v| v.as_integer())
            {
                settings.fallback_timeout_ms = v.max(0) as u64;
            }
            if let Some(v) = file_cfg.get("stun_urls").and_then(|v| v.as_array()) {
                let urls: Vec<String> = v
                    .iter()
                    .filter_map(|u| u.as_str().map(str::to_string))
                    .collect();
                if !urls.is_empty() {
                    settings.stun_urls = urls;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("SYNC__SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("SYNC__PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_size = parsed.clamp(1, 200);
        }
    }
    if let Ok(v) = std::env::var("SYNC__FALLBACK_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.fallback_timeout_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("SYNC__STUN_URLS") {
        let urls: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !urls.is_empty() {
            settings.stun_urls = urls;
        }
    }

    settings
}
