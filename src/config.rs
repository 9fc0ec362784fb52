// ===============================
// src/config.rs
// ===============================
use std::env;

use dotenvy::dotenv;

/// Backing store selection: in-memory (dev/test) or the HTTP sheet bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    Mock,
    Http,
}

impl StoreMode {
    pub fn from_env(key: &str, default_mode: StoreMode) -> StoreMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => StoreMode::Mock,
            "http" | "sheet" => StoreMode::Http,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreMode::Mock => "mock",
            StoreMode::Http => "http",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    // store
    pub store_mode: StoreMode,
    pub store_base_url: String,
    pub store_api_key: Option<String>,
    pub store_timeout_ms: u64,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,

    // behavior
    /// SHA-256 hex of the reset passphrase. Unset disables `reset` entirely.
    pub reset_pass_sha256: Option<String>,
    /// Used when the settings range carries no `smart_parse` row yet.
    pub smart_parse_default: bool,

    // stdin transport
    pub stdin_chat_id: i64,
}

pub fn load() -> Config {
    // .env first so RECORD_FILE, STORE_* etc. are visible
    let _ = dotenv();

    let store_mode = StoreMode::from_env("STORE_MODE", StoreMode::Mock);
    let store_base_url =
        env::var("STORE_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
    let store_api_key = env::var("STORE_API_KEY").ok().filter(|s| !s.is_empty());
    let store_timeout_ms = env::var("STORE_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8_000);

    let record_file = env::var("RECORD_FILE").ok();
    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);

    let reset_pass_sha256 = env::var("RESET_PASS_SHA256")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase());
    let smart_parse_default = env::var("SMART_PARSE_DEFAULT")
        .map(|s| s != "0" && !s.eq_ignore_ascii_case("false"))
        .unwrap_or(true);

    let stdin_chat_id = env::var("STDIN_CHAT_ID")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);

    Config {
        store_mode,
        store_base_url,
        store_api_key,
        store_timeout_ms,
        record_file,
        metrics_port,
        reset_pass_sha256,
        smart_parse_default,
        stdin_chat_id,
    }
}
