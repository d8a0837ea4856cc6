//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.deskwatch/config.json`) and
//! environment. Secrets (webhook token, viewer token, Redis URL) can always be
//! supplied via environment variables instead of the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP/WebSocket server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Vendor webhook settings.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Pending store settings (backend, TTL, sweep cadence).
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server bind, port, and viewer auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for HTTP and WebSocket (default 7171).
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Viewer auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: ServerAuthConfig,
}

/// Viewer auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require connect token.
    #[serde(default)]
    pub mode: ServerAuthMode,

    /// Shared secret for WebSocket connect. Overridden by DESKWATCH_VIEWER_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require connect auth token to match the configured token.
    Token,
}

fn default_server_port() -> u16 {
    7171
}

fn default_server_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_server_bind(),
            auth: ServerAuthConfig::default(),
        }
    }
}

/// Vendor webhook settings. The token guards `POST /webhook` and is always required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Shared secret the vendor sends as `?token=` or `X-Webhook-Token`.
    /// Overridden by DESKWATCH_WEBHOOK_TOKEN env.
    pub token: Option<String>,
}

/// Pending store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local HashMap; state is lost on restart.
    #[default]
    Memory,

    /// Redis; entries carry a server-side TTL and survive restarts.
    Redis,
}

/// Pending store config (backend, TTL, sweep cadence).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL (backend "redis"). Overridden by DESKWATCH_REDIS_URL env.
    pub redis_url: Option<String>,

    /// Minutes a conversation may wait before the sweep evicts it (default 60).
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,

    /// Seconds between sweep runs (default 60).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_minutes() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            ttl_minutes: default_ttl_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl StoreConfig {
    /// Conversation TTL as a chrono duration.
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ttl_minutes.max(1) as i64)
    }

    /// Sweep cadence as a std duration.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the webhook token: env DESKWATCH_WEBHOOK_TOKEN overrides config.
pub fn resolve_webhook_token(config: &Config) -> Option<String> {
    env_nonempty("DESKWATCH_WEBHOOK_TOKEN").or_else(|| {
        config
            .webhook
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the viewer token: env DESKWATCH_VIEWER_TOKEN overrides config.
pub fn resolve_viewer_token(config: &Config) -> Option<String> {
    env_nonempty("DESKWATCH_VIEWER_TOKEN").or_else(|| {
        config
            .server
            .auth
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the Redis URL: env DESKWATCH_REDIS_URL, then config, then localhost.
pub fn resolve_redis_url(store: &StoreConfig) -> String {
    env_nonempty("DESKWATCH_REDIS_URL")
        .or_else(|| {
            store
                .redis_url
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("DESKWATCH_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".deskwatch").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or DESKWATCH_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_port_and_bind() {
        let s = ServerConfig::default();
        assert_eq!(s.port, 7171);
        assert_eq!(s.bind, "127.0.0.1");
        assert_eq!(s.auth.mode, ServerAuthMode::None);
    }

    #[test]
    fn default_store_is_memory_with_hour_ttl() {
        let s = StoreConfig::default();
        assert_eq!(s.backend, StoreBackend::Memory);
        assert_eq!(s.ttl(), chrono::Duration::hours(1));
        assert_eq!(s.sweep_interval(), std::time::Duration::from_secs(60));
    }

    #[test]
    fn store_durations_clamp_to_minimum() {
        let s = StoreConfig {
            ttl_minutes: 0,
            sweep_interval_secs: 0,
            ..StoreConfig::default()
        };
        assert_eq!(s.ttl(), chrono::Duration::minutes(1));
        assert_eq!(s.sweep_interval(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn loopback_binds() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(is_loopback_bind("::1"));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[test]
    fn store_backend_parses_from_json() {
        let config: Config =
            serde_json::from_str(r#"{ "store": { "backend": "redis", "ttlMinutes": 120 } }"#)
                .expect("config parses");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.ttl_minutes, 120);
        // untouched sections keep their defaults
        assert_eq!(config.server.port, 7171);
    }

    #[test]
    fn empty_config_object_is_all_defaults() {
        let config: Config = serde_json::from_str("{}").expect("config parses");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.webhook.token.is_none());
    }
}
