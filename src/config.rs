//! Runtime configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Only `DATABASE_URL` is required. Everything else falls back to a default
//! when absent or unparseable, so a bare `.env` with a database URL is enough
//! to boot a local chat server.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 4_000;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 20_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_SESSION_COOKIE: &str = "session_token";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} required")]
    Missing(&'static str),
    #[error("invalid {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

// =============================================================================
// CHAT CONFIG
// =============================================================================

/// Knobs for the group chat gateway and broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Bounded per-connection outbox. A recipient whose outbox is full is evicted.
    pub outbox_capacity: usize,
    /// Upper bound on a single socket write before the session is torn down.
    pub send_timeout: Duration,
    /// How often the server pings an attached client.
    pub ping_interval: Duration,
    /// A session with no inbound frame (pongs included) for this long is dropped.
    pub idle_timeout: Duration,
    /// Longest accepted `message` text, counted in chars.
    pub max_message_chars: usize,
    /// Whether the sender receives its own broadcast.
    pub echo_to_sender: bool,
    /// Whether attach requires group membership on top of group existence.
    pub require_membership: bool,
    /// Cookie carrying the session token for ticket minting.
    pub session_cookie: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            echo_to_sender: true,
            require_membership: true,
            session_cookie: DEFAULT_SESSION_COOKIE.to_owned(),
        }
    }
}

impl ChatConfig {
    /// Build chat config from the environment.
    ///
    /// Optional:
    /// - `CHAT_OUTBOX_CAPACITY`: default 256 (minimum 1)
    /// - `CHAT_SEND_TIMEOUT_MS`: default 5000
    /// - `CHAT_PING_INTERVAL_MS`: default 20000 (minimum 1)
    /// - `CHAT_IDLE_TIMEOUT_MS`: default 60000
    /// - `CHAT_MAX_MESSAGE_CHARS`: default 4000
    /// - `CHAT_ECHO_TO_SENDER`: default true
    /// - `CHAT_REQUIRE_MEMBERSHIP`: default true
    /// - `SESSION_COOKIE_NAME`: default `session_token`
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            outbox_capacity: env_parse("CHAT_OUTBOX_CAPACITY", defaults.outbox_capacity).max(1),
            send_timeout: Duration::from_millis(env_parse("CHAT_SEND_TIMEOUT_MS", DEFAULT_SEND_TIMEOUT_MS)),
            ping_interval: Duration::from_millis(env_parse("CHAT_PING_INTERVAL_MS", DEFAULT_PING_INTERVAL_MS).max(1)),
            idle_timeout: Duration::from_millis(env_parse("CHAT_IDLE_TIMEOUT_MS", DEFAULT_IDLE_TIMEOUT_MS)),
            max_message_chars: env_parse("CHAT_MAX_MESSAGE_CHARS", defaults.max_message_chars),
            echo_to_sender: env_bool("CHAT_ECHO_TO_SENDER").unwrap_or(defaults.echo_to_sender),
            require_membership: env_bool("CHAT_REQUIRE_MEMBERSHIP").unwrap_or(defaults.require_membership),
            session_cookie: std::env::var("SESSION_COOKIE_NAME")
                .ok()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.session_cookie),
        }
    }
}

// =============================================================================
// SERVER CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub chat: ChatConfig,
}

impl Config {
    /// Build the full server config from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when `DATABASE_URL` is unset and
    /// [`ConfigError::Invalid`] when `PORT` is set but not a valid port.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid { key: "PORT", value: raw })?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            database_url,
            port,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            chat: ChatConfig::from_env(),
        })
    }
}

// =============================================================================
// HELPERS
// =============================================================================

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
