//! Process-wide Redis connection registry.
//!
//! Queues and workers in the same process share one client per endpoint.
//! The registry maps connection settings to a `ConnectionManager`
//! (which reconnects automatically), creating clients on first use and
//! loading the queue scripts once per client. It holds no per-queue
//! state.
//!
//! Between tests, reset the registry with [`close_all`]; there is no
//! implicit teardown.

use std::collections::HashMap;
use std::sync::OnceLock;

use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::QueueError;
use crate::scripts::Scripts;

/// Connection settings identifying one Redis endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedisSettings {
    /// Redis host.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Optional AUTH password.
    pub password: Option<String>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
        }
    }
}

impl RedisSettings {
    /// Creates settings for the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
        }
    }

    /// Creates settings from a `redis://` URL, falling back to defaults
    /// for missing pieces.
    pub fn from_url(url: &str) -> Result<Self, QueueError> {
        let info = redis::IntoConnectionInfo::into_connection_info(url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let (host, port) = match info.addr {
            redis::ConnectionAddr::Tcp(host, port) => (host, port),
            redis::ConnectionAddr::TcpTls { host, port, .. } => (host, port),
            other => {
                return Err(QueueError::ConnectionFailed(format!(
                    "unsupported address {other:?}"
                )))
            }
        };

        Ok(Self {
            host,
            port,
            password: info.redis.password,
        })
    }

    /// Sets the AUTH password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Renders the `redis://` connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{password}@{}:{}", self.host, self.port),
            None => format!("redis://{}:{}", self.host, self.port),
        }
    }
}

static CLIENTS: OnceLock<Mutex<HashMap<RedisSettings, ConnectionManager>>> = OnceLock::new();

fn clients() -> &'static Mutex<HashMap<RedisSettings, ConnectionManager>> {
    CLIENTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the shared client for `settings`, connecting on first use.
///
/// A freshly created client has both queue scripts loaded before it is
/// handed out. Different settings tuples yield different clients.
pub async fn get_client(settings: &RedisSettings) -> Result<ConnectionManager, QueueError> {
    let mut map = clients().lock().await;

    if let Some(conn) = map.get(settings) {
        return Ok(conn.clone());
    }

    let client = redis::Client::open(settings.url())
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

    let mut conn = ConnectionManager::new(client)
        .await
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

    Scripts::new()
        .load(&mut conn)
        .await
        .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

    debug!(host = %settings.host, port = settings.port, "Connected Redis client");
    map.insert(settings.clone(), conn.clone());

    Ok(conn)
}

/// Drops every cached client.
///
/// Existing queues and workers holding clones keep working; this only
/// empties the cache so the next `get_client` reconnects.
pub async fn close_all() {
    clients().lock().await.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default() {
        let settings = RedisSettings::default();

        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 6379);
        assert!(settings.password.is_none());
    }

    #[test]
    fn test_settings_url() {
        let settings = RedisSettings::new("cache.internal", 6380);
        assert_eq!(settings.url(), "redis://cache.internal:6380");

        let settings = settings.with_password("hunter2");
        assert_eq!(settings.url(), "redis://:hunter2@cache.internal:6380");
    }

    #[test]
    fn test_settings_from_url() {
        let settings = RedisSettings::from_url("redis://:secret@queue.internal:7000")
            .expect("valid url");

        assert_eq!(settings.host, "queue.internal");
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_settings_are_map_keys() {
        let mut map = HashMap::new();
        map.insert(RedisSettings::default(), 1);
        map.insert(RedisSettings::new("localhost", 6380), 2);

        assert_eq!(map.get(&RedisSettings::default()), Some(&1));
        assert_eq!(map.len(), 2);
    }
}
