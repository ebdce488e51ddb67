use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes settings for the broker server, the messaging client and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub messaging: MessagingSettings,
    pub log: LogSettings,
}

/// Configuration settings for the broker server.
///
/// `data_dir` switches the broker from purely in-memory queues to a `sled`
/// store that keeps durable queues and persistent messages across restarts.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub data_dir: Option<String>,
}

/// Configuration settings for services connecting to the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct MessagingSettings {
    pub uri: String,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl MessagingSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub messaging: Option<PartialMessagingSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub data_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialMessagingSettings {
    pub uri: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub operation_timeout_ms: Option<u64>,
    pub rpc_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_connections: 1000,
                data_dir: None,
            },
            messaging: MessagingSettings {
                uri: "ws://127.0.0.1:8080".to_string(),
                connect_timeout_ms: 5_000,
                operation_timeout_ms: 5_000,
                rpc_timeout_ms: 10_000,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Overlays whatever the partial settings specify onto the defaults.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.unwrap_or_default();
        let messaging = partial.messaging.unwrap_or_default();
        let log = partial.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                max_connections: server
                    .max_connections
                    .unwrap_or(default.server.max_connections),
                data_dir: server.data_dir.or(default.server.data_dir),
            },
            messaging: MessagingSettings {
                uri: messaging.uri.unwrap_or(default.messaging.uri),
                connect_timeout_ms: messaging
                    .connect_timeout_ms
                    .unwrap_or(default.messaging.connect_timeout_ms),
                operation_timeout_ms: messaging
                    .operation_timeout_ms
                    .unwrap_or(default.messaging.operation_timeout_ms),
                rpc_timeout_ms: messaging
                    .rpc_timeout_ms
                    .unwrap_or(default.messaging.rpc_timeout_ms),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}
