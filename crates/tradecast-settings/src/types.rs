//! Settings sections. Every struct uses camelCase keys and falls back to
//! its `Default` for missing fields, so partial files are always valid.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub channel: ChannelSettings,
    pub worker: WorkerSettings,
    pub client: ClientSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reject values that deserialize fine but cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.server.topic.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.topic must not be empty".into()));
        }
        if self.server.send_queue == 0 {
            return Err(SettingsError::InvalidValue("server.sendQueue must be at least 1".into()));
        }
        if self.channel.poll_interval_ms < 10 {
            return Err(SettingsError::InvalidValue(
                "channel.pollIntervalMs must be at least 10".into(),
            ));
        }
        if self.client.max_messages == 0 {
            return Err(SettingsError::InvalidValue(
                "client.maxMessages must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Relay HTTP server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port.
    pub port: u16,
    /// Broadcast topic relayed by `/api/sse` and written by `/api/analyzer`.
    pub topic: String,
    /// Interval between keep-alive comments. `0` disables them.
    pub keep_alive_ms: u64,
    /// Frames buffered per relay before writes apply backpressure.
    pub send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            topic: "analysis_results".to_string(),
            keep_alive_ms: 15_000,
            send_queue: 64,
        }
    }
}

/// Which broadcast channel implementation backs the relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelBackend {
    #[default]
    Memory,
    File,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    pub backend: ChannelBackend,
    /// Directory holding one mailbox file per topic (file backend only).
    pub mailbox_dir: String,
    /// Mailbox poll interval in milliseconds (file backend only).
    pub poll_interval_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            backend: ChannelBackend::Memory,
            mailbox_dir: "/tmp/tradecast".to_string(),
            poll_interval_ms: 1000,
        }
    }
}

/// Upstream worker that receives uploaded charts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    pub base_url: String,
    pub upload_path: String,
    pub timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5678".to_string(),
            upload_path: "/webhook-test/upload-file".to_string(),
            timeout_ms: 60_000,
        }
    }
}

impl WorkerSettings {
    /// Full upload endpoint, tolerant of a trailing slash on the base URL.
    pub fn upload_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.upload_path.trim_start_matches('/')
        )
    }
}

/// Defaults for the `watch` client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub url: String,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub max_messages: usize,
    pub event_types: Vec<String>,
    pub parse_json: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000/api/sse".to_string(),
            auto_reconnect: true,
            reconnect_interval_ms: 1500,
            max_reconnect_attempts: 10,
            max_messages: 1000,
            event_types: vec!["data".into(), "no_data".into(), "error".into()],
            parse_json: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(value["server"]["keepAliveMs"], 15_000);
        assert_eq!(value["channel"]["backend"], "memory");
        assert_eq!(value["worker"]["uploadPath"], "/webhook-test/upload-file");
        assert_eq!(value["client"]["maxReconnectAttempts"], 10);
    }

    #[test]
    fn partial_section_keeps_field_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"channel": {"backend": "file"}}"#).unwrap();
        assert_eq!(settings.channel.backend, ChannelBackend::File);
        assert_eq!(settings.channel.poll_interval_ms, 1000);
        assert_eq!(settings.server.port, 3000);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let result = serde_json::from_str::<Settings>(r#"{"channel": {"backend": "redis"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn validate_rejects_empty_topic() {
        let mut settings = Settings::default();
        settings.server.topic = "  ".into();
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_send_queue() {
        let mut settings = Settings::default();
        settings.server.send_queue = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn upload_url_joins_cleanly() {
        let mut worker = WorkerSettings::default();
        assert_eq!(worker.upload_url(), "http://localhost:5678/webhook-test/upload-file");
        worker.base_url = "http://n8n:5678/".into();
        worker.upload_path = "hook".into();
        assert_eq!(worker.upload_url(), "http://n8n:5678/hook");
    }
}
