//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::DEFAULT_SENSOR_TOPIC;
use crate::router::is_valid_filter;
use crate::transport::{Backoff, TransportOptions};

/// Config file used when `AQUAMON_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "aquamon.toml";

/// Smallest keep-alive interval accepted by `validate()`.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub broker: BrokerSettings,
    pub topics: TopicConfig,
    pub reconnect: ReconnectConfig,
    pub publish_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub outbound_capacity: usize,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// PEM bundle for a private CA. Without it TLS uses the webpki roots.
    pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub sensor: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            topics: TopicConfig::default(),
            reconnect: ReconnectConfig::default(),
            publish_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            outbound_capacity: 10,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            use_tls: false,
            client_id: "aquamon-shell".to_string(),
            keep_alive_secs: 30,
            ca_path: None,
        }
    }
}

// The password never reaches logs.
impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("ca_path", &self.ca_path)
            .finish()
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            sensor: DEFAULT_SENSOR_TOPIC.to_string(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            base_ms: backoff.base.as_millis() as u64,
            cap_ms: backoff.cap.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl MonitorConfig {
    /// Load from `$AQUAMON_CONFIG` (or `aquamon.toml`), apply environment
    /// overrides, and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var("AQUAMON_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_with(Path::new(&path), |key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit path and variable
    /// lookup. A missing file is not an error; the defaults are used.
    pub fn load_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            Self::from_toml(&text)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `MQTT_*` and `SENSOR_TOPIC` variables on top of the file.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = env("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = env("MQTT_PORT") {
            self.broker.port = port
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {port:?}"))?;
        }
        if let Some(user) = env("MQTT_USERNAME") {
            self.broker.username = Some(user).filter(|u| !u.is_empty());
        }
        if let Some(password) = env("MQTT_PASSWORD") {
            self.broker.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(tls) = env("MQTT_TLS") {
            self.broker.use_tls = tls == "1" || tls.eq_ignore_ascii_case("true");
        }
        if let Some(topic) = env("SENSOR_TOPIC") {
            self.topics.sensor = topic;
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            backoff: Backoff {
                base: Duration::from_millis(self.reconnect.base_ms),
                cap: Duration::from_millis(self.reconnect.cap_ms),
            },
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            outbound_capacity: self.outbound_capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl MonitorConfig {
    /// Returns `Ok(())` or an error describing every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_broker(&mut errors);

        if !is_valid_filter(&self.topics.sensor) {
            errors.push(format!(
                "topics.sensor: {:?} is not a valid topic filter",
                self.topics.sensor
            ));
        }

        if self.reconnect.base_ms == 0 {
            errors.push("reconnect.base_ms must be positive".to_string());
        }
        if self.reconnect.cap_ms < self.reconnect.base_ms {
            errors.push(format!(
                "reconnect.cap_ms ({}) must be at least base_ms ({})",
                self.reconnect.cap_ms, self.reconnect.base_ms
            ));
        }

        if self.publish_timeout_ms == 0 {
            errors.push("publish_timeout_ms must be positive".to_string());
        }
        if self.connect_timeout_ms == 0 {
            errors.push("connect_timeout_ms must be positive".to_string());
        }
        if self.outbound_capacity == 0 {
            errors.push("outbound_capacity must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_broker(&self, errors: &mut Vec<String>) {
        let b = &self.broker;

        if b.host.trim().is_empty() {
            errors.push("broker.host is empty".to_string());
        }
        if b.port == 0 {
            errors.push("broker.port must be non-zero".to_string());
        }
        if b.client_id.trim().is_empty() {
            errors.push("broker.client_id is empty".to_string());
        }
        if b.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            errors.push(format!(
                "broker.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                b.keep_alive_secs
            ));
        }
        if b.password.is_some() && b.username.is_none() {
            errors.push("broker.password is set without a username".to_string());
        }
        if b.ca_path.is_some() && !b.use_tls {
            errors.push("broker.ca_path is set but use_tls is false".to_string());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
