//! Configuration for the Squall runtime.
//!
//! `Config` is the root structure: one section per subsystem (reactor,
//! timer, TCP, UDP, TLS, WebSocket, MQTT, logging), `serde`-derived so it can
//! be loaded from TOML or built programmatically through [`ConfigBuilder`].
//! [`ConfigManager`] adds validation, versioned history/rollback, and a
//! watch thread that re-reads the file on a poll interval and delivers
//! changes over a plain channel — no tokio broadcast, no `notify` crate; see
//! DESIGN.md for why.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

/// Root configuration for a [`crate::runtime::Squall`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reactor: ReactorConfig,
    pub timer: TimerConfig,
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    pub tls: Option<TlsConfig>,
    pub websocket: WebSocketConfig,
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/// Event loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// I/O backend readiness batch size passed to the poller per wait call.
    pub max_events_per_poll: usize,
    /// Upper bound on `backend.wait` timeout when timers are far out, in
    /// milliseconds. Prevents an unbounded block when no timer is armed and
    /// the loop is otherwise idle in ONCE/NOWAIT callers that still want a
    /// liveness check.
    pub max_poll_timeout_ms: u64,
    /// Depth of the deferred-work queue before `queue_work` starts rejecting.
    pub max_deferred_queue: usize,
    /// Initial capacity reserved for the active handle set.
    pub initial_handle_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_events_per_poll: 256,
            max_poll_timeout_ms: 60_000,
            max_deferred_queue: 8192,
            initial_handle_capacity: 1024,
        }
    }
}

/// Timer heap tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Initial heap capacity, to avoid repeated reallocation under load.
    pub initial_capacity: usize,
    /// Maximum number of live timers; `Timer::start` beyond this errors with
    /// `Error::resource_exhausted`.
    pub max_timers: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { initial_capacity: 256, max_timers: 1_000_000 }
    }
}

/// TCP handle defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub nodelay: bool,
    pub keepalive: bool,
    pub keepalive_idle_seconds: u64,
    pub listen_backlog: i32,
    pub write_queue_high_water: usize,
    pub connect_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: true,
            keepalive_idle_seconds: 60,
            listen_backlog: 1024,
            write_queue_high_water: 16 * 1024 * 1024,
            connect_timeout_ms: 30_000,
        }
    }
}

/// UDP handle defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self { recv_buffer_size: 64 * 1024, send_buffer_size: 64 * 1024 }
    }
}

/// TLS configuration — certificate material and peer verification mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    /// Require and verify a client certificate on the server side.
    pub client_auth: bool,
    /// Trusted CA bundle for verifying peers; defaults to the system/webpki
    /// roots when absent.
    pub ca_file: Option<String>,
    /// ALPN protocols offered during the handshake, in preference order.
    pub alpn_protocols: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: String::new(),
            key_file: String::new(),
            client_auth: false,
            ca_file: None,
            alpn_protocols: Vec::new(),
        }
    }
}

/// WebSocket framing and handshake limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Maximum assembled message size (after defragmentation), in bytes.
    pub max_message_size: usize,
    /// Clients must mask outbound frames per RFC 6455 §5.1; servers reject
    /// unmasked frames when this is set.
    pub require_masking: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self { max_message_size: 16 * 1024 * 1024, require_masking: true }
    }
}

/// MQTT client defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub protocol_version: MqttVersion,
    pub keepalive_seconds: u16,
    pub clean_session: bool,
    pub max_inflight: usize,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Maximum packet size the parser accepts before erroring, per the
    /// remaining-length ceiling of 256 MiB.
    pub max_packet_size: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            protocol_version: MqttVersion::V311,
            keepalive_seconds: 60,
            clean_session: true,
            max_inflight: 20,
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 30_000,
            max_packet_size: 256 * 1024 * 1024,
        }
    }
}

/// Supported MQTT protocol revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MqttVersion {
    #[serde(rename = "3.1")]
    V31,
    #[serde(rename = "3.1.1")]
    V311,
    #[serde(rename = "5")]
    V5,
}

/// Logging configuration, consumed by the binary/embedding application to
/// set up a `tracing-subscriber` layer; the library itself only emits spans
/// and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub structured: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), structured: true }
    }
}

/// Programmatic configuration assembly, mirroring [`Config::default`] but
/// allowing section-by-section overrides before `build`.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl Config {
    fn builder_defaults() -> Config {
        Config {
            reactor: ReactorConfig::default(),
            timer: TimerConfig::default(),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            tls: None,
            websocket: WebSocketConfig::default(),
            mqtt: MqttConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { config: Config::builder_defaults() }
    }

    pub fn reactor(mut self, reactor: ReactorConfig) -> Self {
        self.config.reactor = reactor;
        self
    }

    pub fn timer(mut self, timer: TimerConfig) -> Self {
        self.config.timer = timer;
        self
    }

    pub fn tcp(mut self, tcp: TcpConfig) -> Self {
        self.config.tcp = tcp;
        self
    }

    pub fn udp(mut self, udp: UdpConfig) -> Self {
        self.config.udp = udp;
        self
    }

    pub fn tls(mut self, cert_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.config.tls = Some(TlsConfig {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ..TlsConfig::default()
        });
        self
    }

    pub fn mqtt(mut self, mqtt: MqttConfig) -> Self {
        self.config.mqtt = mqtt;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// A validator runs structural and cross-field checks a `serde` derive
/// can't express (e.g. "cert_file must be set when tls is present").
pub trait ConfigValidator: Send + Sync {
    fn validate(&self, config: &Config) -> std::result::Result<(), ValidationError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidValue { field: String, value: String, reason: String },
    MissingField(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { field, value, reason } => {
                write!(f, "{field} = {value:?}: {reason}")
            }
            Self::MissingField(field) => write!(f, "missing required field: {field}"),
        }
    }
}

struct TimerConfigValidator;

impl ConfigValidator for TimerConfigValidator {
    fn validate(&self, config: &Config) -> std::result::Result<(), ValidationError> {
        if config.timer.max_timers == 0 {
            return Err(ValidationError::InvalidValue {
                field: "timer.max_timers".to_string(),
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

struct TlsConfigValidator;

impl ConfigValidator for TlsConfigValidator {
    fn validate(&self, config: &Config) -> std::result::Result<(), ValidationError> {
        let Some(tls) = &config.tls else { return Ok(()) };
        if tls.cert_file.is_empty() {
            return Err(ValidationError::MissingField("tls.cert_file".to_string()));
        }
        if tls.key_file.is_empty() {
            return Err(ValidationError::MissingField("tls.key_file".to_string()));
        }
        Ok(())
    }
}

struct MqttConfigValidator;

impl ConfigValidator for MqttConfigValidator {
    fn validate(&self, config: &Config) -> std::result::Result<(), ValidationError> {
        if config.mqtt.reconnect_min_delay_ms > config.mqtt.reconnect_max_delay_ms {
            return Err(ValidationError::InvalidValue {
                field: "mqtt.reconnect_min_delay_ms".to_string(),
                value: config.mqtt.reconnect_min_delay_ms.to_string(),
                reason: "must not exceed mqtt.reconnect_max_delay_ms".to_string(),
            });
        }
        if config.mqtt.max_packet_size > 256 * 1024 * 1024 {
            return Err(ValidationError::InvalidValue {
                field: "mqtt.max_packet_size".to_string(),
                value: config.mqtt.max_packet_size.to_string(),
                reason: "exceeds the 256 MiB remaining-length ceiling".to_string(),
            });
        }
        Ok(())
    }
}

fn default_validators() -> Vec<Box<dyn ConfigValidator>> {
    vec![Box::new(TimerConfigValidator), Box::new(TlsConfigValidator), Box::new(MqttConfigValidator)]
}

fn validate_config(config: &Config, validators: &[Box<dyn ConfigValidator>]) -> Result<()> {
    for validator in validators {
        validator.validate(config).map_err(|e| Error::config(e.to_string()))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct ConfigSnapshot {
    config: Config,
    timestamp: SystemTime,
    version: String,
}

/// Loads, validates, and optionally watches a TOML configuration file,
/// keeping a small rollback history of prior versions.
pub struct ConfigManager {
    current: RwLock<Config>,
    config_path: PathBuf,
    change_tx: mpsc::Sender<Config>,
    change_rx: RwLock<Option<mpsc::Receiver<Config>>>,
    history: RwLock<Vec<ConfigSnapshot>>,
    validators: Vec<Box<dyn ConfigValidator>>,
}

impl ConfigManager {
    /// Load and validate the configuration at `config_path`.
    pub fn new(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let initial = Self::load_from_file(&config_path)?;
        let validators = default_validators();
        validate_config(&initial, &validators)?;

        let (change_tx, change_rx) = mpsc::channel();

        Ok(Self {
            current: RwLock::new(initial.clone()),
            config_path,
            change_tx,
            change_rx: RwLock::new(Some(change_rx)),
            history: RwLock::new(vec![ConfigSnapshot {
                config: initial,
                timestamp: SystemTime::now(),
                version: "initial".to_string(),
            }]),
            validators,
        })
    }

    /// Spawn a dedicated watcher thread that polls the file's mtime every
    /// `poll_interval` and pushes reparsed configs through the channel
    /// returned by [`ConfigManager::subscribe`]. The watcher never touches
    /// loop state directly — the owner is expected to drain the channel from
    /// inside a `queue_work` callback on the reactor thread, consistent with
    /// the rule that only `queue_work`/`wake` cross thread boundaries.
    pub fn watch(&self, poll_interval: Duration) {
        let path = self.config_path.clone();
        let tx = self.change_tx.clone();
        std::thread::spawn(move || {
            let mut last_modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
            loop {
                std::thread::sleep(poll_interval);
                let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "config watch: failed to stat file");
                        continue;
                    }
                };
                if Some(modified) == last_modified {
                    continue;
                }
                last_modified = Some(modified);
                match Self::load_from_file(&path) {
                    Ok(config) => {
                        if tx.send(config).is_err() {
                            return;
                        }
                    }
                    Err(e) => error!(error = %e, "config watch: failed to reload"),
                }
            }
        });
    }

    /// Take the receiving half of the change channel. Callable once; later
    /// calls return `None`.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<Config>> {
        self.change_rx.write().unwrap().take()
    }

    pub fn get(&self) -> Config {
        self.current.read().unwrap().clone()
    }

    pub fn update(&self, new_config: Config, version: impl Into<String>) -> Result<()> {
        validate_config(&new_config, &self.validators)?;
        let version = version.into();

        *self.current.write().unwrap() = new_config.clone();
        self.history.write().unwrap().push(ConfigSnapshot {
            config: new_config.clone(),
            timestamp: SystemTime::now(),
            version,
        });

        let _ = self.change_tx.send(new_config);
        info!("configuration updated");
        Ok(())
    }

    pub fn rollback(&self, version: &str) -> Result<()> {
        let history = self.history.read().unwrap();
        let snapshot = history
            .iter()
            .find(|s| s.version == version)
            .ok_or_else(|| Error::config(format!("configuration version '{version}' not found")))?;

        *self.current.write().unwrap() = snapshot.config.clone();
        let _ = self.change_tx.send(snapshot.config.clone());
        info!(version, "configuration rolled back");
        Ok(())
    }

    fn load_from_file(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("failed to parse config: {e}")))
    }
}

/// Environment variable overrides, applied on top of a loaded/built config.
/// Mirrors the teacher's `SQUALL_<SECTION>_<FIELD>` convention.
pub struct EnvironmentConfig {
    prefix: String,
}

impl EnvironmentConfig {
    pub fn new() -> Self {
        Self { prefix: "SQUALL_".to_string() }
    }

    pub fn load_overrides(&self, mut config: Config) -> Config {
        if let Ok(v) = std::env::var(format!("{}MQTT_KEEPALIVE_SECONDS", self.prefix)) {
            if let Ok(v) = v.parse() {
                config.mqtt.keepalive_seconds = v;
            }
        }
        if let Ok(v) = std::env::var(format!("{}TCP_CONNECT_TIMEOUT_MS", self.prefix)) {
            if let Ok(v) = v.parse() {
                config.tcp.connect_timeout_ms = v;
            }
        }
        if let Ok(v) = std::env::var(format!("{}LOGGING_LEVEL", self.prefix)) {
            config.logging.level = v;
        }
        config
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_valid() {
        let config = ConfigBuilder::new().build();
        let validators = default_validators();
        assert!(validate_config(&config, &validators).is_ok());
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let mut config = ConfigBuilder::new().build();
        config.tls = Some(TlsConfig { cert_file: String::new(), ..TlsConfig::default() });
        let validators = default_validators();
        assert!(validate_config(&config, &validators).is_err());
    }

    #[test]
    fn mqtt_reconnect_bounds_validated() {
        let mut config = ConfigBuilder::new().build();
        config.mqtt.reconnect_min_delay_ms = 60_000;
        config.mqtt.reconnect_max_delay_ms = 1_000;
        let validators = default_validators();
        assert!(validate_config(&config, &validators).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("SQUALL_MQTT_KEEPALIVE_SECONDS", "45");
        let config = EnvironmentConfig::new().load_overrides(ConfigBuilder::new().build());
        assert_eq!(config.mqtt.keepalive_seconds, 45);
        std::env::remove_var("SQUALL_MQTT_KEEPALIVE_SECONDS");
    }
}
