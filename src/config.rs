//! # Configuration Management
//!
//! Centralized configuration for the secure channel layer.
//!
//! ## Sections
//! - `[channel]`: buffer sizes and limits advertised in Hello / Acknowledge
//! - `[limits]`: bounds enforced by the binary decoder
//! - `[client]`: endpoint, security settings, timeouts and reconnect backoff
//! - `[logging]`: tracing subscriber settings
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - `OPCUA_CHANNEL_*` environment variables via `from_env()`
//! - Direct instantiation with defaults
//!
//! Durations are written as milliseconds.

use crate::core::messages::MIN_BUFFER_SIZE;
use crate::error::{ProtocolError, Result};
use crate::protocol::policy::{MessageSecurityMode, SecurityPolicy};
use crate::transport::tcp::EndpointUrl;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default max chunk size, advertised as both receive and send buffer size.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 65_535;

/// Default max message size (2 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Default max chunk count: twice what the max message needs at full chunks.
pub const DEFAULT_MAX_CHUNK_COUNT: usize = DEFAULT_MAX_MESSAGE_SIZE / DEFAULT_MAX_CHUNK_SIZE * 2;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub limits: EncodingLimits,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `OPCUA_CHANNEL_*` environment variables.
    ///
    /// Unparseable numeric values are ignored; an unknown security policy or
    /// mode name is an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("OPCUA_CHANNEL_ENDPOINT_URL") {
            config.client.endpoint_url = url;
        }

        if let Ok(name) = std::env::var("OPCUA_CHANNEL_SECURITY_POLICY") {
            config.client.security_policy = SecurityPolicy::ALL
                .into_iter()
                .find(|p| p.name().eq_ignore_ascii_case(&name))
                .ok_or_else(|| {
                    ProtocolError::ConfigError(format!("Unknown security policy: {name}"))
                })?;
        }

        if let Ok(mode) = std::env::var("OPCUA_CHANNEL_SECURITY_MODE") {
            config.client.security_mode = match mode.to_ascii_lowercase().as_str() {
                "none" => MessageSecurityMode::None,
                "sign" => MessageSecurityMode::Sign,
                "signandencrypt" | "sign_and_encrypt" => MessageSecurityMode::SignAndEncrypt,
                _ => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown security mode: {mode}"
                    )))
                }
            };
        }

        if let Some(ms) = env_parse::<u64>("OPCUA_CHANNEL_CONNECT_TIMEOUT_MS") {
            config.client.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("OPCUA_CHANNEL_REQUEST_TIMEOUT_MS") {
            config.client.request_timeout = Duration::from_millis(ms);
        }

        if let Some(size) = env_parse::<usize>("OPCUA_CHANNEL_MAX_CHUNK_SIZE") {
            config.channel.max_chunk_size = size;
        }

        if let Some(size) = env_parse::<usize>("OPCUA_CHANNEL_MAX_MESSAGE_SIZE") {
            config.channel.max_message_size = size;
            config.limits.max_message_size = size;
        }

        if let Some(count) = env_parse::<usize>("OPCUA_CHANNEL_MAX_CHUNK_COUNT") {
            config.channel.max_chunk_count = count;
        }

        if let Some(level) = env_parse::<Level>("OPCUA_CHANNEL_LOG_LEVEL") {
            config.logging.log_level = level;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Returns every problem found. Empty means the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.channel.validate());
        errors.extend(self.limits.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Local transport limits, advertised to the peer in Hello / Acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest chunk this side sends or accepts.
    pub max_chunk_size: usize,

    /// Largest reassembled message this side accepts.
    pub max_message_size: usize,

    /// Most chunks per message this side accepts.
    pub max_chunk_count: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_chunk_count: DEFAULT_MAX_CHUNK_COUNT,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_chunk_size < MIN_BUFFER_SIZE as usize {
            errors.push(format!(
                "Max chunk size too small: {} (minimum: {MIN_BUFFER_SIZE})",
                self.max_chunk_size
            ));
        } else if self.max_chunk_size > u32::MAX as usize {
            errors.push("Max chunk size does not fit in 32 bits".to_string());
        }

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        } else if self.max_message_size > u32::MAX as usize {
            errors.push("Max message size does not fit in 32 bits".to_string());
        }

        if self.max_chunk_count == 0 {
            errors.push("Max chunk count cannot be 0".to_string());
        }

        errors
    }
}

/// Bounds enforced while encoding and decoding built-in types.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EncodingLimits {
    /// Upper bound on any single length-prefixed value and on a whole message.
    pub max_message_size: usize,

    /// Most elements in one array.
    pub max_array_length: usize,

    /// Most bytes in one string or byte string.
    pub max_string_length: usize,

    /// Deepest nesting of Variant / DiagnosticInfo / ExtensionObject.
    pub max_recursion_depth: usize,
}

impl Default for EncodingLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_array_length: 65_535,
            max_string_length: 65_535,
            max_recursion_depth: 64,
        }
    }
}

impl EncodingLimits {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("Encoding max message size cannot be 0".to_string());
        }
        if self.max_array_length == 0 {
            errors.push("Max array length cannot be 0".to_string());
        }
        if self.max_string_length == 0 {
            errors.push("Max string length cannot be 0".to_string());
        }
        if self.max_recursion_depth == 0 {
            errors.push("Max recursion depth cannot be 0".to_string());
        } else if self.max_recursion_depth > 1024 {
            errors.push(format!(
                "Max recursion depth too large: {} (maximum: 1024)",
                self.max_recursion_depth
            ));
        }

        errors
    }
}

/// Client connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint, `opc.tcp://host:port/path`
    pub endpoint_url: String,

    pub security_policy: SecurityPolicy,

    pub security_mode: MessageSecurityMode,

    /// DER application instance certificate (secured policies only)
    pub certificate_path: Option<String>,

    /// PEM private key matching `certificate_path`
    pub private_key_path: Option<String>,

    /// DER certificate of the server (secured policies only)
    pub server_certificate_path: Option<String>,

    /// Bound on the TCP connect
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Bound on waiting for the Acknowledge after sending Hello
    #[serde(with = "duration_serde")]
    pub hello_timeout: Duration,

    /// Default per-request timeout
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Requested secure channel lifetime
    #[serde(with = "duration_serde")]
    pub channel_lifetime: Duration,

    /// Bound on the CloseSecureChannel exchange at disconnect
    #[serde(with = "duration_serde")]
    pub close_timeout: Duration,

    /// One backoff unit; reconnect delays are 1, 2, 4, ... units
    #[serde(with = "duration_serde")]
    pub reconnect_delay_unit: Duration,

    /// Cap on the reconnect delay, in units
    pub max_reconnect_delay: u32,

    /// Decoded messages that may wait for delivery before the reader backs off
    pub decode_queue_capacity: usize,

    /// Most requests in flight at once
    pub max_pending_requests: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::from("opc.tcp://localhost:4840"),
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            certificate_path: None,
            private_key_path: None,
            server_certificate_path: None,
            connect_timeout: timeout::DEFAULT_CONNECT_TIMEOUT,
            hello_timeout: timeout::HELLO_TIMEOUT,
            request_timeout: timeout::DEFAULT_REQUEST_TIMEOUT,
            channel_lifetime: Duration::from_secs(60 * 60),
            close_timeout: timeout::CLOSE_TIMEOUT,
            reconnect_delay_unit: Duration::from_secs(1),
            max_reconnect_delay: 16,
            decode_queue_capacity: 1024,
            max_pending_requests: 4096,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = EndpointUrl::parse(&self.endpoint_url) {
            errors.push(format!("Invalid endpoint URL '{}': {e}", self.endpoint_url));
        }

        let secured = self.security_policy != SecurityPolicy::None;
        match (secured, self.security_mode) {
            (_, MessageSecurityMode::Invalid) => {
                errors.push("Security mode Invalid cannot be used".to_string());
            }
            (false, MessageSecurityMode::Sign | MessageSecurityMode::SignAndEncrypt) => {
                errors.push(format!(
                    "Security mode {:?} requires a security policy",
                    self.security_mode
                ));
            }
            (true, MessageSecurityMode::None) => {
                errors.push(format!(
                    "Security policy {} requires mode Sign or SignAndEncrypt",
                    self.security_policy
                ));
            }
            _ => {}
        }

        if secured {
            for (name, path) in [
                ("certificate_path", &self.certificate_path),
                ("private_key_path", &self.private_key_path),
                ("server_certificate_path", &self.server_certificate_path),
            ] {
                match path {
                    None => errors.push(format!(
                        "{name} must be set for security policy {}",
                        self.security_policy
                    )),
                    Some(p) if !Path::new(p).exists() => {
                        errors.push(format!("{name} does not exist: {p}"));
                    }
                    Some(_) => {}
                }
            }
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.hello_timeout.as_millis() < 100 {
            errors.push("Hello timeout too short (minimum: 100ms)".to_string());
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        }

        if self.channel_lifetime.as_secs() < 10 {
            errors.push("Channel lifetime too short (minimum: 10s)".to_string());
        } else if self.channel_lifetime.as_millis() > u32::MAX as u128 {
            errors.push("Channel lifetime does not fit in 32 bits of milliseconds".to_string());
        }

        if self.reconnect_delay_unit.as_millis() < 10 {
            errors.push("Reconnect delay unit too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay_unit.as_secs() > 60 {
            errors.push("Reconnect delay unit too long (maximum: 60s)".to_string());
        }

        if self.max_reconnect_delay == 0 {
            errors.push("Max reconnect delay must be at least 1 unit".to_string());
        }

        if self.decode_queue_capacity == 0 {
            errors.push("Decode queue capacity must be greater than 0".to_string());
        }

        if self.max_pending_requests == 0 {
            errors.push("Max pending requests must be greater than 0".to_string());
        } else if self.max_pending_requests > u16::MAX as usize + 1 {
            errors.push(format!(
                "Max pending requests too large: {} (maximum: 65536)",
                self.max_pending_requests
            ));
        }

        errors
    }
}

/// Where channel diagnostics go and how verbose they are.
///
/// Consumed by [`crate::utils::logging::init_logging`]; `RUST_LOG` still
/// overrides `log_level` at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Recorded once at startup so several clients sharing a log can be told apart.
    pub app_name: String,

    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub log_to_console: bool,
    pub log_to_file: bool,
    /// Required when `log_to_file` is set; appended to, never truncated.
    pub log_file_path: Option<String>,
    /// One JSON object per event instead of the human readable format.
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("opcua-channel"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.trim().is_empty() {
            errors.push("Logging app_name cannot be blank".to_string());
        }

        match (self.log_to_file, self.log_file_path.as_deref()) {
            (true, None) => {
                errors.push("log_file_path must be specified when log_to_file is true".to_string())
            }
            (true, Some(path)) => {
                let parent = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty());
                if let Some(dir) = parent.filter(|dir| !dir.is_dir()) {
                    errors.push(format!("Log directory {} does not exist", dir.display()));
                }
            }
            (false, _) => {}
        }

        if !self.log_to_console && !self.log_to_file {
            errors.push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Levels as lowercase names (`"debug"`, `"warn"`, ...)
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        name.parse::<Level>()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level {name:?}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
        assert_eq!(DEFAULT_MAX_CHUNK_COUNT, 64);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [client]
            endpoint_url = "opc.tcp://plc.local:4840/server"
            request_timeout = 2500

            [channel]
            max_chunk_size = 8192
            "#,
        )
        .unwrap();
        assert_eq!(config.client.endpoint_url, "opc.tcp://plc.local:4840/server");
        assert_eq!(config.client.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.client.max_reconnect_delay, 16);
        assert_eq!(config.channel.max_chunk_size, 8192);
        assert_eq!(config.channel.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_secured_policy_requires_files_and_mode() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.client.security_policy = SecurityPolicy::Basic256Sha256;
        });
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("requires mode")));
        assert!(errors.iter().any(|e| e.contains("certificate_path")));
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn test_small_chunk_size_rejected() {
        let config = NetworkConfig::default_with_overrides(|c| c.channel.max_chunk_size = 1024);
        assert_eq!(config.validate().len(), 1);
    }
}
