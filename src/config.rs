//! YAML configuration: types, defaults, and cross-field validation.
//!
//! Every field has a default so an omitted key is never a parse error; only
//! `validate()` enforces the invariants YAML's type system cannot express
//! (unique ports, non-empty ids). Reload calls `Config::load` again and
//! only swaps the snapshot in on success, so a bad reload keeps the old
//! config running (§4.7 of the design notes).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

fn default_poll_interval() -> u64 {
    15
}
fn default_request_timeout() -> u64 {
    10
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_idle_timeout_minutes() -> u64 {
    10
}
fn default_start_timeout_seconds() -> u64 {
    180
}
fn default_stop_timeout_seconds() -> u64 {
    120
}
fn default_stop_cooldown_seconds() -> u64 {
    60
}
fn default_start_grace_seconds() -> u64 {
    120
}
fn default_flap_threshold() -> u32 {
    3
}
fn default_flap_window_seconds() -> u64 {
    3600
}
fn default_motd() -> String {
    "Napping... Join to start server".to_string()
}
fn default_version_name() -> String {
    "Craftynap".to_string()
}
fn default_protocol_version() -> i32 {
    765
}
fn default_max_players() -> u32 {
    20
}
fn default_starting_kick_message() -> String {
    "Server is starting up. Please try again shortly...".to_string()
}
fn default_health_port() -> u16 {
    8095
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub controller: ControllerConfig,
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub base_url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Java,
    Bedrock,
}

impl Default for ServerKind {
    fn default() -> Self {
        ServerKind::Java
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeOnPing {
    Always,
    Repeated,
    Never,
}

impl Default for WakeOnPing {
    fn default() -> Self {
        WakeOnPing::Repeated
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BedrockConfig {
    #[serde(default)]
    pub wake_on_ping: WakeOnPing,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub crafty_server_id: String,
    #[serde(default)]
    pub kind: ServerKind,
    pub listen_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,
    #[serde(default = "default_start_timeout_seconds")]
    pub start_timeout_seconds: u64,
    #[serde(default = "default_stop_timeout_seconds")]
    pub stop_timeout_seconds: u64,
    #[serde(default = "default_stop_cooldown_seconds")]
    pub stop_cooldown_seconds: u64,
    #[serde(default = "default_start_grace_seconds")]
    pub start_grace_seconds: u64,
    #[serde(default = "default_flap_threshold")]
    pub flap_threshold: u32,
    #[serde(default = "default_flap_window_seconds")]
    pub flap_window_seconds: u64,
    #[serde(default = "default_motd")]
    pub motd: String,
    #[serde(default = "default_version_name")]
    pub version_name: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default = "default_starting_kick_message")]
    pub starting_kick_message: String,
    #[serde(default)]
    pub bedrock: BedrockConfig,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    pub fn stop_cooldown(&self) -> Duration {
        Duration::from_secs(self.stop_cooldown_seconds)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_seconds)
    }

    pub fn flap_window(&self) -> Duration {
        Duration::from_secs(self.flap_window_seconds)
    }

    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.listen_port)
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(format!(
                    "invalid bind address {}:{}",
                    self.bind_address, self.listen_port
                ))
            })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_port")]
    pub listen_port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            listen_port: default_health_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    pub url: Option<String>,
}

impl Config {
    /// Load and validate config from a YAML file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path_ref = path.as_ref();
        let contents = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "controller.base_url must not be empty".to_string(),
            ));
        }

        if self.servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one server must be configured".to_string(),
            ));
        }

        let mut seen_ports: HashMap<u16, &str> = HashMap::new();
        for (name, server) in &self.servers {
            if server.crafty_server_id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "servers.{name}.crafty_server_id must not be empty"
                )));
            }
            if server.flap_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "servers.{name}.flap_threshold must be at least 1"
                )));
            }
            if let Some(other) = seen_ports.insert(server.listen_port, name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "servers.{name} and servers.{other} both claim listen_port {}",
                    server.listen_port
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
controller:
  base_url: "http://localhost:8000"
servers:
  survival:
    crafty_server_id: "abc-123"
    listen_port: 25565
"#
    }

    #[test]
    fn defaults_fill_in_omitted_fields() {
        let config: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.validate().unwrap();
        let server = &config.servers["survival"];
        assert_eq!(server.kind, ServerKind::Java);
        assert_eq!(server.idle_timeout_minutes, 10);
        assert_eq!(server.bind_address, "0.0.0.0");
        assert_eq!(config.health.listen_port, 8095);
        assert_eq!(config.controller.poll_interval_seconds, 15);
    }

    #[test]
    fn rejects_duplicate_ports() {
        let yaml = r#"
controller:
  base_url: "http://localhost:8000"
servers:
  a:
    crafty_server_id: "a"
    listen_port: 25565
  b:
    crafty_server_id: "b"
    listen_port: 25565
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_base_url() {
        let yaml = r#"
controller:
  base_url: ""
servers:
  a:
    crafty_server_id: "a"
    listen_port: 25565
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
