use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::KeyAlgorithm;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectParseMode {
    #[default]
    Strict,
    Lenient,
}

const DAY_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MockServerConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub connect_parse_mode: ConnectParseMode,
    pub max_http_head_bytes: usize,
    pub max_http_body_bytes: usize,
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub ca_locality: String,
    pub ca_state: String,
    pub ca_country: String,
    pub key_algorithm: KeyAlgorithm,
    pub certificate_backdate_seconds: u64,
    pub certificate_validity_seconds: u64,
    pub leaf_subject_alternative_names: Vec<String>,
    pub leaf_cert_cache_capacity: usize,
    pub leaf_cert_cache_ttl_ms: u64,
    pub tls_interception_enabled: bool,
    pub relay_hosts: Vec<String>,
    pub upstream_connect_timeout_ms: u64,
    pub tls_handshake_timeout_ms: u64,
    pub tunnel_idle_timeout_ms: u64,
    pub tunnel_half_close_timeout_ms: u64,
    pub always_close_socket_connections: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 1080,
            connect_parse_mode: ConnectParseMode::Strict,
            max_http_head_bytes: 64 * 1024,
            max_http_body_bytes: 8 * 1024 * 1024,
            ca_cert_pem_path: None,
            ca_key_pem_path: None,
            ca_common_name: "mock-proxy Local CA".to_string(),
            ca_organization: "mock-proxy".to_string(),
            ca_locality: "London".to_string(),
            ca_state: "England".to_string(),
            ca_country: "GB".to_string(),
            key_algorithm: KeyAlgorithm::default(),
            certificate_backdate_seconds: 5 * DAY_SECONDS,
            certificate_validity_seconds: 365 * DAY_SECONDS,
            leaf_subject_alternative_names: Vec::new(),
            leaf_cert_cache_capacity: 1024,
            leaf_cert_cache_ttl_ms: 60 * 60 * 1000,
            tls_interception_enabled: true,
            relay_hosts: Vec::new(),
            upstream_connect_timeout_ms: 10_000,
            tls_handshake_timeout_ms: 5_000,
            tunnel_idle_timeout_ms: 30_000,
            tunnel_half_close_timeout_ms: 2_000,
            always_close_socket_connections: false,
        }
    }
}

impl MockServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::EmptyListenAddr);
        }
        if self.max_http_head_bytes == 0 {
            return Err(ConfigError::ZeroValue("max_http_head_bytes"));
        }
        if self.max_http_body_bytes == 0 {
            return Err(ConfigError::ZeroValue("max_http_body_bytes"));
        }
        if self.certificate_validity_seconds == 0 {
            return Err(ConfigError::ZeroValue("certificate_validity_seconds"));
        }
        if self.leaf_cert_cache_ttl_ms == 0 {
            return Err(ConfigError::ZeroValue("leaf_cert_cache_ttl_ms"));
        }
        if self.upstream_connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("upstream_connect_timeout_ms"));
        }
        if self.tls_handshake_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("tls_handshake_timeout_ms"));
        }
        if self.tunnel_idle_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("tunnel_idle_timeout_ms"));
        }
        if self.tunnel_half_close_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("tunnel_half_close_timeout_ms"));
        }
        if self.ca_cert_pem_path.is_some() != self.ca_key_pem_path.is_some() {
            return Err(ConfigError::InvalidCaPathPair);
        }
        require_non_empty(&self.ca_common_name, ConfigError::EmptyCaCommonName)?;
        require_non_empty(&self.ca_organization, ConfigError::EmptyCaOrganization)?;
        if self.ca_country.len() != 2 || !self.ca_country.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(ConfigError::InvalidCaCountry(self.ca_country.clone()));
        }
        validate_host_list(&self.relay_hosts, "relay_hosts")?;
        validate_host_list(
            &self.leaf_subject_alternative_names,
            "leaf_subject_alternative_names",
        )?;
        Ok(())
    }

    pub fn certificate_backdate(&self) -> Duration {
        Duration::from_secs(self.certificate_backdate_seconds)
    }

    pub fn certificate_validity(&self) -> Duration {
        Duration::from_secs(self.certificate_validity_seconds)
    }

    pub fn leaf_cert_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.leaf_cert_cache_ttl_ms)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    pub fn tunnel_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_idle_timeout_ms)
    }

    /// How long the surviving direction may keep flowing after the other side reached EOF.
    pub fn tunnel_half_close_timeout(&self) -> Duration {
        Duration::from_millis(self.tunnel_half_close_timeout_ms)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("listen_addr must not be empty")]
    EmptyListenAddr,
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("ca_cert_pem_path and ca_key_pem_path must be provided together")]
    InvalidCaPathPair,
    #[error("ca_common_name must not be empty")]
    EmptyCaCommonName,
    #[error("ca_organization must not be empty")]
    EmptyCaOrganization,
    #[error("ca_country must be a two-letter country code, got {0:?}")]
    InvalidCaCountry(String),
    #[error("{field} contains an empty host entry")]
    EmptyHostEntry { field: &'static str },
}

fn validate_host_list(hosts: &[String], field: &'static str) -> Result<(), ConfigError> {
    if hosts.iter().any(|host| host.trim().is_empty()) {
        return Err(ConfigError::EmptyHostEntry { field });
    }
    Ok(())
}

fn require_non_empty(value: &str, error: ConfigError) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(error);
    }
    Ok(())
}
